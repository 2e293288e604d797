//! Conversion between plaintext token pairs and storable credential fields.
//!
//! This module provides:
//! - [`build_credential_payload`] - encrypt, hash and timestamp a token pair
//! - [`hash_refresh_token`] / [`verify_refresh_token`] - salted PBKDF2 digest
//! - [`is_expired`] / [`is_expired_at`] - expiry checks on absolute instants
//! - [`parse_timestamp`] - reads stored timestamps, treating naive ones as UTC
//!
//! The refresh-token digest is PBKDF2-HMAC-SHA256 with [`KDF_ITERATIONS`]
//! rounds over a per-write random salt.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::cipher::{self, CipherError, EncryptionKey};
use crate::model::Secret;

/// PBKDF2 rounds for the refresh-token digest.
pub const KDF_ITERATIONS: u32 = 100_000;

/// Access-token lifetime used when the caller does not give one.
pub const DEFAULT_TTL_SECONDS: i64 = 3600;

const SALT_BYTES: usize = 16;
const IV_BYTES: usize = 12;
const HASH_BYTES: usize = 32;

/// Every field written to a credential record on a full save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPayload {
    pub encrypted_access: String,
    pub encrypted_refresh: String,
    pub refresh_hash: String,
    pub salt: String,
    /// Audit nonce, independent of the cipher's own nonce.
    pub iv: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Encrypt both tokens, digest the refresh token and stamp the expiry.
pub fn build_credential_payload(
    access_token: &Secret,
    refresh_token: &Secret,
    ttl_seconds: i64,
    key: &EncryptionKey,
    now: DateTime<Utc>,
) -> Result<CredentialPayload, CipherError> {
    let encrypted_access = cipher::encrypt(access_token.expose(), key)?;
    let encrypted_refresh = cipher::encrypt(refresh_token.expose(), key)?;
    let (refresh_hash, salt) = hash_refresh_token(refresh_token.expose(), None);

    Ok(CredentialPayload {
        encrypted_access,
        encrypted_refresh,
        refresh_hash,
        salt,
        iv: random_hex(IV_BYTES),
        expires_at: expiry_time(ttl_seconds, now),
        updated_at: now,
    })
}

/// Digest a refresh token, returning `(hash, salt)` as hex strings.
///
/// A fresh random salt is generated unless one is supplied.
pub fn hash_refresh_token(refresh_token: &str, salt: Option<&str>) -> (String, String) {
    let salt = match salt {
        Some(salt) => salt.to_string(),
        None => random_hex(SALT_BYTES),
    };

    let mut digest = [0u8; HASH_BYTES];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        refresh_token.as_bytes(),
        salt.as_bytes(),
        KDF_ITERATIONS,
        &mut digest,
    );

    (hex::encode(digest), salt)
}

/// Check a candidate refresh token against a stored hash and salt.
///
/// The final comparison runs in constant time.
pub fn verify_refresh_token(candidate: &str, stored_hash: &str, stored_salt: &str) -> bool {
    let (computed, _) = hash_refresh_token(candidate, Some(stored_salt));
    computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// Absolute expiry for a TTL counted from `now`.
///
/// Saturates at the bounds of [`clamp_storable`] on absurd TTLs.
pub fn expiry_time(ttl_seconds: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    let expires_at = Duration::try_seconds(ttl_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(if ttl_seconds < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        });
    clamp_storable(expires_at)
}

/// Pull an instant into years 0001..=9999.
///
/// Instants outside that range have no four-digit RFC 3339 form, so they
/// could be written but never parsed back.
pub fn clamp_storable(ts: DateTime<Utc>) -> DateTime<Utc> {
    let earliest = NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt: NaiveDateTime| dt.and_utc());
    let latest = NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_micro_opt(23, 59, 59, 999_999))
        .map(|dt: NaiveDateTime| dt.and_utc());

    match (earliest, latest) {
        (Some(earliest), Some(latest)) => ts.clamp(earliest, latest),
        _ => ts,
    }
}

/// Whether an access token with this expiry is expired right now.
///
/// A missing expiry counts as expired.
pub fn is_expired(expires_at: Option<DateTime<Utc>>) -> bool {
    is_expired_at(expires_at, Utc::now())
}

/// Whether an access token with this expiry is expired at `now`.
pub fn is_expired_at(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(expires_at) => now >= expires_at,
        None => true,
    }
}

/// Interpret a timestamp without an offset as UTC.
pub fn normalize_naive(naive: NaiveDateTime) -> DateTime<Utc> {
    naive.and_utc()
}

/// Parse a stored timestamp.
///
/// Accepts RFC 3339 with any offset (converted to UTC) and offset-less
/// `YYYY-MM-DD HH:MM:SS[.f]` / `YYYY-MM-DDTHH:MM:SS[.f]` values, which are
/// taken to be UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(normalize_naive)
}

/// Hex-encoded random bytes.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::derive_key;

    #[test]
    fn test_build_payload() {
        let key = derive_key("codec-test");
        let now = Utc::now();
        let payload = build_credential_payload(
            &Secret::new("AT123"),
            &Secret::new("RT456"),
            3600,
            &key,
            now,
        )
        .unwrap();

        assert_eq!(cipher::decrypt(&payload.encrypted_access, &key).unwrap(), "AT123");
        assert_eq!(cipher::decrypt(&payload.encrypted_refresh, &key).unwrap(), "RT456");
        assert!(verify_refresh_token("RT456", &payload.refresh_hash, &payload.salt));
        assert_eq!(payload.expires_at, now + Duration::seconds(3600));
        assert_eq!(payload.updated_at, now);
        assert_eq!(payload.salt.len(), SALT_BYTES * 2);
        assert_eq!(payload.iv.len(), IV_BYTES * 2);
        assert_eq!(payload.refresh_hash.len(), HASH_BYTES * 2);
    }

    #[test]
    fn test_hash_verification() {
        let (hash, salt) = hash_refresh_token("refresh-token", None);
        assert!(verify_refresh_token("refresh-token", &hash, &salt));
        assert!(!verify_refresh_token("refresh-tokem", &hash, &salt));
        assert!(!verify_refresh_token("", &hash, &salt));
    }

    #[test]
    fn test_hash_uses_fresh_salt() {
        let (hash_a, salt_a) = hash_refresh_token("same", None);
        let (hash_b, salt_b) = hash_refresh_token("same", None);
        assert_ne!(salt_a, salt_b);
        assert_ne!(hash_a, hash_b);

        let (again, _) = hash_refresh_token("same", Some(&salt_a));
        assert_eq!(again, hash_a);
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        let (_, salt) = hash_refresh_token("token", None);
        assert!(!verify_refresh_token("token", "not-a-hash", &salt));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        assert!(is_expired(Some(now - Duration::seconds(1))));
        assert!(!is_expired(Some(now + Duration::seconds(3600))));
        assert!(is_expired(None));
        assert!(is_expired_at(Some(now), now));
    }

    #[test]
    fn test_expiry_time_saturates_within_storable_years() {
        let now = Utc::now();
        let latest = expiry_time(i64::MAX, now);
        assert_eq!(latest.to_rfc3339(), "9999-12-31T23:59:59.999999+00:00");
        assert_eq!(expiry_time(i64::MIN, now).to_rfc3339(), "0001-01-01T00:00:00+00:00");
        assert_eq!(expiry_time(-10, now), now - Duration::seconds(10));

        // Representable, but twelve thousand years out
        let far_future = 400 * 365 * 24 * 3600 * 30;
        assert_eq!(expiry_time(far_future, now), latest);
    }

    #[test]
    fn test_clamped_expiry_parses_back() {
        let now = Utc::now();
        for ttl in [i64::MAX, i64::MIN, 400 * 365 * 24 * 3600 * 30] {
            let expires_at = expiry_time(ttl, now);
            let text = expires_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
            assert_eq!(parse_timestamp(&text), Some(expires_at), "ttl {}", ttl);
        }
        assert_eq!(clamp_storable(now), now);
    }

    #[test]
    fn test_parse_timestamp_normalizes_naive() {
        let aware = parse_timestamp("2025-01-01T12:00:00+03:00").unwrap();
        assert_eq!(aware.to_rfc3339(), "2025-01-01T09:00:00+00:00");

        let naive = parse_timestamp("2025-01-01 09:00:00").unwrap();
        assert_eq!(naive, aware);

        let naive_t = parse_timestamp("2025-01-01T09:00:00.000").unwrap();
        assert_eq!(naive_t, aware);

        assert!(parse_timestamp("yesterday").is_none());
    }
}
