//! Domain model types for credvault.
//!
//! This module defines the core types used throughout credvault:
//! - [`PrincipalId`] - Identifier for a user or the group principal
//! - [`Principal`] - The identity that owns a credential record
//! - [`CredentialRecord`] - Encrypted token fields stored per principal
//! - [`TokenInfo`] - Summary of a principal's token state
//! - [`TokenUpdate`] - Partial update of a principal's tokens
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::mask::Masked;
use crate::store::StoreError;

/// Principal that holds the community/group token.
pub const GROUP_PRINCIPAL_ID: PrincipalId = PrincipalId(900_000_009);

/// Default lower bound of the search age range on a new record.
pub const DEFAULT_MIN_AGE: u8 = 18;

/// Default upper bound of the search age range on a new record.
pub const DEFAULT_MAX_AGE: u8 = 35;

/// Identifier for a principal (a user or the group).
///
/// # Examples
///
/// ```
/// use credvault_core::{PrincipalId, GROUP_PRINCIPAL_ID};
///
/// let user = PrincipalId::new(42);
/// assert!(!user.is_group());
/// assert!(GROUP_PRINCIPAL_ID.is_group());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrincipalId(i64);

impl PrincipalId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether this is the distinguished group principal.
    pub fn is_group(self) -> bool {
        self == GROUP_PRINCIPAL_ID
    }

    /// Subject id to tag log entries with.
    ///
    /// Group activity is logged as system-scoped (`0`).
    pub fn log_subject(self) -> i64 {
        if self.is_group() { 0 } else { self.0 }
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PrincipalId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A user or the group identity.
///
/// Only `id` matters to credential handling; the display attributes exist
/// so a principal row can be created on first use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub first_name: String,
    pub last_name: String,
    pub age: Option<u8>,
    /// 1 = female, 2 = male, 0 = any/unspecified
    pub sex: Option<u8>,
    pub city: Option<String>,
    pub city_id: Option<i64>,
}

impl Principal {
    /// Minimal stand-in created when credentials arrive for an unknown id.
    ///
    /// The group principal gets its own fixed identity.
    pub fn placeholder(id: PrincipalId) -> Self {
        if id.is_group() {
            return Self {
                id,
                first_name: "Group".to_string(),
                last_name: "Administrator".to_string(),
                age: Some(99),
                sex: Some(0),
                city: Some("Moscow".to_string()),
                city_id: Some(1),
            };
        }

        Self {
            id,
            first_name: "User".to_string(),
            last_name: "Unknown".to_string(),
            age: None,
            sex: None,
            city: None,
            city_id: None,
        }
    }

    /// Check the fields required before a principal may be inserted.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.id.get() <= 0 {
            return Err(StoreError::validation(format!(
                "principal id must be positive, got {}",
                self.id
            )));
        }
        if self.first_name.trim().is_empty() || self.last_name.trim().is_empty() {
            return Err(StoreError::validation(format!(
                "principal {} requires a first and last name",
                self.id
            )));
        }
        Ok(())
    }
}

/// Per-principal settings row holding the encrypted credentials.
///
/// `refresh_token_hash` and `token_salt` are always set or cleared together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub principal_id: PrincipalId,
    pub min_age: u8,
    pub max_age: u8,
    pub encrypted_access_token: Option<String>,
    pub encrypted_refresh_token: Option<String>,
    pub refresh_token_hash: Option<String>,
    pub token_salt: Option<String>,
    pub token_iv: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub token_updated_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Empty record with default search settings.
    pub fn new(principal_id: PrincipalId) -> Self {
        Self {
            principal_id,
            min_age: DEFAULT_MIN_AGE,
            max_age: DEFAULT_MAX_AGE,
            encrypted_access_token: None,
            encrypted_refresh_token: None,
            refresh_token_hash: None,
            token_salt: None,
            token_iv: None,
            token_expires_at: None,
            token_updated_at: None,
        }
    }

    /// Both an access ciphertext and a refresh hash are present.
    pub fn has_tokens(&self) -> bool {
        self.encrypted_access_token.is_some() && self.refresh_token_hash.is_some()
    }

    /// Null every credential field, keeping the row and its settings.
    pub fn clear_credentials(&mut self) {
        self.encrypted_access_token = None;
        self.encrypted_refresh_token = None;
        self.refresh_token_hash = None;
        self.token_salt = None;
        self.token_iv = None;
        self.token_expires_at = None;
        self.token_updated_at = None;
    }
}

/// Summary of a principal's token state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// An access ciphertext and a refresh hash are both stored.
    pub has_tokens: bool,

    /// The access token is past its expiry, or has none.
    pub is_expired: bool,

    pub expires_at: Option<DateTime<Utc>>,

    pub updated_at: Option<DateTime<Utc>>,
}

impl TokenInfo {
    /// State reported when there is no record or storage is unreachable.
    pub fn absent() -> Self {
        Self {
            has_tokens: false,
            is_expired: true,
            expires_at: None,
            updated_at: None,
        }
    }
}

/// Partial update of a principal's tokens.
///
/// Fields left unset leave the stored value untouched. A `ttl_seconds` of
/// zero counts as unset and keeps the stored expiry.
///
/// ```
/// use credvault_core::TokenUpdate;
///
/// let update = TokenUpdate::new().access_token("AT999").ttl_seconds(7200);
/// assert!(update.refresh_token.is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub access_token: Option<Secret>,
    pub refresh_token: Option<Secret>,
    pub ttl_seconds: Option<i64>,
}

impl TokenUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(Secret::new(token));
        self
    }

    pub fn refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(token));
        self
    }

    /// New access-token lifetime from the time of the update. Zero keeps the stored expiry.
    pub fn ttl_seconds(mut self, ttl: i64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }

    /// Nothing to change besides the update stamp.
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.ttl_seconds.is_none_or(|ttl| ttl == 0)
    }
}

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose) and
/// is wiped from memory on drop. Debug and Display show `[REDACTED]`; use
/// [`masked()`](Secret::masked) to put a partial view in a log line.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Partial view suitable for diagnostics.
    pub fn masked(&self) -> Masked<'_> {
        Masked::new(&self.0)
    }

    /// Empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
