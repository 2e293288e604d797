//! The credential store: principal-scoped token operations.
//!
//! Every operation runs as one unit of work against the [`Backend`], behind
//! the [`AvailabilityGate`]. Operations never return errors: failures are
//! logged and surface as `false`, `None` or [`TokenInfo::absent`]. The raw
//! cipher and digest primitives are the exception and return `Result`.
//!
//! # Example
//!
//! ```
//! use credvault_core::{cipher, CredentialStore, PrincipalId, TokenUpdate};
//! use credvault_core::store::MemoryBackend;
//!
//! let store = CredentialStore::builder(MemoryBackend::new(), cipher::derive_key("server-secret"))
//!     .build();
//! let id = PrincipalId::new(42);
//!
//! assert!(store.save_tokens(id, "AT123", "RT456", 3600));
//! assert_eq!(store.get_access_token(id).unwrap().expose(), "AT123");
//! assert!(store.verify_refresh_token(id, "RT456"));
//!
//! assert!(store.update_tokens(id, TokenUpdate::new().access_token("AT999")));
//! assert_eq!(store.get_refresh_token_decrypted(id).unwrap().expose(), "RT456");
//! ```

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::cipher::{self, CipherError, EncryptionKey};
use crate::clock::{Clock, SystemClock};
use crate::codec::{self, CredentialPayload};
use crate::config::{SecretSource, VaultConfig};
use crate::error::CredvaultError;
use crate::gate::{Availability, AvailabilityGate, RecoveryPolicy, DEFAULT_PROBE_CACHE};
use crate::logging::{CredentialLog, LogSink, SYSTEM_SUBJECT};
use crate::mask::Masked;
use crate::model::{
    CredentialRecord, Principal, PrincipalId, Secret, TokenInfo, TokenUpdate, GROUP_PRINCIPAL_ID,
};
use crate::store::{Backend, OfflineBackend, SqliteBackend, StoreError, UnitOfWork};

/// Value some deployments ship in their env template instead of a token.
pub const GROUP_TOKEN_PLACEHOLDER: &str = "your_group_token_here";

/// Encrypted per-principal token storage.
///
/// Construct one per process with [`CredentialStore::open`] or
/// [`CredentialStore::builder`] and share it by reference or `Arc`; all
/// operations take `&self`.
pub struct CredentialStore {
    backend: Box<dyn Backend>,
    gate: AvailabilityGate,
    key: EncryptionKey,
    clock: Arc<dyn Clock>,
    log: CredentialLog,
}

/// Builder for [`CredentialStore`].
pub struct CredentialStoreBuilder {
    backend: Box<dyn Backend>,
    key: EncryptionKey,
    clock: Arc<dyn Clock>,
    log: CredentialLog,
    probe_cache: Duration,
    recovery: RecoveryPolicy,
}

impl CredentialStoreBuilder {
    /// Time source for expiry decisions.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Where log entries go. Defaults to `tracing`.
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log = CredentialLog::new(sink);
        self
    }

    /// How long a storage-ready probe result is reused.
    pub fn probe_cache(mut self, probe_cache: Duration) -> Self {
        self.probe_cache = probe_cache;
        self
    }

    pub fn recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Probe the backend and build the store.
    pub fn build(self) -> CredentialStore {
        let gate = AvailabilityGate::probed(self.backend.as_ref(), self.probe_cache, self.recovery);
        match gate.state() {
            Availability::Available => {
                self.log
                    .info(SYSTEM_SUBJECT, format_args!("credential storage is available"));
            }
            Availability::Unavailable => {
                self.log.warning(
                    SYSTEM_SUBJECT,
                    format_args!("credential storage is unavailable; token operations will fail"),
                );
            }
        }

        CredentialStore {
            backend: self.backend,
            gate,
            key: self.key,
            clock: self.clock,
            log: self.log,
        }
    }
}

impl CredentialStore {
    /// Start building a store over `backend`, encrypting with `key`.
    pub fn builder(backend: impl Backend + 'static, key: EncryptionKey) -> CredentialStoreBuilder {
        CredentialStoreBuilder {
            backend: Box::new(backend),
            key,
            clock: Arc::new(SystemClock),
            log: CredentialLog::default(),
            probe_cache: DEFAULT_PROBE_CACHE,
            recovery: RecoveryPolicy::default(),
        }
    }

    /// Open the configured SQLite store, reading secrets from the environment.
    ///
    /// Fails only when no encryption secret can be resolved. If the database
    /// cannot be opened the store is still returned, backed by
    /// [`OfflineBackend`], and every operation reports failure.
    pub fn open(config: &VaultConfig) -> Result<Self, CredvaultError> {
        Self::open_with(config, |name| std::env::var(name).ok(), None)
    }

    /// Like [`open`](Self::open), resolving the secret variables through
    /// `lookup` and logging through `sink` when one is given.
    pub fn open_with<F>(
        config: &VaultConfig,
        lookup: F,
        sink: Option<Arc<dyn LogSink>>,
    ) -> Result<Self, CredvaultError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log = sink.map(CredentialLog::new).unwrap_or_default();

        let resolved = config.secrets.resolve_with(lookup)?;
        if resolved.source == SecretSource::Fallback {
            log.warning(
                SYSTEM_SUBJECT,
                format_args!(
                    "{} is not set; deriving the token key from {}",
                    config.secrets.key_env, config.secrets.fallback_env
                ),
            );
        }
        let key = cipher::derive_key(resolved.secret.expose());

        let db_path = &config.database.path;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log.warning(
                    SYSTEM_SUBJECT,
                    format_args!("failed to create {}: {}", parent.display(), e),
                );
            }
        }

        let builder = match SqliteBackend::open(db_path, config.database.busy_timeout()) {
            Ok(backend) => Self::builder(backend, key),
            Err(e) => {
                log.error(
                    SYSTEM_SUBJECT,
                    format_args!("failed to open credential database {}: {}", db_path.display(), e),
                );
                Self::builder(OfflineBackend::new(e.to_string()), key)
            }
        };

        Ok(CredentialStoreBuilder { log, ..builder }
            .probe_cache(config.availability.probe_cache())
            .recovery(config.availability.recovery)
            .build())
    }

    /// Encrypt and store a token pair, replacing any previous pair.
    ///
    /// Creates the principal and its record on first use.
    pub fn save_tokens(
        &self,
        id: PrincipalId,
        access_token: impl Into<Secret>,
        refresh_token: impl Into<Secret>,
        ttl_seconds: i64,
    ) -> bool {
        let access_token = access_token.into();
        let refresh_token = refresh_token.into();
        let subject = id.log_subject();

        self.log.info(
            subject,
            format_args!(
                "saving tokens for principal {}: access_token={}, refresh_token={}",
                id,
                access_token.masked(),
                refresh_token.masked()
            ),
        );

        let payload = match self.prepare_save(&access_token, &refresh_token, ttl_seconds) {
            Ok(payload) => payload,
            Err(e) => {
                self.report_failure(id, "save_tokens", &e);
                return false;
            }
        };

        self.run(id, "save_tokens", |uow| {
            let mut record = self.ensure_record(uow, id)?;
            record.encrypted_access_token = Some(payload.encrypted_access);
            record.encrypted_refresh_token = Some(payload.encrypted_refresh);
            record.refresh_token_hash = Some(payload.refresh_hash);
            record.token_salt = Some(payload.salt);
            record.token_iv = Some(payload.iv);
            record.token_expires_at = Some(payload.expires_at);
            record.token_updated_at = Some(payload.updated_at);
            uow.update_record(&record)?;

            self.log.debug(
                subject,
                format_args!(
                    "stored encrypted_access_token={} expires_at={}",
                    Masked::new(record.encrypted_access_token.as_deref().unwrap_or_default()),
                    payload.expires_at.to_rfc3339()
                ),
            );
            Ok(())
        })
        .is_some()
    }

    /// The current access token, unless missing, expired or undecryptable.
    pub fn get_access_token(&self, id: PrincipalId) -> Option<Secret> {
        let record = self.load_record(id, "get_access_token")?;
        let ciphertext = record.encrypted_access_token.as_deref()?;

        if codec::is_expired_at(record.token_expires_at, self.clock.now()) {
            self.log.debug(
                id.log_subject(),
                format_args!("access token for principal {} has expired", id),
            );
            return None;
        }

        self.decrypt_field(id, "access", ciphertext)
    }

    /// Stored refresh-token digest.
    pub fn get_refresh_token_hash(&self, id: PrincipalId) -> Option<String> {
        self.load_record(id, "get_refresh_token_hash")?
            .refresh_token_hash
    }

    /// The refresh token, decrypted without any expiry check.
    pub fn get_refresh_token_decrypted(&self, id: PrincipalId) -> Option<Secret> {
        let record = self.load_record(id, "get_refresh_token_decrypted")?;
        let ciphertext = record.encrypted_refresh_token.as_deref()?;
        self.decrypt_field(id, "refresh", ciphertext)
    }

    /// Check `candidate` against the stored refresh-token digest.
    pub fn verify_refresh_token(&self, id: PrincipalId, candidate: &str) -> bool {
        let Some(record) = self.load_record(id, "verify_refresh_token") else {
            return false;
        };
        match (&record.refresh_token_hash, &record.token_salt) {
            (Some(hash), Some(salt)) => codec::verify_refresh_token(candidate, hash, salt),
            _ => false,
        }
    }

    /// Whether the access token is expired. No record counts as expired.
    pub fn is_token_expired(&self, id: PrincipalId) -> bool {
        match self.load_record(id, "is_token_expired") {
            Some(record) => codec::is_expired_at(record.token_expires_at, self.clock.now()),
            None => true,
        }
    }

    /// Null every credential field, keeping the record.
    ///
    /// Succeeds when there is nothing to clear.
    pub fn clear_tokens(&self, id: PrincipalId) -> bool {
        self.run(id, "clear_tokens", |uow| {
            if let Some(mut record) = uow.find_record(id)? {
                record.clear_credentials();
                uow.update_record(&record)?;
                self.log.info(
                    id.log_subject(),
                    format_args!("cleared tokens for principal {}", id),
                );
            }
            Ok(())
        })
        .is_some()
    }

    pub fn get_token_info(&self, id: PrincipalId) -> TokenInfo {
        let Some(record) = self.load_record(id, "get_token_info") else {
            return TokenInfo::absent();
        };
        TokenInfo {
            has_tokens: record.has_tokens(),
            is_expired: codec::is_expired_at(record.token_expires_at, self.clock.now()),
            expires_at: record.token_expires_at,
            updated_at: record.token_updated_at,
        }
    }

    /// Apply a partial token update.
    ///
    /// Unset fields keep their stored values, and a TTL of zero counts as
    /// unset. A new refresh token replaces its digest and salt together.
    /// Creates the principal and its record on first use.
    pub fn update_tokens(&self, id: PrincipalId, update: TokenUpdate) -> bool {
        let prepared = match self.prepare_update(id, &update) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.report_failure(id, "update_tokens", &e);
                return false;
            }
        };

        self.run(id, "update_tokens", |uow| {
            let PreparedUpdate {
                encrypted_access,
                refresh,
                expires_at,
                updated_at,
            } = prepared;
            let mut record = self.ensure_record(uow, id)?;

            if let Some(encrypted_access) = encrypted_access {
                record.encrypted_access_token = Some(encrypted_access);
            }
            if let Some(refresh) = refresh {
                record.encrypted_refresh_token = Some(refresh.encrypted);
                record.refresh_token_hash = Some(refresh.hash);
                record.token_salt = Some(refresh.salt);
            }
            if let Some(expires_at) = expires_at {
                record.token_expires_at = Some(expires_at);
            }

            record.token_updated_at = Some(updated_at);
            uow.update_record(&record)?;
            Ok(())
        })
        .is_some()
    }

    /// Store the group token. It has no refresh token and no expiry.
    pub fn update_group_token(&self, token: impl Into<Secret>) -> bool {
        let token = token.into();
        self.update_tokens(
            GROUP_PRINCIPAL_ID,
            TokenUpdate {
                access_token: Some(token),
                ..TokenUpdate::default()
            },
        )
    }

    /// The group token, decrypted without any expiry check.
    pub fn get_group_token(&self) -> Option<Secret> {
        let record = self.load_record(GROUP_PRINCIPAL_ID, "get_group_token")?;
        let ciphertext = record.encrypted_access_token.as_deref()?;
        self.decrypt_field(GROUP_PRINCIPAL_ID, "group", ciphertext)
    }

    /// Move a group token from the environment variable `var` into storage.
    pub fn import_group_token_from_env(&self, var: &str) -> bool {
        self.import_group_token(std::env::var(var).ok().as_deref())
    }

    /// Store `value` as the group token unless one is already stored.
    ///
    /// Missing, blank and placeholder values are rejected. Returns `true`
    /// when a group token is in storage afterwards.
    pub fn import_group_token(&self, value: Option<&str>) -> bool {
        let token = match value.map(str::trim) {
            Some(token) if !token.is_empty() && token != GROUP_TOKEN_PLACEHOLDER => token,
            _ => {
                self.log.warning(
                    SYSTEM_SUBJECT,
                    format_args!("no group token to import (missing or placeholder value)"),
                );
                return false;
            }
        };

        if self.get_group_token().is_some() {
            self.log.info(
                SYSTEM_SUBJECT,
                format_args!("group token already stored; skipping import"),
            );
            return true;
        }

        let imported = self.update_group_token(token);
        if imported {
            self.log.info(
                SYSTEM_SUBJECT,
                format_args!("imported group token {}", Masked::new(token)),
            );
        }
        imported
    }

    /// Round-trip to storage now. Does not change the availability state.
    pub fn test_connection(&self) -> bool {
        match self.backend.ping() {
            Ok(()) => {
                self.log
                    .info(SYSTEM_SUBJECT, format_args!("credential storage connection ok"));
                true
            }
            Err(e) => {
                self.log.error(
                    SYSTEM_SUBJECT,
                    format_args!("credential storage connection failed: {}", e),
                );
                false
            }
        }
    }

    /// Whether operations currently reach storage.
    pub fn availability(&self) -> Availability {
        self.gate.state()
    }

    /// Absolute expiry for a TTL counted from now.
    pub fn token_expiry_time(&self, ttl_seconds: i64) -> DateTime<Utc> {
        codec::expiry_time(ttl_seconds, self.clock.now())
    }

    /// Encrypt with this store's key.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        cipher::encrypt(plaintext, &self.key)
    }

    /// Decrypt with this store's key.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        cipher::decrypt(ciphertext, &self.key)
    }

    /// Salted refresh-token digest as `(hash, salt)`.
    pub fn hash_refresh_token(&self, refresh_token: &str) -> (String, String) {
        codec::hash_refresh_token(refresh_token, None)
    }

    /// Check a token against a digest from [`hash_refresh_token`](Self::hash_refresh_token).
    pub fn verify_refresh_token_hash(&self, candidate: &str, hash: &str, salt: &str) -> bool {
        codec::verify_refresh_token(candidate, hash, salt)
    }

    /// Validate and encrypt a full token pair before any storage access.
    fn prepare_save(
        &self,
        access_token: &Secret,
        refresh_token: &Secret,
        ttl_seconds: i64,
    ) -> Result<CredentialPayload, StoreError> {
        require_token("access", access_token)?;
        require_token("refresh", refresh_token)?;

        Ok(codec::build_credential_payload(
            access_token,
            refresh_token,
            ttl_seconds,
            &self.key,
            self.clock.now(),
        )?)
    }

    /// Validate and encrypt the fields of a partial update before any storage access.
    fn prepare_update(&self, id: PrincipalId, update: &TokenUpdate) -> Result<PreparedUpdate, StoreError> {
        let subject = id.log_subject();
        let now = self.clock.now();

        let encrypted_access = match &update.access_token {
            Some(access_token) => {
                require_token("access", access_token)?;
                self.log.info(
                    subject,
                    format_args!(
                        "updating access token for principal {}: access_token={}",
                        id,
                        access_token.masked()
                    ),
                );
                Some(cipher::encrypt(access_token.expose(), &self.key)?)
            }
            None => None,
        };

        let refresh = match &update.refresh_token {
            Some(refresh_token) => {
                require_token("refresh", refresh_token)?;
                self.log.info(
                    subject,
                    format_args!(
                        "updating refresh token for principal {}: refresh_token={}",
                        id,
                        refresh_token.masked()
                    ),
                );
                let (hash, salt) = codec::hash_refresh_token(refresh_token.expose(), None);
                Some(RefreshFields {
                    encrypted: cipher::encrypt(refresh_token.expose(), &self.key)?,
                    hash,
                    salt,
                })
            }
            None => None,
        };

        if update.is_empty() {
            self.log.debug(
                subject,
                format_args!("update for principal {} only touches updated_at", id),
            );
        }

        Ok(PreparedUpdate {
            encrypted_access,
            refresh,
            expires_at: update
                .ttl_seconds
                .filter(|ttl| *ttl != 0)
                .map(|ttl| codec::expiry_time(ttl, now)),
            updated_at: now,
        })
    }

    fn load_record(&self, id: PrincipalId, op: &'static str) -> Option<CredentialRecord> {
        self.run(id, op, |uow| uow.find_record(id)).flatten()
    }

    fn decrypt_field(&self, id: PrincipalId, field: &str, ciphertext: &str) -> Option<Secret> {
        match cipher::decrypt(ciphertext, &self.key) {
            Ok(plaintext) => Some(Secret::new(plaintext)),
            Err(e) => {
                self.log.error(
                    id.log_subject(),
                    format_args!(
                        "cannot decrypt {} token for principal {} ({}): {}",
                        field,
                        id,
                        Masked::new(ciphertext),
                        e
                    ),
                );
                None
            }
        }
    }

    /// Find the principal's record, creating the principal and record if needed.
    fn ensure_record(
        &self,
        uow: &mut dyn UnitOfWork,
        id: PrincipalId,
    ) -> Result<CredentialRecord, StoreError> {
        if let Some(record) = uow.find_record(id)? {
            return Ok(record);
        }

        if uow.find_principal(id)?.is_none() {
            let principal = Principal::placeholder(id);
            principal.validate()?;
            uow.insert_principal(&principal)?;
            self.log.info(
                id.log_subject(),
                format_args!("created principal {}", id),
            );
        }

        let record = CredentialRecord::new(id);
        uow.insert_record(&record)?;
        self.log.info(
            id.log_subject(),
            format_args!("created credential record for principal {}", id),
        );
        Ok(record)
    }

    /// Run `work` in one unit of work behind the availability gate.
    ///
    /// Returns `None` when the gate is closed or anything fails. Failures
    /// roll back and are logged; connectivity failures close the gate.
    fn run<T, F>(&self, id: PrincipalId, op: &'static str, work: F) -> Option<T>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T, StoreError>,
    {
        if !self.gate.admit(self.backend.as_ref()) {
            self.log.debug(
                id.log_subject(),
                format_args!("{} skipped for principal {}: storage unavailable", op, id),
            );
            return None;
        }

        let result = self.backend.begin().and_then(|mut uow| match work(&mut *uow) {
            Ok(value) => uow.commit().map(|()| value),
            Err(e) => {
                if let Err(rollback) = uow.rollback() {
                    self.log.warning(
                        id.log_subject(),
                        format_args!("{} rollback failed: {}", op, rollback),
                    );
                }
                Err(e)
            }
        });

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.report_failure(id, op, &e);
                None
            }
        }
    }

    fn report_failure(&self, id: PrincipalId, op: &'static str, err: &StoreError) {
        if err.is_operational() && self.gate.mark_unavailable() {
            self.log.error(
                SYSTEM_SUBJECT,
                format_args!("credential storage became unavailable during {}: {}", op, err),
            );
        }
        self.log.error(
            id.log_subject(),
            format_args!("{} failed for principal {}: {}", op, id, err),
        );
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("availability", &self.gate.state())
            .field("recovery", &self.gate.recovery())
            .finish_non_exhaustive()
    }
}

/// Storable fields for a partial update.
struct PreparedUpdate {
    encrypted_access: Option<String>,
    refresh: Option<RefreshFields>,
    expires_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

struct RefreshFields {
    encrypted: String,
    hash: String,
    salt: String,
}

fn require_token(kind: &str, token: &Secret) -> Result<(), StoreError> {
    if token.is_blank() {
        return Err(StoreError::validation(format!("{} token must not be empty", kind)));
    }
    Ok(())
}
