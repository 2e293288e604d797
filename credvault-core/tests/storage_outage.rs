//! Integration tests for behaviour while credential storage is down.
//!
//! These tests verify that operations degrade to `false`/`None` results:
//! - After a connectivity failure mid-process
//! - When another connection holds the database lock past the busy timeout
//! - When the database cannot be opened at all
//! - When no encryption secret is configured

use std::sync::Arc;
use std::time::{Duration, Instant};

use credvault_core::cipher::derive_key;
use credvault_core::config::{SecretConfig, VaultConfig};
use credvault_core::logging::MemorySink;
use credvault_core::store::{MemoryBackend, SqliteBackend};
use credvault_core::{
    Availability, CredentialStore, CredvaultError, PrincipalId, TokenInfo, TokenUpdate,
};
use tempfile::TempDir;

const USER: PrincipalId = PrincipalId::new(42);

/// Secret lookup over fixed pairs instead of the process environment.
fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
    move |name: &str| {
        pairs
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    }
}

#[test]
fn test_outage_short_circuits_operations() {
    let backend = Arc::new(MemoryBackend::new());
    let sink = Arc::new(MemorySink::new());
    let store = CredentialStore::builder(backend.clone(), derive_key("outage"))
        .log_sink(sink.clone())
        .build();
    assert_eq!(store.availability(), Availability::Available);
    assert!(store.save_tokens(USER, "AT123", "RT456", 3600));

    backend.set_offline(true);

    assert!(!store.save_tokens(USER, "AT999", "RT999", 3600));
    assert_eq!(store.availability(), Availability::Unavailable);
    assert!(store.get_access_token(USER).is_none());
    assert!(store.get_refresh_token_hash(USER).is_none());
    assert!(!store.verify_refresh_token(USER, "RT456"));
    assert!(store.is_token_expired(USER));
    assert!(!store.clear_tokens(USER));
    assert!(!store.update_tokens(USER, TokenUpdate::new().access_token("AT1")));
    assert_eq!(store.get_token_info(USER), TokenInfo::absent());

    // The transition is reported once
    let transitions = sink
        .entries()
        .iter()
        .filter(|e| e.message.contains("became unavailable"))
        .count();
    assert_eq!(transitions, 1);
}

#[test]
fn test_lock_timeout_takes_storage_offline() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("credentials.db");
    let backend = SqliteBackend::open(&path, Duration::from_millis(100)).unwrap();
    let sink = Arc::new(MemorySink::new());
    let store = CredentialStore::builder(backend, derive_key("busy"))
        .log_sink(sink.clone())
        .build();
    assert_eq!(store.availability(), Availability::Available);

    let holder = rusqlite::Connection::open(&path).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let started = Instant::now();
    assert!(!store.save_tokens(USER, "AT123", "RT456", 3600));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(store.availability(), Availability::Unavailable);
    assert!(sink.contains("credential storage became unavailable during save_tokens"));

    // Releasing the lock does not reopen the gate
    holder.execute_batch("ROLLBACK").unwrap();
    assert!(!store.save_tokens(USER, "AT123", "RT456", 3600));
    assert!(store.test_connection());
}

#[test]
fn test_unopenable_database_falls_back_to_offline() {
    let temp = TempDir::new().unwrap();
    let blocker = temp.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let mut config = VaultConfig::default();
    config.database.path = blocker.join("credentials.db");

    let sink = Arc::new(MemorySink::new());
    let lookup = env(&[("TOKEN_ENCRYPTION_KEY", "offline-fallback-secret")]);
    let store = CredentialStore::open_with(&config, lookup, Some(sink.clone())).unwrap();

    assert_eq!(store.availability(), Availability::Unavailable);
    assert!(!store.test_connection());
    assert!(!store.save_tokens(USER, "AT123", "RT456", 3600));
    assert!(store.get_access_token(USER).is_none());
    assert!(sink.contains("failed to open credential database"));

    // Raw primitives still work without storage
    let ciphertext = store.encrypt("AT123").unwrap();
    assert_eq!(store.decrypt(&ciphertext).unwrap(), "AT123");
}

#[test]
fn test_open_with_working_database() {
    let temp = TempDir::new().unwrap();

    let mut config = VaultConfig::default();
    config.database.path = temp.path().join("nested").join("credentials.db");

    let sink = Arc::new(MemorySink::new());
    let lookup = env(&[("APP_SECRET", "working-app-secret")]);
    let store = CredentialStore::open_with(&config, lookup, Some(sink.clone())).unwrap();
    assert_eq!(store.availability(), Availability::Available);
    assert!(store.test_connection());
    assert!(store.save_tokens(USER, "AT123", "RT456", 3600));
    assert!(config.database.path.exists());
    assert!(sink.contains("TOKEN_ENCRYPTION_KEY is not set"));

    // The same fallback secret reopens the same key
    drop(store);
    let lookup = env(&[("APP_SECRET", "working-app-secret")]);
    let reopened = CredentialStore::open_with(&config, lookup, None).unwrap();
    assert_eq!(reopened.get_refresh_token_decrypted(USER).unwrap().expose(), "RT456");
}

#[test]
fn test_open_without_secret_is_config_error() {
    let temp = TempDir::new().unwrap();
    let mut config = VaultConfig::default();
    config.database.path = temp.path().join("credentials.db");
    config.secrets = SecretConfig {
        key_env: "CREDVAULT_IT_NEVER_SET_KEY".to_string(),
        fallback_env: "CREDVAULT_IT_NEVER_SET_APP".to_string(),
    };

    let result = CredentialStore::open(&config);
    assert!(matches!(result, Err(CredvaultError::Config { .. })));

    let result = CredentialStore::open_with(&config, env(&[]), None);
    assert!(matches!(result, Err(CredvaultError::Config { .. })));
}
