//! Vault configuration handling.
//!
//! Configuration lives in `credvault.toml` in the platform config
//! directory; every field has a default, so a missing file is fine. The
//! encryption secret itself never goes in the file: it is read from the
//! environment variables the `[secrets]` section names.
//!
//! ```toml
//! log_level = "debug"
//!
//! [database]
//! path = "/var/lib/credvault/credentials.db"
//! busy_timeout_ms = 2000
//!
//! [secrets]
//! key_env = "TOKEN_ENCRYPTION_KEY"
//! fallback_env = "APP_SECRET"
//!
//! [availability]
//! probe_cache_secs = 30
//! recovery = "stay_down"
//! ```

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CredvaultError;
use crate::gate::{RecoveryPolicy, DEFAULT_PROBE_CACHE};
use crate::model::Secret;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub database: DatabaseConfig,

    pub secrets: SecretConfig,

    pub availability: AvailabilityConfig,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            secrets: SecretConfig::default(),
            availability: AvailabilityConfig::default(),
            log_level: "info".to_string(),
            config_path: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: PathBuf,

    /// Upper bound on waiting for a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".credvault"));

        Self {
            path: data_dir.join("credentials.db"),
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    /// How long a storage-ready probe result is reused, in seconds.
    pub probe_cache_secs: u64,

    pub recovery: RecoveryPolicy,
}

impl AvailabilityConfig {
    pub fn probe_cache(&self) -> Duration {
        Duration::from_secs(self.probe_cache_secs)
    }
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            probe_cache_secs: DEFAULT_PROBE_CACHE.as_secs(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// Names of the environment variables holding the encryption secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretConfig {
    /// Dedicated token encryption secret.
    pub key_env: String,

    /// Application secret to derive from when `key_env` is unset.
    pub fallback_env: String,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            key_env: "TOKEN_ENCRYPTION_KEY".to_string(),
            fallback_env: "APP_SECRET".to_string(),
        }
    }
}

/// Where the encryption secret came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    /// The dedicated key variable.
    Configured,
    /// Derived from the fallback application secret.
    Fallback,
}

/// Secret material ready for key derivation.
#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub secret: Secret,
    pub source: SecretSource,
}

impl SecretConfig {
    /// Resolve the encryption secret from the process environment.
    pub fn resolve(&self) -> Result<ResolvedSecret, CredvaultError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve the encryption secret through `lookup`.
    ///
    /// The dedicated key wins. Otherwise the fallback secret is hashed with
    /// SHA-256 and its hex digest becomes the secret, so a given fallback
    /// value always yields the same key.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<ResolvedSecret, CredvaultError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty(&self.key_env) {
            return Ok(ResolvedSecret {
                secret: Secret::new(key),
                source: SecretSource::Configured,
            });
        }

        if let Some(app_secret) = non_empty(&self.fallback_env) {
            let digest = hex::encode(Sha256::digest(app_secret.as_bytes()));
            return Ok(ResolvedSecret {
                secret: Secret::new(digest),
                source: SecretSource::Fallback,
            });
        }

        Err(CredvaultError::Config {
            message: format!(
                "neither {} nor {} is set; cannot derive the token encryption key",
                self.key_env, self.fallback_env
            ),
        })
    }
}

/// Load configuration from the default location or use defaults.
pub fn load_config() -> Result<VaultConfig> {
    let config_path = project_dirs()
        .map(|d| d.config_dir().join("credvault.toml"))
        .unwrap_or_else(|| PathBuf::from("credvault.toml"));

    if config_path.exists() {
        load_config_from(&config_path)
    } else {
        Ok(VaultConfig {
            config_path,
            ..VaultConfig::default()
        })
    }
}

/// Load configuration from an explicit file.
pub fn load_config_from(path: &Path) -> Result<VaultConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {:?}", path))?;
    let mut config: VaultConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config from {:?}", path))?;
    config.config_path = path.to_path_buf();
    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "credvault", "credvault")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.database.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.availability.probe_cache(), Duration::from_secs(30));
        assert_eq!(config.availability.recovery, RecoveryPolicy::StayDown);
        assert_eq!(config.secrets.key_env, "TOKEN_ENCRYPTION_KEY");
        assert!(config.database.path.ends_with("credentials.db"));
    }

    #[test]
    fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("credvault.toml");
        std::fs::write(
            &path,
            r#"
            log_level = "debug"

            [database]
            path = "/tmp/creds.db"

            [availability]
            recovery = "reprobe"
            "#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.database.path, PathBuf::from("/tmp/creds.db"));
        assert_eq!(config.database.busy_timeout_ms, 5000);
        assert_eq!(config.availability.recovery, RecoveryPolicy::Reprobe);
        assert_eq!(config.availability.probe_cache_secs, 30);
        assert_eq!(config.config_path, path);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("credvault.toml");
        std::fs::write(&path, "[availability]\nrecovery = \"sometimes\"\n").unwrap();
        assert!(load_config_from(&path).is_err());
    }

    #[test]
    fn test_dedicated_key_wins() {
        let secrets = SecretConfig::default();
        let resolved = secrets
            .resolve_with(env(&[("TOKEN_ENCRYPTION_KEY", "k1"), ("APP_SECRET", "app")]))
            .unwrap();
        assert_eq!(resolved.source, SecretSource::Configured);
        assert_eq!(resolved.secret.expose(), "k1");
    }

    #[test]
    fn test_fallback_secret_is_hashed() {
        let secrets = SecretConfig::default();
        let resolved = secrets
            .resolve_with(env(&[("TOKEN_ENCRYPTION_KEY", "  "), ("APP_SECRET", "app")]))
            .unwrap();
        assert_eq!(resolved.source, SecretSource::Fallback);
        assert_eq!(resolved.secret.expose(), hex::encode(Sha256::digest(b"app")));

        let again = secrets.resolve_with(env(&[("APP_SECRET", "app")])).unwrap();
        assert_eq!(again.secret, resolved.secret);
    }

    #[test]
    fn test_missing_secrets_is_config_error() {
        let result = SecretConfig::default().resolve_with(env(&[]));
        assert!(matches!(result, Err(CredvaultError::Config { .. })));
    }
}
