//! # Credvault Core
//!
//! Encrypted storage for OAuth-style access/refresh token pairs.
//!
//! This crate provides:
//! - Authenticated encryption of tokens under a key derived from a server secret
//! - A slow salted digest of refresh tokens for verification without decryption
//! - A [`CredentialStore`] with save/get/update/clear/verify operations, each
//!   run as one atomic unit of work
//! - An availability gate that turns a vanished database into `false`/`None`
//!   results instead of errors
//! - Masked logging, so raw tokens never reach a log sink
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use credvault_core::{config, logging, CredentialStore, PrincipalId};
//!
//! let config = config::load_config()?;
//! logging::init_tracing(&config.log_level);
//!
//! let store = CredentialStore::open(&config)?;
//! let user = PrincipalId::new(42);
//! store.save_tokens(user, "AT123", "RT456", 3600);
//!
//! if let Some(token) = store.get_access_token(user) {
//!     call_api(token.expose());
//! }
//! ```

pub mod cipher;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod gate;
pub mod logging;
pub mod mask;
pub mod model;
pub mod store;
pub mod vault;

// Re-export commonly used types at crate root
pub use model::{
    PrincipalId,
    Principal,
    CredentialRecord,
    TokenInfo,
    TokenUpdate,
    Secret,
    GROUP_PRINCIPAL_ID,
};

pub use cipher::{
    CipherError,
    EncryptionKey,
};

pub use store::{
    Backend,
    StoreError,
};

pub use gate::{
    Availability,
    RecoveryPolicy,
};

pub use logging::{
    LogLevel,
    LogSink,
};

pub use vault::{
    CredentialStore,
    CredentialStoreBuilder,
};

pub use codec::DEFAULT_TTL_SECONDS;
pub use config::VaultConfig;
pub use error::CredvaultError;
pub use mask::mask;
