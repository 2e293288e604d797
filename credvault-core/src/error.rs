//! Top-level error types for credvault.
//!
//! Token operations report failure through their return values and the
//! log, and the raw cipher primitives return [`CipherError`](crate::CipherError).
//! Only opening a store can fail outright.

use thiserror::Error;

/// Error returned when a credential store cannot be constructed.
#[derive(Debug, Error)]
pub enum CredvaultError {
    /// No usable encryption secret, or an invalid setting.
    #[error("configuration error: {message}")]
    Config { message: String },
}
