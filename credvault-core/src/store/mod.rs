//! Persistence abstraction.
//!
//! This module provides:
//! - [`Backend`] - Trait for a relational store holding principals and credential records
//! - [`UnitOfWork`] - An atomic transaction against a backend
//! - [`SqliteBackend`] - SQLite implementation
//! - [`MemoryBackend`] - In-memory implementation for testing, with outage simulation
//! - [`OfflineBackend`] - Null object used when storage could not be initialized
//! - [`StoreError`] - Error type shared by every backend
//!
//! # Example
//!
//! ```rust,ignore
//! use credvault_core::store::{Backend, MemoryBackend};
//! use credvault_core::{CredentialRecord, PrincipalId};
//!
//! let backend = MemoryBackend::new();
//! let mut uow = backend.begin()?;
//! let record = uow.find_record(PrincipalId::new(42))?;
//! uow.commit()?;
//! ```

use std::sync::Arc;
use thiserror::Error;

use crate::cipher::CipherError;
use crate::model::{CredentialRecord, Principal, PrincipalId};

mod memory;
mod offline;
mod sqlite;

pub use memory::MemoryBackend;
pub use offline::OfflineBackend;
pub use sqlite::SqliteBackend;

/// Error type for persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached, timed out, or is not initialized.
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },

    /// A unique or foreign-key constraint rejected the write.
    #[error("integrity violation: {message}")]
    Integrity { message: String },

    /// Input failed validation before it reached the store.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Any other backend failure.
    #[error("backend error: {message}")]
    Backend { message: String },

    /// Token material could not be encrypted or decrypted.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Connectivity-class failure that should take storage offline.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// A relational store for principals and their credential records.
///
/// Implementations include:
/// - [`SqliteBackend`] - on-disk or in-memory SQLite
/// - [`MemoryBackend`] - plain in-process maps for tests
/// - [`OfflineBackend`] - every call fails with [`StoreError::Unavailable`]
pub trait Backend: Send + Sync {
    /// Trivial round trip used to decide whether storage is reachable.
    fn ping(&self) -> Result<(), StoreError>;

    /// Start an atomic unit of work.
    ///
    /// Nothing written through the returned handle is visible to others
    /// until [`UnitOfWork::commit`]. Dropping the handle without committing
    /// rolls back.
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError>;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn ping(&self) -> Result<(), StoreError> {
        (**self).ping()
    }

    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        (**self).begin()
    }
}

/// One transaction against a [`Backend`].
pub trait UnitOfWork {
    fn find_principal(&mut self, id: PrincipalId) -> Result<Option<Principal>, StoreError>;

    /// Insert a principal. Fails with [`StoreError::Integrity`] on a duplicate id.
    fn insert_principal(&mut self, principal: &Principal) -> Result<(), StoreError>;

    fn find_record(&mut self, id: PrincipalId) -> Result<Option<CredentialRecord>, StoreError>;

    /// Insert a credential record.
    ///
    /// Fails with [`StoreError::Integrity`] when the principal already has
    /// one or does not exist.
    fn insert_record(&mut self, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Overwrite an existing record, matched by principal id.
    fn update_record(&mut self, record: &CredentialRecord) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
