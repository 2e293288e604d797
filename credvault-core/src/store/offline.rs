//! Null-object backend for when storage could not be initialized.

use super::{Backend, StoreError, UnitOfWork};

/// Backend that fails every call with [`StoreError::Unavailable`].
///
/// Selected at construction time when the real store cannot be opened.
#[derive(Debug, Clone)]
pub struct OfflineBackend {
    reason: String,
}

impl OfflineBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Why storage is offline.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl Backend for OfflineBackend {
    fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::unavailable(self.reason.clone()))
    }

    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        Err(StoreError::unavailable(self.reason.clone()))
    }
}
