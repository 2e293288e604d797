//! In-memory persistence backend.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Backend, StoreError, UnitOfWork};
use crate::model::{CredentialRecord, Principal, PrincipalId};

#[derive(Debug, Default, Clone)]
struct Tables {
    principals: HashMap<PrincipalId, Principal>,
    records: HashMap<PrincipalId, CredentialRecord>,
}

/// In-memory backend for testing and development.
///
/// This store is not persistent; data is lost when the process exits.
///
/// # Transactions
///
/// A unit of work holds the table lock for its whole lifetime and edits a
/// staged copy, so units of work are fully serialized and a rollback simply
/// discards the copy.
///
/// # Outages
///
/// [`set_offline`](MemoryBackend::set_offline) makes every subsequent call,
/// including calls on open units of work, fail with
/// [`StoreError::Unavailable`].
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    offline: AtomicBool,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate losing (or regaining) the connection.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(offline: &AtomicBool) -> Result<(), StoreError> {
        if offline.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("MemoryBackend")
            .field("principals", &tables.principals.len())
            .field("records", &tables.records.len())
            .field("offline", &self.offline.load(Ordering::SeqCst))
            .finish()
    }
}

impl Backend for MemoryBackend {
    fn ping(&self) -> Result<(), StoreError> {
        Self::check_online(&self.offline)
    }

    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        Self::check_online(&self.offline)?;
        let guard = self.tables.lock();
        let staged = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard,
            staged,
            offline: &self.offline,
        }))
    }
}

struct MemoryUnitOfWork<'a> {
    guard: MutexGuard<'a, Tables>,
    staged: Tables,
    offline: &'a AtomicBool,
}

impl MemoryUnitOfWork<'_> {
    fn online(&self) -> Result<(), StoreError> {
        MemoryBackend::check_online(self.offline)
    }
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    fn find_principal(&mut self, id: PrincipalId) -> Result<Option<Principal>, StoreError> {
        self.online()?;
        Ok(self.staged.principals.get(&id).cloned())
    }

    fn insert_principal(&mut self, principal: &Principal) -> Result<(), StoreError> {
        self.online()?;
        if self.staged.principals.contains_key(&principal.id) {
            return Err(StoreError::integrity(format!(
                "principal {} already exists",
                principal.id
            )));
        }
        self.staged
            .principals
            .insert(principal.id, principal.clone());
        Ok(())
    }

    fn find_record(&mut self, id: PrincipalId) -> Result<Option<CredentialRecord>, StoreError> {
        self.online()?;
        Ok(self.staged.records.get(&id).cloned())
    }

    fn insert_record(&mut self, record: &CredentialRecord) -> Result<(), StoreError> {
        self.online()?;
        if !self.staged.principals.contains_key(&record.principal_id) {
            return Err(StoreError::integrity(format!(
                "principal {} does not exist",
                record.principal_id
            )));
        }
        if self.staged.records.contains_key(&record.principal_id) {
            return Err(StoreError::integrity(format!(
                "principal {} already has a credential record",
                record.principal_id
            )));
        }
        self.staged
            .records
            .insert(record.principal_id, record.clone());
        Ok(())
    }

    fn update_record(&mut self, record: &CredentialRecord) -> Result<(), StoreError> {
        self.online()?;
        match self.staged.records.get_mut(&record.principal_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::backend(format!(
                "no credential record for principal {}",
                record.principal_id
            ))),
        }
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.online()?;
        let MemoryUnitOfWork {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
