//! Credential persistence using SQLite.
//!
//! Stores principals and their encrypted credential records. Token columns
//! only ever hold ciphertext, digests and salts produced by the codec.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::time::Duration;

use super::{Backend, StoreError, UnitOfWork};
use crate::codec::{clamp_storable, parse_timestamp};
use crate::model::{CredentialRecord, Principal, PrincipalId};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS principals (
        principal_id INTEGER PRIMARY KEY,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        age INTEGER,
        sex INTEGER,
        city TEXT,
        city_id INTEGER,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS credential_records (
        id INTEGER PRIMARY KEY,
        principal_id INTEGER NOT NULL UNIQUE
            REFERENCES principals(principal_id) ON DELETE CASCADE,
        min_age INTEGER NOT NULL DEFAULT 18,
        max_age INTEGER NOT NULL DEFAULT 35,
        encrypted_access_token TEXT,
        encrypted_refresh_token TEXT,
        refresh_token_hash TEXT,
        token_salt TEXT,
        token_iv TEXT,
        token_expires_at TEXT,
        token_updated_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
"#;

/// Credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// principals(principal_id PK, first_name, last_name, age, sex, city, city_id, created_at)
/// credential_records(
///     id PK,
///     principal_id UNIQUE -> principals ON DELETE CASCADE,
///     min_age, max_age,
///     encrypted_access_token, encrypted_refresh_token,  -- ciphertext
///     refresh_token_hash, token_salt, token_iv,          -- hex
///     token_expires_at, token_updated_at,                -- RFC 3339, UTC
///     created_at, updated_at
/// )
/// ```
///
/// # Thread Safety
/// - The connection is wrapped in a mutex; a unit of work holds it until
///   it commits, rolls back or is dropped
/// - Lock waits inside SQLite are bounded by the busy timeout, and a timeout
///   surfaces as [`StoreError::Unavailable`]
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create a database file.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(classify)?;
        Self::init(conn, busy_timeout)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Self::init(conn, Duration::from_secs(5))
    }

    fn init(conn: Connection, busy_timeout: Duration) -> Result<Self, StoreError> {
        conn.busy_timeout(busy_timeout).map_err(classify)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(classify)?;
        conn.execute_batch(SCHEMA).map_err(classify)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl Backend for SqliteBackend {
    fn ping(&self) -> Result<(), StoreError> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(classify)
    }

    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(classify)?;
        Ok(Box::new(SqliteUnitOfWork {
            conn,
            finished: false,
        }))
    }
}

struct SqliteUnitOfWork<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl SqliteUnitOfWork<'_> {
    /// A failed COMMIT leaves the transaction open; Drop then rolls it back.
    fn finish(&mut self, statement: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(statement).map_err(classify)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("Failed to roll back abandoned unit of work: {}", e);
            }
        }
    }
}

impl UnitOfWork for SqliteUnitOfWork<'_> {
    fn find_principal(&mut self, id: PrincipalId) -> Result<Option<Principal>, StoreError> {
        self.conn
            .query_row(
                r#"
                SELECT first_name, last_name, age, sex, city, city_id
                FROM principals
                WHERE principal_id = ?1
                "#,
                params![id.get()],
                |row| {
                    Ok(Principal {
                        id,
                        first_name: row.get(0)?,
                        last_name: row.get(1)?,
                        age: row.get(2)?,
                        sex: row.get(3)?,
                        city: row.get(4)?,
                        city_id: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(classify)
    }

    fn insert_principal(&mut self, principal: &Principal) -> Result<(), StoreError> {
        self.conn
            .execute(
                r#"
                INSERT INTO principals (
                    principal_id, first_name, last_name, age, sex, city, city_id, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    principal.id.get(),
                    principal.first_name,
                    principal.last_name,
                    principal.age,
                    principal.sex,
                    principal.city,
                    principal.city_id,
                    format_timestamp(Utc::now()),
                ],
            )
            .map(|_| ())
            .map_err(classify)
    }

    fn find_record(&mut self, id: PrincipalId) -> Result<Option<CredentialRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT min_age, max_age,
                       encrypted_access_token, encrypted_refresh_token,
                       refresh_token_hash, token_salt, token_iv,
                       token_expires_at, token_updated_at
                FROM credential_records
                WHERE principal_id = ?1
                "#,
                params![id.get()],
                |row| {
                    let record = CredentialRecord {
                        principal_id: id,
                        min_age: row.get(0)?,
                        max_age: row.get(1)?,
                        encrypted_access_token: row.get(2)?,
                        encrypted_refresh_token: row.get(3)?,
                        refresh_token_hash: row.get(4)?,
                        token_salt: row.get(5)?,
                        token_iv: row.get(6)?,
                        token_expires_at: None,
                        token_updated_at: None,
                    };
                    let expires_at: Option<String> = row.get(7)?;
                    let updated_at: Option<String> = row.get(8)?;
                    Ok((record, expires_at, updated_at))
                },
            )
            .optional()
            .map_err(classify)?;

        let Some((mut record, expires_at, updated_at)) = row else {
            return Ok(None);
        };
        record.token_expires_at = read_timestamp(expires_at, "token_expires_at")?;
        record.token_updated_at = read_timestamp(updated_at, "token_updated_at")?;
        Ok(Some(record))
    }

    fn insert_record(&mut self, record: &CredentialRecord) -> Result<(), StoreError> {
        let now = format_timestamp(Utc::now());
        self.conn
            .execute(
                r#"
                INSERT INTO credential_records (
                    principal_id, min_age, max_age,
                    encrypted_access_token, encrypted_refresh_token,
                    refresh_token_hash, token_salt, token_iv,
                    token_expires_at, token_updated_at,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    record.principal_id.get(),
                    record.min_age,
                    record.max_age,
                    record.encrypted_access_token,
                    record.encrypted_refresh_token,
                    record.refresh_token_hash,
                    record.token_salt,
                    record.token_iv,
                    record.token_expires_at.map(format_timestamp),
                    record.token_updated_at.map(format_timestamp),
                    now,
                    now,
                ],
            )
            .map(|_| ())
            .map_err(classify)
    }

    fn update_record(&mut self, record: &CredentialRecord) -> Result<(), StoreError> {
        let rows = self
            .conn
            .execute(
                r#"
                UPDATE credential_records SET
                    min_age = ?2,
                    max_age = ?3,
                    encrypted_access_token = ?4,
                    encrypted_refresh_token = ?5,
                    refresh_token_hash = ?6,
                    token_salt = ?7,
                    token_iv = ?8,
                    token_expires_at = ?9,
                    token_updated_at = ?10,
                    updated_at = ?11
                WHERE principal_id = ?1
                "#,
                params![
                    record.principal_id.get(),
                    record.min_age,
                    record.max_age,
                    record.encrypted_access_token,
                    record.encrypted_refresh_token,
                    record.refresh_token_hash,
                    record.token_salt,
                    record.token_iv,
                    record.token_expires_at.map(format_timestamp),
                    record.token_updated_at.map(format_timestamp),
                    format_timestamp(Utc::now()),
                ],
            )
            .map_err(classify)?;

        if rows == 0 {
            return Err(StoreError::backend(format!(
                "no credential record for principal {}",
                record.principal_id
            )));
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK")
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    clamp_storable(ts).to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn read_timestamp(raw: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|raw| {
        parse_timestamp(&raw)
            .ok_or_else(|| StoreError::backend(format!("unreadable {column} value '{raw}'")))
    })
    .transpose()
}

/// Sort SQLite failures into the store's error taxonomy.
fn classify(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => StoreError::integrity(e.to_string()),
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::NotADatabase
            | ErrorCode::DiskFull
            | ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly
            | ErrorCode::FileLockingProtocolFailed => StoreError::unavailable(e.to_string()),
            _ => StoreError::backend(e.to_string()),
        },
        _ => StoreError::backend(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::exercise_backend;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_backend_contract() {
        exercise_backend(&SqliteBackend::open_in_memory().unwrap());
    }

    #[test]
    fn test_data_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("credentials.db");
        let id = PrincipalId::new(42);

        {
            let backend = SqliteBackend::open(&path, Duration::from_secs(1)).unwrap();
            let mut uow = backend.begin().unwrap();
            uow.insert_principal(&Principal::placeholder(id)).unwrap();
            uow.insert_record(&CredentialRecord::new(id)).unwrap();
            uow.commit().unwrap();
        }

        let backend = SqliteBackend::open(&path, Duration::from_secs(1)).unwrap();
        let mut uow = backend.begin().unwrap();
        assert!(uow.find_record(id).unwrap().is_some());
    }

    #[test]
    fn test_dropped_unit_of_work_rolls_back() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        {
            let mut uow = backend.begin().unwrap();
            uow.insert_principal(&Principal::placeholder(PrincipalId::new(5)))
                .unwrap();
        }
        let mut uow = backend.begin().unwrap();
        assert!(uow.find_principal(PrincipalId::new(5)).unwrap().is_none());
    }

    #[test]
    fn test_naive_timestamps_read_as_utc() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let id = PrincipalId::new(9);
        {
            let mut uow = backend.begin().unwrap();
            uow.insert_principal(&Principal::placeholder(id)).unwrap();
            uow.insert_record(&CredentialRecord::new(id)).unwrap();
            uow.commit().unwrap();
        }
        backend
            .conn
            .lock()
            .execute(
                "UPDATE credential_records SET token_expires_at = '2030-06-01 12:00:00' WHERE principal_id = 9",
                [],
            )
            .unwrap();

        let mut uow = backend.begin().unwrap();
        let record = uow.find_record(id).unwrap().unwrap();
        assert_eq!(
            record.token_expires_at.map(|t| t.to_rfc3339()),
            Some("2030-06-01T12:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_out_of_range_expiry_stays_readable() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let id = PrincipalId::new(11);
        let mut record = CredentialRecord::new(id);
        {
            let mut uow = backend.begin().unwrap();
            uow.insert_principal(&Principal::placeholder(id)).unwrap();
            uow.insert_record(&record).unwrap();
            record.token_expires_at = Some(DateTime::<Utc>::MAX_UTC);
            uow.update_record(&record).unwrap();
            uow.commit().unwrap();
        }

        let mut uow = backend.begin().unwrap();
        let stored = uow.find_record(id).unwrap().unwrap();
        assert_eq!(
            stored.token_expires_at,
            Some(clamp_storable(DateTime::<Utc>::MAX_UTC))
        );

        // The record can still be rewritten
        uow.update_record(&CredentialRecord::new(id)).unwrap();
        uow.commit().unwrap();
    }

    #[test]
    fn test_lock_contention_is_unavailable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let locked = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        );
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );

        assert!(classify(busy).is_operational());
        assert!(classify(locked).is_operational());
        assert!(matches!(classify(constraint), StoreError::Integrity { .. }));
        assert!(matches!(
            classify(rusqlite::Error::QueryReturnedNoRows),
            StoreError::Backend { .. }
        ));
    }

    #[test]
    fn test_unopenable_path_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing-dir").join("credentials.db");
        let result = SqliteBackend::open(path, Duration::from_millis(100));
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));
    }
}
