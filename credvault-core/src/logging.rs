//! Log sink contract and the masking adapter the vault writes through.
//!
//! Secret values never reach a sink as plain text: tokens travel as
//! [`Secret`](crate::Secret), which renders as `[REDACTED]`, and are put
//! into messages only through [`Masked`](crate::mask::Masked).

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

/// Subject id for system-scoped entries.
pub const SYSTEM_SUBJECT: i64 = 0;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Write-only destination for log entries.
pub trait LogSink: Send + Sync {
    /// `subject_id` is the principal the entry concerns, or
    /// [`SYSTEM_SUBJECT`].
    fn log(&self, level: LogLevel, message: &str, subject_id: i64);
}

/// Sink that forwards entries to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str, subject_id: i64) {
        match level {
            LogLevel::Debug => tracing::debug!(subject_id, "{}", message),
            LogLevel::Info => tracing::info!(subject_id, "{}", message),
            LogLevel::Warning => tracing::warn!(subject_id, "{}", message),
            LogLevel::Error => tracing::error!(subject_id, "{}", message),
        }
    }
}

/// One captured entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub subject_id: i64,
}

/// Sink that keeps entries in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Whether any captured message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.lock().iter().any(|e| e.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, message: &str, subject_id: i64) {
        self.entries.lock().push(LogEntry {
            level,
            message: message.to_string(),
            subject_id,
        });
    }
}

/// The adapter the credential vault logs through.
#[derive(Clone)]
pub struct CredentialLog {
    sink: Arc<dyn LogSink>,
}

impl CredentialLog {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn debug(&self, subject_id: i64, message: fmt::Arguments<'_>) {
        self.emit(LogLevel::Debug, subject_id, message);
    }

    pub fn info(&self, subject_id: i64, message: fmt::Arguments<'_>) {
        self.emit(LogLevel::Info, subject_id, message);
    }

    pub fn warning(&self, subject_id: i64, message: fmt::Arguments<'_>) {
        self.emit(LogLevel::Warning, subject_id, message);
    }

    pub fn error(&self, subject_id: i64, message: fmt::Arguments<'_>) {
        self.emit(LogLevel::Error, subject_id, message);
    }

    fn emit(&self, level: LogLevel, subject_id: i64, message: fmt::Arguments<'_>) {
        match message.as_str() {
            Some(text) => self.sink.log(level, text, subject_id),
            None => self.sink.log(level, &message.to_string(), subject_id),
        }
    }
}

impl Default for CredentialLog {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl fmt::Debug for CredentialLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLog").finish_non_exhaustive()
    }
}

/// Install a `tracing` subscriber for the process.
///
/// `RUST_LOG` wins over `default_filter`. Returns `false` if a global
/// subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    subscriber_fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
