//! Logging sink contract.
//!
//! The engine reports through a narrow [`LogSink`] interface so hosts can
//! route diagnostics into their own infrastructure. The default sink
//! forwards to [`tracing`].

use parking_lot::Mutex;
use std::sync::Arc;

/// Severity of a log record.
///
/// The engine emits: `Emergency` for registration/invariant failures,
/// `Error` for unrecoverable entity errors, lost data on batch teardown,
/// and batch timeouts, and `Warning` for cache misses against unknown ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Informational messages.
    Info,
    /// Unexpected but tolerated conditions.
    Warning,
    /// Failures the engine could not recover from.
    Error,
    /// Invariant violations and registration failures.
    Emergency,
}

impl LogLevel {
    /// Returns the level name used in log output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Emergency => "emergency",
        }
    }
}

/// A sink for engine diagnostics.
///
/// `source` names the emitting component (`"entity"`, `"batch"`, ...),
/// `feature` the operation within it (`"commit"`, `"batchTimeout"`, ...),
/// and `context` carries structured key/value pairs such as entity ids.
pub trait LogSink: Send + Sync {
    /// Records one log entry.
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        feature: &str,
        message: &str,
        context: &[(&str, String)],
    );
}

/// The default sink: forwards records to the `tracing` macros.
///
/// `Emergency` and `Error` map to `tracing::error!`, `Warning` to
/// `tracing::warn!`, and the rest to their obvious counterparts.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TracingSink {
    /// Creates a new tracing-backed sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Convenience constructor returning the sink ready for sharing.
    #[must_use]
    pub fn shared() -> Arc<dyn LogSink> {
        Arc::new(Self)
    }
}

impl LogSink for TracingSink {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        feature: &str,
        message: &str,
        context: &[(&str, String)],
    ) {
        match level {
            LogLevel::Debug => {
                tracing::debug!(source, feature, ?context, "{message}");
            }
            LogLevel::Info => {
                tracing::info!(source, feature, ?context, "{message}");
            }
            LogLevel::Warning => {
                tracing::warn!(source, feature, ?context, "{message}");
            }
            LogLevel::Error => {
                tracing::error!(source, feature, ?context, "{message}");
            }
            LogLevel::Emergency => {
                tracing::error!(source, feature, ?context, severity = "emergency", "{message}");
            }
        }
    }
}

/// One captured log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Severity.
    pub level: LogLevel,
    /// Emitting component.
    pub source: String,
    /// Operation within the component.
    pub feature: String,
    /// Log message.
    pub message: String,
    /// Structured key/value context.
    pub context: Vec<(String, String)>,
}

impl LogRecord {
    /// Returns the context value for `key`, if present.
    #[must_use]
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A sink that captures records in memory, for test assertions.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    /// Creates a new empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all captured records.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Returns the captured records at `level`.
    #[must_use]
    pub fn records_at(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    /// Returns the number of records captured at `level`.
    #[must_use]
    pub fn count_at(&self, level: LogLevel) -> usize {
        self.records.lock().iter().filter(|r| r.level == level).count()
    }

    /// Clears all captured records.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn log(
        &self,
        level: LogLevel,
        source: &str,
        feature: &str,
        message: &str,
        context: &[(&str, String)],
    ) {
        self.records.lock().push(LogRecord {
            level,
            source: source.to_string(),
            feature: feature.to_string(),
            message: message.to_string(),
            context: context
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        });
    }
}
