//! Engine configuration.

use std::time::Duration;

/// Retry/timeout policy for an eventually-consistent batch.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How long to wait after a recoverable per-entity failure before the
    /// next attempt.
    pub retry_interval: Duration,

    /// How long the batch drives each entity before giving up on it.
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

impl BatchConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry interval.
    #[must_use]
    pub const fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the batch timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Identity of the database, used by cross-database references.
    pub id: String,

    /// Schema version stamped onto every entity this database loads or
    /// creates.
    pub schema_version: i64,
}

impl DatabaseConfig {
    /// Creates a configuration for the database named `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            schema_version: 1,
        }
    }

    /// Sets the schema version stamp.
    #[must_use]
    pub fn schema_version(mut self, version: i64) -> Self {
        self.schema_version = version;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn builder_pattern() {
        let config = BatchConfig::new()
            .retry_interval(Duration::from_millis(50))
            .timeout(Duration::from_secs(5));
        assert_eq!(config.retry_interval, Duration::from_millis(50));
        assert_eq!(config.timeout, Duration::from_secs(5));

        let db = DatabaseConfig::new("main").schema_version(4);
        assert_eq!(db.id, "main");
        assert_eq!(db.schema_version, 4);
    }
}
