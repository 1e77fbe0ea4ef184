//! Error types for accessor operations.

use thiserror::Error;

/// Result type for accessor operations.
pub type AccessorResult<T> = Result<T, AccessorError>;

/// How the engine is allowed to react to a failed accessor operation.
///
/// The classification belongs to the accessor implementation: the engine
/// never inspects message text to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient failure; the operation may be retried as-is.
    Recoverable,
    /// Permanent failure (malformed payload, constraint violation);
    /// retrying cannot succeed.
    Unrecoverable,
}

/// An error reported by a storage accessor.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AccessorError {
    /// Whether the operation is retry-eligible.
    pub class: ErrorClass,
    /// Human-readable description of the failure.
    pub message: String,
}

impl AccessorError {
    /// Creates a recoverable (retry-eligible) error.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Recoverable,
            message: message.into(),
        }
    }

    /// Creates an unrecoverable (permanent) error.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Unrecoverable,
            message: message.into(),
        }
    }

    /// Returns true if the operation may be retried.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.class == ErrorClass::Recoverable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(AccessorError::recoverable("busy").is_recoverable());
        assert!(!AccessorError::unrecoverable("corrupt").is_recoverable());
    }

    #[test]
    fn display_is_message() {
        let err = AccessorError::recoverable("connection reset");
        assert_eq!(format!("{err}"), "connection reset");
    }
}
