//! Error types for the Perdure engine.

use perdure_accessor::AccessorError;
use std::fmt;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Perdure engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A storage accessor operation failed.
    #[error("accessor error: {0}")]
    Accessor(#[from] AccessorError),

    /// Encoding or decoding a persisted record failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A value was rejected at construction time.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the rejected value.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// A name or identity is already registered with a different value.
    #[error("duplicate registration: {key}")]
    DuplicateRegistration {
        /// The conflicting key.
        key: String,
    },

    /// A reference names a database id that is not registered.
    #[error("unknown database: {id}")]
    UnknownDatabase {
        /// The database id that was not found.
        id: String,
    },

    /// A reference was decoded without the side-channel context that
    /// identifies its owning parent entity.
    #[error("reference has no parent context")]
    NoParentData,

    /// A reference resolution is negative-cached after a recent failure.
    #[error("reference resolution suspended: {message}")]
    ReferenceSuspended {
        /// The cached failure message.
        message: String,
    },

    /// Loading an entity from the backing store failed.
    ///
    /// Carried as a message so that coalesced callers of a single-flight
    /// load can all receive the same failure.
    #[error("retrieval failed: {message}")]
    Retrieval {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a duplicate registration error.
    pub fn duplicate_registration(key: impl Into<String>) -> Self {
        Self::DuplicateRegistration { key: key.into() }
    }

    /// Creates an unknown database error.
    pub fn unknown_database(id: impl Into<String>) -> Self {
        Self::UnknownDatabase { id: id.into() }
    }

    /// Creates a reference suspended error.
    pub fn reference_suspended(message: impl Into<String>) -> Self {
        Self::ReferenceSuspended {
            message: message.into(),
        }
    }

    /// Creates a retrieval error.
    pub fn retrieval(message: impl Into<String>) -> Self {
        Self::Retrieval {
            message: message.into(),
        }
    }
}

/// The result of a single entity commit invocation.
///
/// `Error` and `TimedOut` are recoverable: the entity rolled back to its
/// pre-attempt stable state and a retry may succeed. `Unrecoverable` means
/// no automatic retry will be attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The entity settled into a stable persisted (or terminal) state.
    Ok,
    /// A recoverable failure; the entity reverted to its previous state.
    Error(String),
    /// The caller's wait elapsed. The in-flight operation was not cancelled
    /// and the entity's state converges independently.
    TimedOut,
    /// A permanent failure; retrying cannot succeed.
    Unrecoverable(String),
}

impl CommitOutcome {
    /// Returns true if the commit settled successfully.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true if a retry of this commit may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Error(_) | Self::TimedOut)
    }

    /// Returns true if no automatic retry should be attempted.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }

    /// Returns the failure message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::Error(m) | Self::Unrecoverable(m) => Some(m),
            Self::TimedOut => Some("timed out"),
        }
    }
}

impl fmt::Display for CommitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error(m) => write!(f, "error: {m}"),
            Self::TimedOut => write!(f, "error: timed out"),
            Self::Unrecoverable(m) => write!(f, "unrecoverable error: {m}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_classification() {
        assert!(CommitOutcome::Ok.is_ok());
        assert!(CommitOutcome::Error("busy".into()).is_recoverable());
        assert!(CommitOutcome::TimedOut.is_recoverable());
        assert!(CommitOutcome::Unrecoverable("corrupt".into()).is_unrecoverable());
        assert!(!CommitOutcome::Unrecoverable("corrupt".into()).is_recoverable());
    }

    #[test]
    fn timed_out_message() {
        assert_eq!(CommitOutcome::TimedOut.message(), Some("timed out"));
    }

    #[test]
    fn accessor_error_converts() {
        let err: CoreError = AccessorError::recoverable("io").into();
        assert!(matches!(err, CoreError::Accessor(_)));
    }
}
