//! Error types for the dataset cache
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Propagation
//!
//! - `Instantiation` and `TypeMismatch` surface synchronously from `get`.
//! - `InternalConsistency` means the cache itself is broken; callers must
//!   discard the cache instance.
//! - `Release` never escapes a single release; teardown collects them into
//!   `CleanupFailed` once every other step has run.

use std::error::Error as StdError;
use thiserror::Error;

/// Result type alias for cache operations
pub type StrataResult<T> = std::result::Result<T, StrataError>;

/// Boxed source error carried by instantiation failures
pub type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

/// Error type for the dataset cache and its transaction contexts
#[derive(Debug, Error)]
pub enum StrataError {
    /// The instantiator failed or produced nothing for a requested dataset
    #[error("{reason}")]
    Instantiation {
        /// Dataset name
        name: String,
        /// Human-readable reason
        reason: String,
        /// Underlying instantiator error, if any
        #[source]
        source: Option<BoxedSource>,
    },

    /// A cached dataset exists but is not of the requested type
    #[error("Could not cast dataset '{key}' to requested type. Actual type is {actual}.")]
    TypeMismatch {
        /// Dataset name
        name: String,
        /// Rendered key of the cached entry
        key: String,
        /// Type name of the stored dataset
        actual: String,
    },

    /// The cache and the participant tracker disagree about an instance
    #[error("Unexpected state: {message}. This should never happen.")]
    InternalConsistency {
        /// Description of the divergence
        message: String,
    },

    /// Closing a dataset or participant failed
    #[error("Error closing '{name}': {message}")]
    Release {
        /// Name of what was being closed
        name: String,
        /// Failure description
        message: String,
    },

    /// Best-effort teardown finished with failures
    #[error("Cleanup finished with {} failure(s): {}", failures.len(), failures.join("; "))]
    CleanupFailed {
        /// One entry per failed step
        failures: Vec<String>,
    },

    /// The coordinator detected a conflicting change set
    #[error("Transaction {txn_id} aborted: conflict detected")]
    TransactionConflict {
        /// Conflicting transaction
        txn_id: u64,
    },

    /// A participant or the coordinator failed while driving a transaction
    #[error("Transaction {txn_id} failed: {reason}")]
    TransactionFailure {
        /// Transaction that failed
        txn_id: u64,
        /// Failure description
        reason: String,
    },

    /// Operation not permitted in the current state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the violated precondition
        message: String,
    },

    /// Invalid input (configuration, arguments)
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Description of the problem
        message: String,
    },

    /// Internal failure (I/O and similar)
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },
}

impl StrataError {
    /// Instantiation failed with an underlying error
    pub fn instantiation(name: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        let name = name.into();
        StrataError::Instantiation {
            reason: format!("Could not instantiate dataset '{}'", name),
            name,
            source: Some(source.into()),
        }
    }

    /// The instantiator returned nothing for the dataset
    pub fn dataset_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        StrataError::Instantiation {
            reason: format!("Dataset '{}' does not exist", name),
            name,
            source: None,
        }
    }

    /// Cache and tracker diverged
    pub fn internal_consistency(message: impl Into<String>) -> Self {
        StrataError::InternalConsistency {
            message: message.into(),
        }
    }

    /// A close operation failed
    pub fn release(name: impl Into<String>, message: impl Into<String>) -> Self {
        StrataError::Release {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Operation not permitted in the current state
    pub fn invalid_state(message: impl Into<String>) -> Self {
        StrataError::InvalidState {
            message: message.into(),
        }
    }

    /// Invalid input
    pub fn invalid_input(message: impl Into<String>) -> Self {
        StrataError::InvalidInput {
            message: message.into(),
        }
    }

    /// Internal failure
    pub fn internal(message: impl Into<String>) -> Self {
        StrataError::Internal {
            message: message.into(),
        }
    }

    /// Whether this error signals a broken cache that must not be reused
    pub fn is_fatal(&self) -> bool {
        matches!(self, StrataError::InternalConsistency { .. })
    }

    /// Whether this error came from loading a dataset
    pub fn is_instantiation(&self) -> bool {
        matches!(self, StrataError::Instantiation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display_instantiation() {
        let err = StrataError::instantiation(
            "purchases",
            io::Error::new(io::ErrorKind::Other, "table missing"),
        );
        let msg = err.to_string();
        assert!(msg.contains("Could not instantiate dataset 'purchases'"));
        assert!(err.source().is_some());
        assert!(err.is_instantiation());
    }

    #[test]
    fn test_error_display_not_found() {
        let err = StrataError::dataset_not_found("ghost");
        assert_eq!(err.to_string(), "Dataset 'ghost' does not exist");
        assert!(err.source().is_none());
        assert!(err.is_instantiation());
    }

    #[test]
    fn test_error_display_type_mismatch() {
        let err = StrataError::TypeMismatch {
            name: "kv".to_string(),
            key: "kv".to_string(),
            actual: "KeyValueTable".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'kv'"));
        assert!(msg.contains("KeyValueTable"));
    }

    #[test]
    fn test_type_mismatch_names_full_key() {
        let err = StrataError::TypeMismatch {
            name: "kv".to_string(),
            key: "kv{ttl=5}".to_string(),
            actual: "KeyValueTable".to_string(),
        };
        assert!(err.to_string().starts_with("Could not cast dataset 'kv{ttl=5}'"));
    }

    #[test]
    fn test_error_cleanup_summary() {
        let err = StrataError::CleanupFailed {
            failures: vec!["a failed".to_string(), "b failed".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 failure(s)"));
        assert!(msg.contains("a failed; b failed"));
    }

    #[test]
    fn test_only_consistency_is_fatal() {
        assert!(StrataError::internal_consistency("diverged").is_fatal());
        assert!(!StrataError::dataset_not_found("x").is_fatal());
        assert!(!StrataError::invalid_state("closed").is_fatal());
    }

    #[test]
    fn test_error_pattern_matching() {
        let err = StrataError::TransactionConflict { txn_id: 7 };
        match err {
            StrataError::TransactionConflict { txn_id } => assert_eq!(txn_id, 7),
            _ => panic!("Wrong error variant"),
        }
    }
}
