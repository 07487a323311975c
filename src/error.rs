//! Error types.
//!
//! Errors are strongly typed with thiserror and layered the same way the
//! engine is: type-checking failures, storage-backend failures, and remote
//! analyzer failures each have their own enum, all folded into the
//! top-level [`StrataError`].

use thiserror::Error;

use crate::value::ValueType;

/// A fact failed validation against the schema registry.
///
/// Any of these rejects the *entire* enclosing `set_facts` batch; no partial
/// insert happens.
#[derive(Debug, Error)]
pub enum TypeError {
    /// The fact's predicate was never registered.
    #[error("unknown predicate '{predicate}'")]
    UnknownPredicate {
        /// Offending predicate name.
        predicate: String,
    },

    /// The fact has the wrong number of arguments.
    #[error("predicate '{predicate}' expects {expected} arguments, got {actual}")]
    ArityMismatch {
        /// Predicate name.
        predicate: String,
        /// Registered arity.
        expected: usize,
        /// Arity of the offending fact.
        actual: usize,
    },

    /// An argument's tag does not match the registered type.
    #[error("predicate '{predicate}' argument {position} expects {expected}, got {actual}")]
    ValueMismatch {
        /// Predicate name.
        predicate: String,
        /// Zero-based argument position.
        position: usize,
        /// Registered type at that position.
        expected: ValueType,
        /// Tag of the value actually supplied.
        actual: &'static str,
    },
}

/// A storage-backend failure.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Generic backend error (poisoned lock, SQL failure, ...).
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Could not reach the backend.
    #[error("storage connection error: {0}")]
    Connection(String),

    /// Startup schema discovery found a column this engine cannot map.
    /// Fatal: the registry cannot be reconstructed.
    #[error("table '{table}' column '{column}' has unsupported type '{sql_type}'")]
    UnsupportedColumn {
        /// Table name under the `facts` schema.
        table: String,
        /// Column name.
        column: String,
        /// The backend-reported type name.
        sql_type: String,
    },
}

/// A remote analyzer call failed.
///
/// The triggering `set`/`analyzer` operation aborts with this error; facts
/// ingested before the failure remain (the store is monotone, nothing rolls
/// back).
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The remote end reported a failure for one dispatched context.
    #[error("analyzer '{analyzer}' failed: {message}")]
    Remote {
        /// Analyzer name.
        analyzer: String,
        /// Remote-reported message.
        message: String,
    },

    /// The remote end went away before answering.
    #[error("analyzer '{analyzer}' disconnected")]
    Disconnected {
        /// Analyzer name.
        analyzer: String,
    },
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum StrataError {
    /// A fact failed type checking.
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A remote analyzer failed; the fixpoint was aborted.
    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// The query itself is malformed (independent of store contents).
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// What is wrong with it.
        reason: String,
    },

    /// Internal invariant violation.
    #[error("internal error: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl StrataError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a type-checking failure.
    #[must_use]
    pub const fn is_type(&self) -> bool {
        matches!(self, Self::Type(_))
    }

    /// Returns true if this is a storage failure.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a remote-analysis failure.
    #[must_use]
    pub const fn is_analysis(&self) -> bool {
        matches!(self, Self::Analysis(_))
    }
}

/// Result type alias used throughout the crate.
pub type StrataResult<T> = Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_error_display() {
        let err = TypeError::ValueMismatch {
            predicate: "seg".to_string(),
            position: 1,
            expected: ValueType::Addr,
            actual: "string",
        };
        let msg = err.to_string();
        assert!(msg.contains("seg"));
        assert!(msg.contains("argument 1"));
        assert!(msg.contains("expects addr"));
        assert!(msg.contains("got string"));
    }

    #[test]
    fn arity_error_display() {
        let err = TypeError::ArityMismatch {
            predicate: "p".to_string(),
            expected: 2,
            actual: 3,
        };
        assert!(err.to_string().contains("expects 2 arguments, got 3"));
    }

    #[test]
    fn storage_error_display() {
        let err = StorageError::UnsupportedColumn {
            table: "seg".to_string(),
            column: "arg0".to_string(),
            sql_type: "uuid".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("seg"));
        assert!(msg.contains("uuid"));
    }

    #[test]
    fn top_level_classification() {
        let err: StrataError = TypeError::UnknownPredicate {
            predicate: "p".to_string(),
        }
        .into();
        assert!(err.is_type());
        assert!(!err.is_storage());

        let err: StrataError = StorageError::Connection("refused".to_string()).into();
        assert!(err.is_storage());

        let err: StrataError = AnalysisError::Disconnected {
            analyzer: "a".to_string(),
        }
        .into();
        assert!(err.is_analysis());
        assert!(err.to_string().contains("disconnected"));

        let err = StrataError::internal("bad state");
        assert!(err.to_string().contains("bad state"));
    }
}
