//! Error types for record access.

use thiserror::Error;

/// Boxed cause carried by store-level failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Record access error type.
#[derive(Debug, Error)]
pub enum DataError {
    /// No connection became available within the acquire policy.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool was disposed.
    #[error("connection pool closed")]
    PoolClosed,

    /// Commit (or the flush preceding it) failed and the transaction was rolled back.
    #[error("transaction failed: {0}")]
    TransactionFailed(#[source] BoxError),

    /// Store-level failure: constraint violation, connectivity loss, malformed predicate.
    #[error("data access error: {0}")]
    DataAccess(#[source] BoxError),

    /// A record was passed to an operation for a different schema.
    #[error("record of schema `{found}` passed where `{expected}` was expected")]
    SchemaMismatch {
        /// Schema named by the call.
        expected: String,
        /// Schema the record belongs to.
        found: String,
    },

    /// The schema was never registered with the store.
    #[error("unknown schema `{0}`")]
    UnknownSchema(String),

    /// The field is not declared by the schema.
    #[error("schema `{schema}` has no field `{field}`")]
    UnknownField {
        /// Schema name.
        schema: String,
        /// Offending field name.
        field: String,
    },

    /// The value does not fit the declared column type.
    #[error("value for field `{field}` is not a valid {expected}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Declared type name.
        expected: &'static str,
    },

    /// A schema declaration was rejected.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DataError {
    /// Wraps a plain message as a store-level failure.
    pub fn access(message: impl Into<String>) -> Self {
        DataError::DataAccess(message.into().into())
    }

    /// Returns true for failures raised by the pool rather than the store.
    pub fn is_pool_error(&self) -> bool {
        matches!(self, DataError::PoolExhausted | DataError::PoolClosed)
    }
}

/// Result type for record access operations.
pub type DataResult<T> = Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_message() {
        let err = DataError::access("no such table: users");
        assert_eq!(err.to_string(), "data access error: no such table: users");
        assert!(!err.is_pool_error());
    }

    #[test]
    fn test_transaction_failed_keeps_source() {
        let err = DataError::TransactionFailed(Box::new(DataError::access("disk full")));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "data access error: disk full");
    }
}
