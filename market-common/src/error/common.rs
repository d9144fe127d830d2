//! Common error types shared across crates.
//!
//! These represent failure modes that occur in more than one crate. Crate
//! specific errors wrap them using `#[from]`.

use std::time::Duration;
use thiserror::Error;

/// Database-related errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DatabaseError {
    /// Query execution failed
    #[error("Query failed: {0}")]
    Query(String),

    /// Connection to database failed
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Connection pool exhausted
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Query timeout
    #[error("Query timeout after {0:?}")]
    Timeout(Duration),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => DatabaseError::PoolExhausted,
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => DatabaseError::Connection(err.to_string()),
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

/// Network-related errors for the upstream socket and the shared counter store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NetworkError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Connection timeout
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// Send operation failed
    #[error("Send failed: {0}")]
    Send(String),

    /// Connection was closed by the peer
    #[error("Connection closed: {0}")]
    Closed(String),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Field has invalid value
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Configuration source could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ConfigurationError {
    /// Create an InvalidValue error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_maps_to_exhausted() {
        let err: DatabaseError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DatabaseError::PoolExhausted));
    }

    #[test]
    fn test_invalid_value_message() {
        let err = ConfigurationError::invalid("rate_limit.general.max_requests", "must be > 0");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'rate_limit.general.max_requests': must be > 0"
        );
    }
}
