//! Error classification traits for retry logic and error handling.
//!
//! These traits allow errors to self-describe their characteristics,
//! enabling generic retry logic and error handling patterns.

use std::time::Duration;

use super::common::*;

/// Classification of error types for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient errors that may resolve on retry (network issues, timeouts)
    Transient,
    /// Permanent errors that won't resolve on retry (invalid input, rejected request)
    Permanent,
    /// Resource exhaustion errors (rate limits, pool exhausted)
    ResourceExhausted,
    /// Configuration errors (missing config, invalid settings)
    Configuration,
    /// Internal errors (bugs, unexpected state)
    Internal,
}

/// Trait for errors that can classify themselves for retry logic.
///
/// # Example
///
/// ```rust,ignore
/// use market_common::error::ErrorClassification;
///
/// async fn with_retry<T, E, F, Fut>(mut f: F) -> Result<T, E>
/// where
///     E: ErrorClassification,
///     F: FnMut() -> Fut,
///     Fut: std::future::Future<Output = Result<T, E>>,
/// {
///     let mut attempts = 0;
///     loop {
///         match f().await {
///             Ok(v) => return Ok(v),
///             Err(e) if e.is_transient() && attempts < e.max_retries() => {
///                 if let Some(delay) = e.suggested_retry_delay() {
///                     tokio::time::sleep(delay).await;
///                 }
///                 attempts += 1;
///             }
///             Err(e) => return Err(e),
///         }
///     }
/// }
/// ```
pub trait ErrorClassification {
    /// Returns the category of this error
    fn category(&self) -> ErrorCategory;

    /// Returns true if this error is transient and may succeed on retry
    fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::ResourceExhausted
        )
    }

    /// Returns true if this error is permanent and won't succeed on retry
    fn is_permanent(&self) -> bool {
        matches!(self.category(), ErrorCategory::Permanent)
    }

    /// Suggests a delay before retrying, if applicable
    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Duration::from_millis(100)),
            ErrorCategory::ResourceExhausted => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    /// Returns the maximum number of retries suggested for this error
    fn max_retries(&self) -> u32 {
        match self.category() {
            ErrorCategory::Transient => 3,
            ErrorCategory::ResourceExhausted => 5,
            _ => 0,
        }
    }
}

impl ErrorClassification for DatabaseError {
    fn category(&self) -> ErrorCategory {
        match self {
            DatabaseError::Connection(_) => ErrorCategory::Transient,
            DatabaseError::PoolExhausted => ErrorCategory::ResourceExhausted,
            DatabaseError::Timeout(_) => ErrorCategory::Transient,
            DatabaseError::Query(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            DatabaseError::PoolExhausted => Some(Duration::from_millis(500)),
            DatabaseError::Timeout(_) => Some(Duration::from_millis(100)),
            DatabaseError::Connection(_) => Some(Duration::from_secs(1)),
            DatabaseError::Query(_) => None,
        }
    }
}

impl ErrorClassification for NetworkError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Transient
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            NetworkError::Timeout(_) => Some(Duration::from_millis(500)),
            NetworkError::Connection(_) => Some(Duration::from_secs(1)),
            _ => Some(Duration::from_millis(100)),
        }
    }
}

impl ErrorClassification for ConfigurationError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }

    fn max_retries(&self) -> u32 {
        0
    }
}
