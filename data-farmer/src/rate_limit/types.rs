//! Rate limit categories, limits, settings and errors

use market_common::error::{ErrorCategory, ErrorClassification, NetworkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Upstream budget a request counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    /// Any upstream message
    General,
    /// Historical data requests
    Historical,
    /// Live market data subscriptions
    LiveSubscription,
    /// Repeats of one exact request, keyed by fingerprint
    IdenticalRequest,
}

impl RateCategory {
    pub const ALL: [RateCategory; 4] = [
        RateCategory::General,
        RateCategory::Historical,
        RateCategory::LiveSubscription,
        RateCategory::IdenticalRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateCategory::General => "general",
            RateCategory::Historical => "historical",
            RateCategory::LiveSubscription => "live_subscription",
            RateCategory::IdenticalRequest => "identical_request",
        }
    }

    /// Whether windows are kept per request fingerprint
    pub fn is_fingerprinted(&self) -> bool {
        matches!(self, RateCategory::IdenticalRequest)
    }
}

impl fmt::Display for RateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most `max_requests` admissions in any trailing `window_secs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl CategoryLimit {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Sleep between admission attempts.
    ///
    /// Short windows (60s or less) poll at the average admission spacing;
    /// long windows use the fixed `long_window_poll`.
    pub fn poll_interval(&self, long_window_poll: Duration) -> Duration {
        if self.window_secs <= 60 {
            let spacing = self.window_secs as f64 / self.max_requests.max(1) as f64;
            Duration::from_secs_f64(spacing.max(0.001))
        } else {
            long_window_poll
        }
    }
}

/// Whether a violation locks only its own category or every category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockoutScope {
    #[default]
    Category,
    Global,
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_general")]
    pub general: CategoryLimit,
    #[serde(default = "default_historical")]
    pub historical: CategoryLimit,
    #[serde(default = "default_live_subscription")]
    pub live_subscription: CategoryLimit,
    #[serde(default = "default_identical_request")]
    pub identical_request: CategoryLimit,
    /// Lockout after the first violation
    #[serde(default = "default_base_penalty_secs")]
    pub base_penalty_secs: u64,
    /// Lockout ceiling before jitter
    #[serde(default = "default_max_penalty_secs")]
    pub max_penalty_secs: u64,
    /// Quiet period after which the violation counter resets
    #[serde(default = "default_violation_reset_secs")]
    pub violation_reset_secs: u64,
    /// Jitter applied to lockouts, as a fraction of the duration
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// Poll interval for windows longer than 60s
    #[serde(default = "default_long_window_poll_secs")]
    pub long_window_poll_secs: u64,
    /// Longest single sleep while waiting out a lockout
    #[serde(default = "default_lockout_poll_cap_secs")]
    pub lockout_poll_cap_secs: u64,
    #[serde(default)]
    pub lockout_scope: LockoutScope,
    /// Shared counter store; absent means process-local limiting only
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_general() -> CategoryLimit {
    CategoryLimit::new(40, 1)
}

fn default_historical() -> CategoryLimit {
    CategoryLimit::new(60, 600)
}

fn default_live_subscription() -> CategoryLimit {
    CategoryLimit::new(100, 60)
}

fn default_identical_request() -> CategoryLimit {
    CategoryLimit::new(1, 15)
}

fn default_base_penalty_secs() -> u64 {
    60
}

fn default_max_penalty_secs() -> u64 {
    600
}

fn default_violation_reset_secs() -> u64 {
    3600
}

fn default_jitter_ratio() -> f64 {
    0.25
}

fn default_long_window_poll_secs() -> u64 {
    10
}

fn default_lockout_poll_cap_secs() -> u64 {
    60
}

fn default_key_prefix() -> String {
    "farmer_rate_limit".to_string()
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            general: default_general(),
            historical: default_historical(),
            live_subscription: default_live_subscription(),
            identical_request: default_identical_request(),
            base_penalty_secs: default_base_penalty_secs(),
            max_penalty_secs: default_max_penalty_secs(),
            violation_reset_secs: default_violation_reset_secs(),
            jitter_ratio: default_jitter_ratio(),
            long_window_poll_secs: default_long_window_poll_secs(),
            lockout_poll_cap_secs: default_lockout_poll_cap_secs(),
            lockout_scope: LockoutScope::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl RateLimitSettings {
    pub fn limit(&self, category: RateCategory) -> CategoryLimit {
        match category {
            RateCategory::General => self.general,
            RateCategory::Historical => self.historical,
            RateCategory::LiveSubscription => self.live_subscription,
            RateCategory::IdenticalRequest => self.identical_request,
        }
    }

    /// Replace one category's limit
    pub fn with_limit(mut self, category: RateCategory, limit: CategoryLimit) -> Self {
        match category {
            RateCategory::General => self.general = limit,
            RateCategory::Historical => self.historical = limit,
            RateCategory::LiveSubscription => self.live_subscription = limit,
            RateCategory::IdenticalRequest => self.identical_request = limit,
        }
        self
    }

    /// Disable lockout jitter (deterministic tests)
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }
}

/// Read-only view of one category's budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub category: RateCategory,
    /// Admissions inside the trailing window
    pub current: u32,
    pub max: u32,
    pub window_secs: u64,
    pub percent_used: f64,
    pub in_lockout: bool,
    /// Seconds until the lockout clears, if one is active
    pub lockout_remaining_secs: Option<f64>,
    pub consecutive_violations: u32,
}

/// Rate limiter errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RateLimitError {
    /// Shared counter store failed; the limiter degrades to process-local state
    #[error("Rate window store error: {0}")]
    Store(#[from] NetworkError),

    /// Admission did not happen before the caller's deadline
    #[error("Rate limit for {category} not admitted within {waited:?}")]
    DeadlineExceeded {
        category: RateCategory,
        waited: Duration,
    },
}

impl ErrorClassification for RateLimitError {
    fn category(&self) -> ErrorCategory {
        match self {
            RateLimitError::Store(_) => ErrorCategory::Transient,
            RateLimitError::DeadlineExceeded { .. } => ErrorCategory::ResourceExhausted,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            RateLimitError::Store(e) => e.suggested_retry_delay(),
            RateLimitError::DeadlineExceeded { .. } => None,
        }
    }
}

/// Result type for rate limiter operations
pub type RateLimitResult<T> = Result<T, RateLimitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.limit(RateCategory::General), CategoryLimit::new(40, 1));
        assert_eq!(settings.limit(RateCategory::Historical), CategoryLimit::new(60, 600));
        assert_eq!(settings.limit(RateCategory::LiveSubscription), CategoryLimit::new(100, 60));
        assert_eq!(settings.limit(RateCategory::IdenticalRequest), CategoryLimit::new(1, 15));
        assert_eq!(settings.lockout_scope, LockoutScope::Category);
    }

    #[test]
    fn test_poll_interval() {
        let long_poll = Duration::from_secs(10);
        assert_eq!(
            CategoryLimit::new(40, 1).poll_interval(long_poll),
            Duration::from_millis(25)
        );
        assert_eq!(
            CategoryLimit::new(1, 15).poll_interval(long_poll),
            Duration::from_secs(15)
        );
        assert_eq!(CategoryLimit::new(60, 600).poll_interval(long_poll), long_poll);
    }

    #[test]
    fn test_category_serde_names() {
        let json = serde_json::to_string(&RateCategory::LiveSubscription).unwrap();
        assert_eq!(json, "\"live_subscription\"");
        let scope: LockoutScope = serde_json::from_str("\"global\"").unwrap();
        assert_eq!(scope, LockoutScope::Global);
    }

    #[test]
    fn test_with_limit_override() {
        let settings = RateLimitSettings::default()
            .with_limit(RateCategory::General, CategoryLimit::new(2, 1))
            .without_jitter();
        assert_eq!(settings.general.max_requests, 2);
        assert_eq!(settings.jitter_ratio, 0.0);
    }

    #[test]
    fn test_error_classification() {
        let err = RateLimitError::DeadlineExceeded {
            category: RateCategory::Historical,
            waited: Duration::from_secs(5),
        };
        assert!(err.is_transient());
        assert_eq!(err.suggested_retry_delay(), None);
        let err = RateLimitError::Store(NetworkError::Connection("refused".into()));
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert_eq!(err.suggested_retry_delay(), Some(Duration::from_secs(1)));
    }
}
