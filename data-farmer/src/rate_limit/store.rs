//! Storage contract for rate windows and violation state
//!
//! All timestamps are epoch seconds supplied by the caller, so stores never
//! read a clock themselves.

use async_trait::async_trait;

use super::types::{LockoutScope, RateCategory, RateLimitResult};

/// Backing store for trailing windows, lockouts and violation counters.
///
/// `try_admit` must be atomic: pruning, counting and recording happen as one
/// step with respect to every other caller sharing the store.
#[async_trait]
pub trait RateWindowStore: Send + Sync {
    /// Drop entries older than `now - window_secs`; if fewer than `max` remain,
    /// record `member` at `now` and return true.
    async fn try_admit(
        &self,
        key: &str,
        max: u32,
        window_secs: f64,
        now: f64,
        member: &str,
    ) -> RateLimitResult<bool>;

    /// Entries inside `(now - window_secs, now]`
    async fn count(&self, key: &str, window_secs: f64, now: f64) -> RateLimitResult<u32>;

    /// Lockout deadline if one is still active at `now`
    async fn lockout_until(&self, key: &str, now: f64) -> RateLimitResult<Option<f64>>;

    /// Set a lockout that clears at `until`
    async fn set_lockout(&self, key: &str, until: f64, now: f64) -> RateLimitResult<()>;

    /// Increment the violation counter, (re)arming its `reset_secs` expiry
    async fn increment_violations(&self, key: &str, reset_secs: u64, now: f64) -> RateLimitResult<u32>;

    /// Current violation count, zero once expired
    async fn violations(&self, key: &str, now: f64) -> RateLimitResult<u32>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Key layout shared by every store: `{prefix}:{client_id}:{category}[:{fingerprint}]`
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    client_id: i32,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>, client_id: i32) -> Self {
        Self {
            prefix: prefix.into(),
            client_id,
        }
    }

    /// Window key; only fingerprinted categories use the fingerprint
    pub fn window(&self, category: RateCategory, fingerprint: Option<&str>) -> String {
        match fingerprint {
            Some(fp) if category.is_fingerprinted() => {
                format!("{}:{}:{}:{}", self.prefix, self.client_id, category, fp)
            }
            _ => format!("{}:{}:{}", self.prefix, self.client_id, category),
        }
    }

    pub fn lockout(&self, scope: LockoutScope, category: RateCategory) -> String {
        format!("{}:lockout", self.violation_base(scope, category))
    }

    pub fn violations(&self, scope: LockoutScope, category: RateCategory) -> String {
        format!("{}:violations", self.violation_base(scope, category))
    }

    fn violation_base(&self, scope: LockoutScope, category: RateCategory) -> String {
        match scope {
            LockoutScope::Category => format!("{}:{}:{}", self.prefix, self.client_id, category),
            LockoutScope::Global => format!("{}:{}:global", self.prefix, self.client_id),
        }
    }
}
