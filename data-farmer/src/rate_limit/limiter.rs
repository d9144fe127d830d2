//! Multi-category trailing-window rate limiter
//!
//! Every upstream request passes through [`RateLimiter::wait_admit`] for its
//! category. A request is admitted only if no violation lockout is active and
//! fewer than `max_requests` admissions fall inside the trailing window.
//! Admission and recording are a single atomic store operation.
//!
//! When the shared store fails the limiter switches to a process-local store
//! for that call and logs the degradation. It never admits without checking.

use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::memory::InMemoryWindowStore;
use super::redis_store::RedisWindowStore;
use super::store::{KeySpace, RateWindowStore};
use super::types::{RateCategory, RateLimitError, RateLimitResult, RateLimitSettings, UsageSnapshot};
use crate::metrics;
use crate::session::ViolationSink;

/// Lockout for the `consecutive`-th violation before jitter:
/// `min(base * 2^(consecutive - 1), max)`
pub fn backoff_duration(base: Duration, max: Duration, consecutive: u32) -> Duration {
    let exponent = consecutive.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map(|d| d.min(max))
        .unwrap_or(max)
}

/// Perturb `duration` by a uniform factor in `[1 - ratio, 1 + ratio]`
pub fn apply_jitter<R: Rng + ?Sized>(duration: Duration, ratio: f64, rng: &mut R) -> Duration {
    if ratio <= 0.0 {
        return duration;
    }
    let ratio = ratio.min(1.0);
    let factor = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
    duration.mul_f64(factor)
}

/// Epoch-seconds clock driven by tokio's monotonic time
#[derive(Debug, Clone, Copy)]
struct Clock {
    epoch_base: f64,
    started: Instant,
}

impl Clock {
    fn new() -> Self {
        let epoch_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            epoch_base,
            started: Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.epoch_base + self.started.elapsed().as_secs_f64()
    }
}

/// Result of one admission attempt
#[derive(Debug, Clone, Copy, PartialEq)]
enum Admission {
    Admitted,
    WindowFull,
    LockedOut { remaining: Duration },
}

/// Runs a store operation on the primary store, falling back to the local
/// store if the primary errors.
macro_rules! with_fallback {
    ($self:ident, $op:literal, |$store:ident| $call:expr) => {{
        let primary = {
            let $store: &dyn RateWindowStore = $self.primary.as_ref();
            $call.await
        };
        match primary {
            Ok(value) => {
                $self.mark_healthy();
                Ok(value)
            }
            Err(e) => {
                $self.mark_degraded($op, &e);
                let $store: &dyn RateWindowStore = $self.fallback.as_ref();
                $call.await
            }
        }
    }};
}

pub struct RateLimiter {
    settings: RateLimitSettings,
    keys: KeySpace,
    primary: Arc<dyn RateWindowStore>,
    fallback: Arc<InMemoryWindowStore>,
    degraded: AtomicBool,
    clock: Clock,
}

impl RateLimiter {
    /// Process-local limiter
    pub fn new(settings: RateLimitSettings, client_id: i32) -> Self {
        Self::with_store(settings, client_id, Arc::new(InMemoryWindowStore::new()))
    }

    /// Limiter over an explicit primary store
    pub fn with_store(settings: RateLimitSettings, client_id: i32, primary: Arc<dyn RateWindowStore>) -> Self {
        let keys = KeySpace::new(settings.key_prefix.clone(), client_id);
        Self {
            settings,
            keys,
            primary,
            fallback: Arc::new(InMemoryWindowStore::new()),
            degraded: AtomicBool::new(false),
            clock: Clock::new(),
        }
    }

    /// Build from settings, using the shared store when `redis_url` is set and
    /// reachable, otherwise the process-local one.
    pub async fn connect(settings: RateLimitSettings, client_id: i32) -> Self {
        let Some(url) = settings.redis_url.clone() else {
            info!("No shared rate window store configured, limiting is process-local");
            return Self::new(settings, client_id);
        };

        match RedisWindowStore::connect(&url).await {
            Ok(store) => {
                info!(store = "redis", "Rate limiter using shared window store");
                Self::with_store(settings, client_id, Arc::new(store))
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Shared rate window store unreachable, falling back to process-local limiting (best effort across processes)"
                );
                Self::new(settings, client_id)
            }
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Whether the last store operation had to use the local fallback
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn store_name(&self) -> &'static str {
        self.primary.name()
    }

    fn mark_degraded(&self, op: &str, error: &RateLimitError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                store = self.primary.name(),
                operation = op,
                error = %error,
                "Rate window store failed, degrading to process-local limiter"
            );
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(store = self.primary.name(), "Rate window store recovered");
        }
    }

    async fn lockout_remaining(&self, category: RateCategory, now: f64) -> Option<Duration> {
        let key = self.keys.lockout(self.settings.lockout_scope, category);
        let until = with_fallback!(self, "lockout_until", |store| store.lockout_until(&key, now));
        until
            .ok()
            .flatten()
            .map(|until| Duration::from_secs_f64((until - now).max(0.0)))
    }

    async fn attempt(&self, category: RateCategory, fingerprint: Option<&str>) -> Admission {
        let now = self.clock.now();
        if let Some(remaining) = self.lockout_remaining(category, now).await {
            return Admission::LockedOut { remaining };
        }

        let limit = self.settings.limit(category);
        let key = self.keys.window(category, fingerprint);
        let member = format!("{:.6}:{}", now, Uuid::new_v4());
        let window = limit.window_secs as f64;

        let admitted = with_fallback!(self, "try_admit", |store| store
            .try_admit(&key, limit.max_requests, window, now, &member));

        match admitted {
            Ok(true) => Admission::Admitted,
            // The local store is infallible; a refusal is the safe answer regardless
            Ok(false) | Err(_) => Admission::WindowFull,
        }
    }

    /// Try once. On `true` the admission has been recorded.
    pub async fn check_admit(&self, category: RateCategory, fingerprint: Option<&str>) -> bool {
        self.attempt(category, fingerprint).await == Admission::Admitted
    }

    fn next_sleep(&self, category: RateCategory, admission: Admission) -> Duration {
        match admission {
            Admission::LockedOut { remaining } => {
                remaining.min(Duration::from_secs(self.settings.lockout_poll_cap_secs.max(1)))
            }
            _ => self
                .settings
                .limit(category)
                .poll_interval(Duration::from_secs(self.settings.long_window_poll_secs)),
        }
    }

    /// Wait until admitted; returns the time spent waiting
    pub async fn wait_admit(&self, category: RateCategory, fingerprint: Option<&str>) -> Duration {
        let started = Instant::now();
        loop {
            let admission = self.attempt(category, fingerprint).await;
            if admission == Admission::Admitted {
                let waited = started.elapsed();
                metrics::ADMISSION_WAIT
                    .with_label_values(&[category.as_str()])
                    .observe(waited.as_secs_f64());
                return waited;
            }

            let sleep = self.next_sleep(category, admission);
            debug!(%category, ?admission, ?sleep, "Waiting for rate limit admission");
            tokio::time::sleep(sleep).await;
        }
    }

    /// Like [`wait_admit`](Self::wait_admit) but gives up at `deadline`
    pub async fn wait_admit_until(
        &self,
        category: RateCategory,
        fingerprint: Option<&str>,
        deadline: Instant,
    ) -> RateLimitResult<Duration> {
        let started = Instant::now();
        loop {
            let admission = self.attempt(category, fingerprint).await;
            if admission == Admission::Admitted {
                let waited = started.elapsed();
                metrics::ADMISSION_WAIT
                    .with_label_values(&[category.as_str()])
                    .observe(waited.as_secs_f64());
                return Ok(waited);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RateLimitError::DeadlineExceeded {
                    category,
                    waited: started.elapsed(),
                });
            }
            let sleep = self.next_sleep(category, admission).min(deadline - now);
            tokio::time::sleep(sleep).await;
        }
    }

    /// Apply a lockout after the upstream reported a pacing violation.
    ///
    /// Returns the lockout applied.
    pub async fn record_violation(&self, category: RateCategory) -> Duration {
        let now = self.clock.now();
        let scope = self.settings.lockout_scope;
        let counter_key = self.keys.violations(scope, category);
        let reset_secs = self.settings.violation_reset_secs;

        let consecutive = with_fallback!(self, "increment_violations", |store| store
            .increment_violations(&counter_key, reset_secs, now))
        .unwrap_or(1);

        let base = backoff_duration(
            Duration::from_secs(self.settings.base_penalty_secs),
            Duration::from_secs(self.settings.max_penalty_secs),
            consecutive,
        );
        let lockout = apply_jitter(base, self.settings.jitter_ratio, &mut rand::thread_rng());

        let lockout_key = self.keys.lockout(scope, category);
        let until = now + lockout.as_secs_f64();
        if let Err(e) = with_fallback!(self, "set_lockout", |store| store.set_lockout(&lockout_key, until, now)) {
            warn!(%category, error = %e, "Failed to persist violation lockout");
        }

        metrics::RATE_VIOLATIONS_TOTAL
            .with_label_values(&[category.as_str()])
            .inc();
        warn!(
            %category,
            consecutive,
            lockout_secs = lockout.as_secs_f64(),
            ?scope,
            "Upstream rate violation, locking out category"
        );
        lockout
    }

    /// Read-only snapshot of one category
    pub async fn get_usage(&self, category: RateCategory) -> UsageSnapshot {
        let now = self.clock.now();
        let limit = self.settings.limit(category);
        let key = self.keys.window(category, None);
        let window = limit.window_secs as f64;

        let current = with_fallback!(self, "count", |store| store.count(&key, window, now)).unwrap_or(0);
        let lockout = self.lockout_remaining(category, now).await;
        let counter_key = self.keys.violations(self.settings.lockout_scope, category);
        let consecutive_violations =
            with_fallback!(self, "violations", |store| store.violations(&counter_key, now)).unwrap_or(0);

        UsageSnapshot {
            category,
            current,
            max: limit.max_requests,
            window_secs: limit.window_secs,
            percent_used: if limit.max_requests == 0 {
                100.0
            } else {
                current as f64 / limit.max_requests as f64 * 100.0
            },
            in_lockout: lockout.is_some(),
            lockout_remaining_secs: lockout.map(|d| d.as_secs_f64()),
            consecutive_violations,
        }
    }

    /// Snapshots for every category
    pub async fn usage_all(&self) -> Vec<UsageSnapshot> {
        join_all(RateCategory::ALL.map(|category| self.get_usage(category))).await
    }
}

#[async_trait]
impl ViolationSink for RateLimiter {
    async fn record_violation(&self, category: RateCategory) -> Duration {
        RateLimiter::record_violation(self, category).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::types::{CategoryLimit, LockoutScope};
    use market_common::error::NetworkError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::AtomicU32;

    fn limiter(limit: CategoryLimit) -> RateLimiter {
        let settings = RateLimitSettings::default()
            .with_limit(RateCategory::General, limit)
            .without_jitter();
        RateLimiter::new(settings, 1)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        let secs: Vec<u64> = (1..=6).map(|n| backoff_duration(base, max, n).as_secs()).collect();
        assert_eq!(secs, vec![60, 120, 240, 480, 600, 600]);
        assert_eq!(backoff_duration(base, max, 0), base);
        assert_eq!(backoff_duration(base, max, 200), max);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_secs(60);
        for _ in 0..1000 {
            let d = apply_jitter(base, 0.25, &mut rng);
            assert!(d >= Duration::from_secs(45) && d <= Duration::from_secs(75));
        }
        assert_eq!(apply_jitter(base, 0.0, &mut rng), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_in_window() {
        let limiter = limiter(CategoryLimit::new(2, 1));
        assert!(limiter.check_admit(RateCategory::General, None).await);
        assert!(limiter.check_admit(RateCategory::General, None).await);
        assert!(!limiter.check_admit(RateCategory::General, None).await);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.check_admit(RateCategory::General, None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_admit_spaces_requests() {
        let limiter = limiter(CategoryLimit::new(2, 1));
        let start = Instant::now();
        let mut admitted_at = Vec::new();
        for _ in 0..6 {
            limiter.wait_admit(RateCategory::General, None).await;
            admitted_at.push(start.elapsed());
        }

        // Any trailing 1s interval holds at most 2 admissions
        for (i, t) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[..=i]
                .iter()
                .filter(|earlier| *t - **earlier < Duration::from_secs(1))
                .count();
            assert!(in_window <= 2, "window at {:?} holds {}", t, in_window);
        }
        assert!(admitted_at[5] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_requests_keyed_by_fingerprint() {
        let limiter = RateLimiter::new(RateLimitSettings::default(), 1);
        assert!(limiter.check_admit(RateCategory::IdenticalRequest, Some("BHP|a")).await);
        assert!(!limiter.check_admit(RateCategory::IdenticalRequest, Some("BHP|a")).await);
        assert!(limiter.check_admit(RateCategory::IdenticalRequest, Some("BHP|b")).await);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(limiter.check_admit(RateCategory::IdenticalRequest, Some("BHP|a")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_violation_lockout_blocks_category_only() {
        let limiter = RateLimiter::new(RateLimitSettings::default().without_jitter(), 1);
        let lockout = limiter.record_violation(RateCategory::Historical).await;
        assert_eq!(lockout, Duration::from_secs(60));

        assert!(!limiter.check_admit(RateCategory::Historical, None).await);
        assert!(limiter.check_admit(RateCategory::General, None).await);

        let usage = limiter.get_usage(RateCategory::Historical).await;
        assert!(usage.in_lockout);
        assert_eq!(usage.consecutive_violations, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check_admit(RateCategory::Historical, None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_violations_back_off() {
        let limiter = RateLimiter::new(RateLimitSettings::default().without_jitter(), 1);
        let mut lockouts = Vec::new();
        for _ in 0..3 {
            lockouts.push(limiter.record_violation(RateCategory::Historical).await.as_secs());
        }
        assert_eq!(lockouts, vec![60, 120, 240]);

        // Quiet period resets the counter
        tokio::time::advance(Duration::from_secs(3601)).await;
        let lockout = limiter.record_violation(RateCategory::Historical).await;
        assert_eq!(lockout.as_secs(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_lockout_blocks_every_category() {
        let mut settings = RateLimitSettings::default().without_jitter();
        settings.lockout_scope = LockoutScope::Global;
        let limiter = RateLimiter::new(settings, 1);

        limiter.record_violation(RateCategory::Historical).await;
        assert!(!limiter.check_admit(RateCategory::General, None).await);
        assert!(!limiter.check_admit(RateCategory::LiveSubscription, None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_admit_outlasts_lockout() {
        let limiter = RateLimiter::new(RateLimitSettings::default().without_jitter(), 1);
        limiter.record_violation(RateCategory::General).await;

        let waited = limiter.wait_admit(RateCategory::General, None).await;
        assert!(waited >= Duration::from_secs(60));
        assert!(waited < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_admit_until_deadline() {
        let limiter = RateLimiter::new(RateLimitSettings::default().without_jitter(), 1);
        limiter.record_violation(RateCategory::General).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        let result = limiter.wait_admit_until(RateCategory::General, None, deadline).await;
        assert!(matches!(result, Err(RateLimitError::DeadlineExceeded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_snapshot() {
        let limiter = limiter(CategoryLimit::new(4, 10));
        limiter.check_admit(RateCategory::General, None).await;
        limiter.check_admit(RateCategory::General, None).await;

        let usage = limiter.get_usage(RateCategory::General).await;
        assert_eq!(usage.current, 2);
        assert_eq!(usage.max, 4);
        assert_eq!(usage.percent_used, 50.0);
        assert!(!usage.in_lockout);
        assert_eq!(limiter.usage_all().await.len(), 4);
    }

    /// Store that always fails, counting calls
    #[derive(Default)]
    struct BrokenStore {
        calls: AtomicU32,
    }

    impl BrokenStore {
        fn fail<T>(&self) -> RateLimitResult<T> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(RateLimitError::Store(NetworkError::Closed("gone".into())))
        }
    }

    #[async_trait]
    impl RateWindowStore for BrokenStore {
        async fn try_admit(&self, _: &str, _: u32, _: f64, _: f64, _: &str) -> RateLimitResult<bool> {
            self.fail()
        }
        async fn count(&self, _: &str, _: f64, _: f64) -> RateLimitResult<u32> {
            self.fail()
        }
        async fn lockout_until(&self, _: &str, _: f64) -> RateLimitResult<Option<f64>> {
            self.fail()
        }
        async fn set_lockout(&self, _: &str, _: f64, _: f64) -> RateLimitResult<()> {
            self.fail()
        }
        async fn increment_violations(&self, _: &str, _: u64, _: f64) -> RateLimitResult<u32> {
            self.fail()
        }
        async fn violations(&self, _: &str, _: f64) -> RateLimitResult<u32> {
            self.fail()
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_never_fails_open() {
        let store = Arc::new(BrokenStore::default());
        let settings = RateLimitSettings::default()
            .with_limit(RateCategory::General, CategoryLimit::new(1, 10))
            .without_jitter();
        let limiter = RateLimiter::with_store(settings, 1, store.clone());

        assert!(limiter.check_admit(RateCategory::General, None).await);
        assert!(limiter.is_degraded());
        // Fallback still enforces the window
        assert!(!limiter.check_admit(RateCategory::General, None).await);
        assert!(store.calls.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_connect_without_redis_is_local() {
        let limiter = RateLimiter::connect(RateLimitSettings::default(), 1).await;
        assert_eq!(limiter.store_name(), "memory");
        assert!(!limiter.is_degraded());
    }
}
