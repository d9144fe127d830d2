//! Request coordination
//!
//! Every upstream request runs the same sequence: make sure the session is
//! up, wait for rate-limit admission, register as pending, submit, then wait
//! for the terminal event under a coordinator-enforced timeout. The upstream
//! may never answer, so the timeout is never delegated to it.

use chrono::Utc;
use market_common::error::{ErrorCategory, ErrorClassification};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::pending::{PendingRequest, PendingRequests, RequestEvent};
use crate::metrics;
use crate::rate_limit::{RateCategory, RateLimitError, RateLimiter};
use crate::session::{classify, ErrorClass, SessionManager};
use crate::upstream::{HistoricalRequest, RawBar, UpstreamClient, UpstreamError, UpstreamResult};

/// Request coordination errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// No session could be established within the retry budget
    #[error("Upstream session unavailable")]
    NotConnected,

    #[error("Connectivity lost during request {request_id} ({code}): {message}")]
    ConnectivityLost {
        request_id: i64,
        code: i32,
        message: String,
    },

    #[error("Upstream pacing violation on request {request_id} ({code}): {message}")]
    RateViolation {
        request_id: i64,
        code: i32,
        message: String,
    },

    #[error("Subscription issue on request {request_id} ({code}): {message}")]
    Subscription {
        request_id: i64,
        code: i32,
        message: String,
    },

    #[error("Request {request_id} rejected ({code}): {message}")]
    Fatal {
        request_id: i64,
        code: i32,
        message: String,
    },

    #[error("Request {request_id} timed out after {after:?}")]
    Timeout { request_id: i64, after: Duration },

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl CoordinatorError {
    fn from_event(request_id: i64, code: i32, message: String) -> Self {
        match classify(code) {
            ErrorClass::RateViolation => CoordinatorError::RateViolation {
                request_id,
                code,
                message,
            },
            ErrorClass::ConnectivityLost => CoordinatorError::ConnectivityLost {
                request_id,
                code,
                message,
            },
            ErrorClass::SubscriptionIssue => CoordinatorError::Subscription {
                request_id,
                code,
                message,
            },
            _ => CoordinatorError::Fatal {
                request_id,
                code,
                message,
            },
        }
    }

    /// Metrics label
    fn outcome(&self) -> &'static str {
        match self {
            CoordinatorError::NotConnected => "not_connected",
            CoordinatorError::ConnectivityLost { .. } => "connectivity_lost",
            CoordinatorError::RateViolation { .. } => "rate_violation",
            CoordinatorError::Subscription { .. } => "subscription",
            CoordinatorError::Fatal { .. } => "rejected",
            CoordinatorError::Timeout { .. } => "timeout",
            CoordinatorError::RateLimit(_) => "rate_limited",
            CoordinatorError::Upstream(_) => "error",
        }
    }
}

impl ErrorClassification for CoordinatorError {
    fn category(&self) -> ErrorCategory {
        match self {
            CoordinatorError::NotConnected => ErrorCategory::Transient,
            CoordinatorError::ConnectivityLost { .. } => ErrorCategory::Transient,
            CoordinatorError::RateViolation { .. } => ErrorCategory::ResourceExhausted,
            CoordinatorError::Subscription { .. } => ErrorCategory::Permanent,
            CoordinatorError::Fatal { .. } => ErrorCategory::Permanent,
            CoordinatorError::Timeout { .. } => ErrorCategory::Transient,
            CoordinatorError::RateLimit(e) => e.category(),
            CoordinatorError::Upstream(e) => e.category(),
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            CoordinatorError::NotConnected => Some(Duration::from_secs(1)),
            CoordinatorError::ConnectivityLost { .. } => Some(Duration::from_secs(1)),
            // Admission already waits out the lockout
            CoordinatorError::RateViolation { .. } => Some(Duration::ZERO),
            CoordinatorError::Timeout { .. } => Some(Duration::from_millis(500)),
            CoordinatorError::Subscription { .. } | CoordinatorError::Fatal { .. } => None,
            CoordinatorError::RateLimit(e) => e.suggested_retry_delay(),
            CoordinatorError::Upstream(e) => e.suggested_retry_delay(),
        }
    }
}

/// Result type for coordinated requests
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// What a request is and how long it may take
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub category: RateCategory,
    /// Identical-request guard key, if the request has one
    pub fingerprint: Option<String>,
    pub symbol: String,
    /// Wait for the terminal event, from submission
    pub timeout: Duration,
    /// Give up on admission at this instant instead of waiting indefinitely
    pub admission_deadline: Option<Instant>,
}

impl RequestSpec {
    pub fn new(category: RateCategory, symbol: impl Into<String>, timeout: Duration) -> Self {
        Self {
            category,
            fingerprint: None,
            symbol: symbol.into(),
            timeout,
            admission_deadline: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_admission_deadline(mut self, deadline: Instant) -> Self {
        self.admission_deadline = Some(deadline);
        self
    }
}

/// Completed request
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_id: i64,
    pub bars: Vec<RawBar>,
    /// Time spent waiting for rate-limit admission
    pub admission_wait: Duration,
    /// Submission to completion
    pub elapsed: Duration,
}

pub struct RequestCoordinator {
    session: SessionManager,
    limiter: Arc<RateLimiter>,
    pending: PendingRequests,
    client: Arc<dyn UpstreamClient>,
}

impl RequestCoordinator {
    pub fn new(
        session: SessionManager,
        limiter: Arc<RateLimiter>,
        pending: PendingRequests,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            session,
            limiter,
            pending,
            client,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Run `submit` under the full coordination sequence.
    ///
    /// `submit` receives the allocated request id and must only hand the
    /// request to the upstream; results are collected from the event stream.
    pub async fn execute<F, Fut>(&self, spec: RequestSpec, submit: F) -> CoordinatorResult<RequestOutcome>
    where
        F: FnOnce(i64) -> Fut,
        Fut: Future<Output = UpstreamResult<()>>,
    {
        let category = spec.category;
        let result = self.run(spec, submit).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.outcome(),
        };
        metrics::REQUESTS_TOTAL
            .with_label_values(&[category.as_str(), outcome])
            .inc();
        result
    }

    async fn run<F, Fut>(&self, spec: RequestSpec, submit: F) -> CoordinatorResult<RequestOutcome>
    where
        F: FnOnce(i64) -> Fut,
        Fut: Future<Output = UpstreamResult<()>>,
    {
        if !self.session.ensure_connected().await {
            return Err(CoordinatorError::NotConnected);
        }

        let admission_wait = self.admit(&spec).await?;

        let request_id = self.session.next_request_id();
        let events = self.pending.register(PendingRequest {
            request_id,
            category: spec.category,
            symbol: spec.symbol.clone(),
            submitted_at: Utc::now(),
        });

        let started = Instant::now();
        if let Err(e) = submit(request_id).await {
            self.pending.remove(request_id);
            warn!(request_id, symbol = %spec.symbol, error = %e, "Failed to submit request");
            return Err(e.into());
        }
        debug!(request_id, symbol = %spec.symbol, category = %spec.category, "Request submitted");

        let collected = tokio::time::timeout(spec.timeout, collect(request_id, events)).await;
        self.pending.remove(request_id);
        let elapsed = started.elapsed();
        metrics::REQUEST_DURATION
            .with_label_values(&[spec.category.as_str()])
            .observe(elapsed.as_secs_f64());

        match collected {
            Ok(Ok(bars)) => Ok(RequestOutcome {
                request_id,
                bars,
                admission_wait,
                elapsed,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    request_id,
                    symbol = %spec.symbol,
                    timeout_secs = spec.timeout.as_secs_f64(),
                    "Request timed out"
                );
                self.cancel_abandoned(request_id, spec.category).await;
                Err(CoordinatorError::Timeout {
                    request_id,
                    after: spec.timeout,
                })
            }
        }
    }

    /// Tell the upstream to drop a request nobody waits for any more
    async fn cancel_abandoned(&self, request_id: i64, category: RateCategory) {
        match category {
            RateCategory::Historical => {
                if let Err(e) = self.client.cancel_historical(request_id).await {
                    debug!(request_id, error = %e, "Cancel after timeout failed");
                }
            }
            other => debug!(request_id, category = %other, "No upstream cancel for category"),
        }
    }

    /// Identical-request guard first, then the request's own category
    async fn admit(&self, spec: &RequestSpec) -> CoordinatorResult<Duration> {
        let mut waited = Duration::ZERO;
        if let Some(fingerprint) = spec.fingerprint.as_deref() {
            waited += self
                .wait(RateCategory::IdenticalRequest, Some(fingerprint), spec.admission_deadline)
                .await?;
        }
        waited += self.wait(spec.category, None, spec.admission_deadline).await?;
        Ok(waited)
    }

    async fn wait(
        &self,
        category: RateCategory,
        fingerprint: Option<&str>,
        deadline: Option<Instant>,
    ) -> CoordinatorResult<Duration> {
        match deadline {
            Some(deadline) => Ok(self
                .limiter
                .wait_admit_until(category, fingerprint, deadline)
                .await?),
            None => Ok(self.limiter.wait_admit(category, fingerprint).await),
        }
    }

    /// Historical bars for one request
    pub async fn request_historical(
        &self,
        request: &HistoricalRequest,
        timeout: Duration,
    ) -> CoordinatorResult<RequestOutcome> {
        let spec = RequestSpec::new(RateCategory::Historical, request.contract.symbol.clone(), timeout)
            .with_fingerprint(request.fingerprint());
        let client = self.client.clone();
        self.execute(spec, |request_id| async move {
            client.request_historical(request_id, request).await
        })
        .await
    }
}

/// Buffer bars until the end marker or an error
async fn collect(
    request_id: i64,
    mut events: mpsc::UnboundedReceiver<RequestEvent>,
) -> CoordinatorResult<Vec<RawBar>> {
    let mut bars = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            RequestEvent::Bar(bar) => bars.push(bar),
            RequestEvent::End => return Ok(bars),
            RequestEvent::Error { code, message } => {
                return Err(CoordinatorError::from_event(request_id, code, message))
            }
        }
    }
    Err(CoordinatorError::Upstream(UpstreamError::NotConnected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionSettings, UpstreamSettings};
    use crate::rate_limit::{CategoryLimit, RateLimitSettings};
    use crate::upstream::{
        ConnectBehavior, Contract, ContractDefaults, DurationDescriptor, MockResponse, MockUpstream,
    };
    use chrono::NaiveDate;

    struct Harness {
        mock: Arc<MockUpstream>,
        coordinator: RequestCoordinator,
    }

    fn harness(mock: MockUpstream, rate: RateLimitSettings) -> Harness {
        let mock = Arc::new(mock);
        let limiter = Arc::new(RateLimiter::new(rate, 1));
        let pending = PendingRequests::new();
        let session = SessionManager::spawn(
            UpstreamSettings::default(),
            SessionSettings::default(),
            mock.clone(),
            limiter.clone(),
            pending.clone(),
        );
        let coordinator = RequestCoordinator::new(session, limiter, pending, mock.clone());
        Harness { mock, coordinator }
    }

    fn request(symbol: &str) -> HistoricalRequest {
        HistoricalRequest {
            contract: Contract::stock(symbol, &ContractDefaults::default()),
            end_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            duration: DurationDescriptor::Days(5),
            bar_size: "1 day".into(),
            what_to_show: "TRADES".into(),
            use_rth: true,
        }
    }

    #[test]
    fn test_retry_hints() {
        let timeout = CoordinatorError::Timeout {
            request_id: 1,
            after: Duration::from_secs(30),
        };
        assert!(timeout.is_transient());
        assert_eq!(timeout.suggested_retry_delay(), Some(Duration::from_millis(500)));

        let fatal = CoordinatorError::from_event(1, 162, "no data".into());
        assert!(fatal.is_permanent());
        assert_eq!(fatal.max_retries(), 0);

        let upstream = CoordinatorError::from(UpstreamError::Connection("reset".into()));
        assert_eq!(upstream.suggested_retry_delay(), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_request_collects_bars() {
        let h = harness(MockUpstream::new(), RateLimitSettings::default());
        let outcome = h
            .coordinator
            .request_historical(&request("BHP"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(outcome.bars.len(), 5);
        assert!(outcome.request_id >= 1000);
        assert!(h.coordinator.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_upstream_times_out() {
        let h = harness(
            MockUpstream::new().with_response("CBA", MockResponse::Silent),
            RateLimitSettings::default(),
        );
        let err = h
            .coordinator
            .request_historical(&request("CBA"), Duration::from_secs(30))
            .await
            .unwrap_err();
        match err {
            CoordinatorError::Timeout { request_id, after } => {
                assert_eq!(after, Duration::from_secs(30));
                assert_eq!(h.mock.cancelled(), vec![request_id]);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(h.coordinator.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_outside_historical_sends_no_cancel() {
        let h = harness(
            MockUpstream::new().with_response("CBA", MockResponse::Silent),
            RateLimitSettings::default(),
        );
        let mock = h.mock.clone();
        let result = h
            .coordinator
            .execute(
                RequestSpec::new(RateCategory::General, "CBA", Duration::from_secs(10)),
                |request_id| async move { mock.request_historical(request_id, &request("CBA")).await },
            )
            .await;
        assert!(matches!(result, Err(CoordinatorError::Timeout { .. })));
        assert!(h.mock.cancelled().is_empty());
        assert!(h.coordinator.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_codes_map_to_errors() {
        let h = harness(
            MockUpstream::new()
                .with_response("NAB", MockResponse::Error { code: 162, message: "no data".into() })
                .with_response("WBC", MockResponse::Error { code: 354, message: "not subscribed".into() }),
            RateLimitSettings::default(),
        );
        let timeout = Duration::from_secs(30);
        assert!(matches!(
            h.coordinator.request_historical(&request("NAB"), timeout).await,
            Err(CoordinatorError::Fatal { code: 162, .. })
        ));
        assert!(matches!(
            h.coordinator.request_historical(&request("WBC"), timeout).await,
            Err(CoordinatorError::Subscription { code: 354, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_violation_locks_out_historical() {
        let h = harness(
            MockUpstream::new().with_response("ANZ", MockResponse::Error { code: 100, message: "pacing".into() }),
            RateLimitSettings::default().without_jitter(),
        );
        let result = h
            .coordinator
            .request_historical(&request("ANZ"), Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(CoordinatorError::RateViolation { code: 100, .. })));

        let usage = h.coordinator.limiter().get_usage(RateCategory::Historical).await;
        assert!(usage.in_lockout);
        assert_eq!(usage.consecutive_violations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_when_session_unavailable() {
        let h = harness(
            MockUpstream::new().with_connect_behavior(ConnectBehavior::Refuse),
            RateLimitSettings::default(),
        );
        let result = h
            .coordinator
            .request_historical(&request("BHP"), Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(CoordinatorError::NotConnected)));
        assert_eq!(h.mock.request_count(), 0);
        assert_eq!(h.mock.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_request_guard_spaces_repeats() {
        let h = harness(MockUpstream::new(), RateLimitSettings::default());
        let timeout = Duration::from_secs(30);
        let started = Instant::now();
        h.coordinator.request_historical(&request("BHP"), timeout).await.unwrap();
        h.coordinator.request_historical(&request("BHP"), timeout).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_deadline() {
        let rate = RateLimitSettings::default()
            .with_limit(RateCategory::General, CategoryLimit::new(1, 60));
        let h = harness(MockUpstream::new(), rate);

        let spec = || {
            RequestSpec::new(RateCategory::General, "BHP", Duration::from_secs(5))
                .with_admission_deadline(Instant::now() + Duration::from_secs(1))
        };
        let mock = h.mock.clone();
        let submit = |request_id: i64| {
            let mock = mock.clone();
            async move { mock.request_historical(request_id, &request("BHP")).await }
        };

        assert!(h.coordinator.execute(spec(), submit).await.is_ok());
        let result = h.coordinator.execute(spec(), submit).await;
        assert!(matches!(
            result,
            Err(CoordinatorError::RateLimit(RateLimitError::DeadlineExceeded { .. }))
        ));
    }
}
