// metrics.rs - Prometheus metrics for the acquisition engine

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Request Metrics
    // ============================================================================

    /// Upstream requests by rate category and outcome
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("farmer_requests_total", "Total upstream requests by category and outcome"),
        &["category", "outcome"]
    ).expect("Failed to create requests_total metric");

    /// Time from dispatch to completion or timeout
    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "farmer_request_duration_seconds",
            "Duration of upstream requests in seconds"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["category"]
    ).expect("Failed to create request_duration metric");

    /// Requests awaiting completion
    pub static ref PENDING_REQUESTS: IntGauge = IntGauge::new(
        "farmer_pending_requests",
        "Current number of in-flight upstream requests"
    ).expect("Failed to create pending_requests metric");

    // ============================================================================
    // Rate Limit Metrics
    // ============================================================================

    /// Time spent waiting for admission
    pub static ref ADMISSION_WAIT: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "farmer_admission_wait_seconds",
            "Time spent waiting for rate limit admission in seconds"
        )
        .buckets(vec![0.0, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 600.0]),
        &["category"]
    ).expect("Failed to create admission_wait metric");

    /// Rate violations reported by the upstream
    pub static ref RATE_VIOLATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("farmer_rate_violations_total", "Total rate violations reported by the upstream"),
        &["category"]
    ).expect("Failed to create rate_violations_total metric");

    // ============================================================================
    // Backfill Metrics
    // ============================================================================

    /// Bars written through idempotent upsert
    pub static ref BARS_STORED_TOTAL: IntCounter = IntCounter::new(
        "farmer_bars_stored_total",
        "Total number of daily bars upserted"
    ).expect("Failed to create bars_stored_total metric");

    /// Bars dropped by validation
    pub static ref BARS_REJECTED_TOTAL: IntCounter = IntCounter::new(
        "farmer_bars_rejected_total",
        "Total number of daily bars rejected by validation"
    ).expect("Failed to create bars_rejected_total metric");

    // ============================================================================
    // Session Metrics
    // ============================================================================

    /// Upstream error callbacks by classification
    pub static ref SESSION_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("farmer_session_errors_total", "Total upstream error callbacks by class"),
        &["class"]
    ).expect("Failed to create session_errors_total metric");
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; already-registered collectors are skipped.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(REQUESTS_TOTAL.clone()),
        Box::new(REQUEST_DURATION.clone()),
        Box::new(PENDING_REQUESTS.clone()),
        Box::new(ADMISSION_WAIT.clone()),
        Box::new(RATE_VIOLATIONS_TOTAL.clone()),
        Box::new(BARS_STORED_TOTAL.clone()),
        Box::new(BARS_REJECTED_TOTAL.clone()),
        Box::new(SESSION_ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Encode the registry in the Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        assert!(register_metrics().is_ok());
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_gather_includes_labelled_series() {
        register_metrics().unwrap();
        REQUESTS_TOTAL.with_label_values(&["historical", "success"]).inc();
        BARS_STORED_TOTAL.inc_by(3);

        let text = gather_metrics().unwrap();
        assert!(text.contains("farmer_requests_total"));
        assert!(text.contains("category=\"historical\""));
        assert!(text.contains("farmer_bars_stored_total"));
    }
}
