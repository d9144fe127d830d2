//! Upstream error code classification
//!
//! A static table sorted by code, searched with a binary search. Codes not in
//! the table are informational in the 2100..=2199 farm-status band and fatal
//! otherwise.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Upstream pacing violation
    RateViolation,
    ConnectivityLost,
    /// Connection back, subscriptions must be re-established
    ConnectivityRestoredDataLost,
    /// Connection back, subscriptions intact
    ConnectivityRestoredDataKept,
    /// Missing or rejected market data permission
    SubscriptionIssue,
    /// Request rejected; fails only the request it belongs to
    Fatal,
    /// Status message, no action
    Info,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateViolation => "rate_violation",
            ErrorClass::ConnectivityLost => "connectivity_lost",
            ErrorClass::ConnectivityRestoredDataLost => "connectivity_restored_data_lost",
            ErrorClass::ConnectivityRestoredDataKept => "connectivity_restored_data_kept",
            ErrorClass::SubscriptionIssue => "subscription_issue",
            ErrorClass::Fatal => "fatal",
            ErrorClass::Info => "info",
        }
    }

    /// Whether an error of this class ends the request it is attached to
    pub fn fails_request(&self) -> bool {
        matches!(
            self,
            ErrorClass::RateViolation
                | ErrorClass::ConnectivityLost
                | ErrorClass::SubscriptionIssue
                | ErrorClass::Fatal
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static CLASSIFICATION: &[(i32, ErrorClass)] = &[
    (100, ErrorClass::RateViolation),
    (162, ErrorClass::Fatal),
    (200, ErrorClass::Fatal),
    (321, ErrorClass::Fatal),
    (354, ErrorClass::SubscriptionIssue),
    (420, ErrorClass::Fatal),
    (502, ErrorClass::ConnectivityLost),
    (503, ErrorClass::Fatal),
    (504, ErrorClass::ConnectivityLost),
    (1100, ErrorClass::ConnectivityLost),
    (1101, ErrorClass::ConnectivityRestoredDataLost),
    (1102, ErrorClass::ConnectivityRestoredDataKept),
    (1300, ErrorClass::ConnectivityLost),
    (2103, ErrorClass::Info),
    (2104, ErrorClass::Info),
    (2105, ErrorClass::Info),
    (2106, ErrorClass::Info),
    (2107, ErrorClass::Info),
    (2108, ErrorClass::Info),
    (2119, ErrorClass::Info),
    (2158, ErrorClass::Info),
    (10089, ErrorClass::SubscriptionIssue),
    (10090, ErrorClass::SubscriptionIssue),
    (10148, ErrorClass::Fatal),
    (10167, ErrorClass::SubscriptionIssue),
    (10168, ErrorClass::SubscriptionIssue),
];

/// Classify an upstream error code
pub fn classify(code: i32) -> ErrorClass {
    match CLASSIFICATION.binary_search_by_key(&code, |(c, _)| *c) {
        Ok(idx) => CLASSIFICATION[idx].1,
        Err(_) if (2100..=2199).contains(&code) => ErrorClass::Info,
        Err(_) => ErrorClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted_and_unique() {
        assert!(CLASSIFICATION.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_known_codes() {
        assert_eq!(classify(100), ErrorClass::RateViolation);
        assert_eq!(classify(1100), ErrorClass::ConnectivityLost);
        assert_eq!(classify(1101), ErrorClass::ConnectivityRestoredDataLost);
        assert_eq!(classify(1102), ErrorClass::ConnectivityRestoredDataKept);
        assert_eq!(classify(354), ErrorClass::SubscriptionIssue);
        assert_eq!(classify(10089), ErrorClass::SubscriptionIssue);
        assert_eq!(classify(162), ErrorClass::Fatal);
        assert_eq!(classify(2104), ErrorClass::Info);
    }

    #[test]
    fn test_unknown_codes() {
        assert_eq!(classify(2150), ErrorClass::Info);
        assert_eq!(classify(9999), ErrorClass::Fatal);
        assert_eq!(classify(-1), ErrorClass::Fatal);
    }

    #[test]
    fn test_request_failing_classes() {
        assert!(ErrorClass::Fatal.fails_request());
        assert!(ErrorClass::RateViolation.fails_request());
        assert!(!ErrorClass::Info.fails_request());
        assert!(!ErrorClass::ConnectivityRestoredDataKept.fails_request());
    }
}
