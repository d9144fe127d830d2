//! Session state, errors and the violation hook

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_common::error::{ErrorCategory, ErrorClassification};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::rate_limit::RateCategory;
use crate::upstream::UpstreamError;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Recoverable; the next ensure_connected() reconnects
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Disconnected => "DISCONNECTED",
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::Connected => "CONNECTED",
            SessionStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Snapshot of the session as seen by callers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_data_received_at: Option<DateTime<Utc>>,
    pub error_count: u64,
    pub last_error_code: Option<i32>,
    pub last_error_message: Option<String>,
    /// Connect attempts spent since the last successful connection
    pub retry_count: u32,
    pub connected_since: Option<DateTime<Utc>>,
    /// No market data within the staleness threshold; informational only
    pub data_stale: bool,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }
}

/// Receives upstream rate violations; implemented by the rate limiter
#[async_trait]
pub trait ViolationSink: Send + Sync {
    /// Apply a lockout to `category`, returning its length
    async fn record_violation(&self, category: RateCategory) -> Duration;
}

/// Session manager errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SessionError {
    /// The session task has exited
    #[error("Session actor stopped")]
    ActorStopped,

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl ErrorClassification for SessionError {
    fn category(&self) -> ErrorCategory {
        match self {
            SessionError::ActorStopped => ErrorCategory::Internal,
            SessionError::Upstream(e) => e.category(),
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
