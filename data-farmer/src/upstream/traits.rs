//! Upstream client contract
//!
//! The wire protocol belongs to the client implementation. The engine only
//! needs to open and close a session, submit historical requests under ids it
//! allocates, and receive [`UpstreamEvent`]s on the channel it hands over at
//! connect time.

use async_trait::async_trait;
use market_common::error::{ErrorCategory, ErrorClassification};
use thiserror::Error;
use tokio::sync::mpsc;

use super::types::{ConnectParams, HistoricalRequest, UpstreamEvent};

/// Upstream client errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Upstream not connected")]
    NotConnected,
}

impl ErrorClassification for UpstreamError {
    fn category(&self) -> ErrorCategory {
        match self {
            UpstreamError::Connection(_) => ErrorCategory::Transient,
            UpstreamError::Request(_) => ErrorCategory::Transient,
            UpstreamError::NotConnected => ErrorCategory::Transient,
        }
    }

    fn suggested_retry_delay(&self) -> Option<std::time::Duration> {
        match self {
            UpstreamError::Connection(_) => Some(std::time::Duration::from_secs(2)),
            UpstreamError::Request(_) => Some(std::time::Duration::from_millis(500)),
            UpstreamError::NotConnected => Some(std::time::Duration::from_secs(1)),
        }
    }
}

/// Result type for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Open the transport. Returns once the socket is up; readiness arrives
    /// later as [`UpstreamEvent::SessionReady`] on `events`.
    async fn connect(
        &self,
        params: &ConnectParams,
        events: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> UpstreamResult<()>;

    /// Close the transport
    async fn disconnect(&self) -> UpstreamResult<()>;

    /// Submit a historical request. Bars and the end marker arrive as events
    /// tagged with `request_id`.
    async fn request_historical(&self, request_id: i64, request: &HistoricalRequest) -> UpstreamResult<()>;

    /// Tell the upstream to stop working on a request the caller gave up on
    async fn cancel_historical(&self, request_id: i64) -> UpstreamResult<()>;

    /// Client name for logs
    fn name(&self) -> &str;
}
