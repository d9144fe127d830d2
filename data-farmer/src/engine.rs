//! Acquisition engine
//!
//! Wires the rate limiter, session, coordinator and orchestrator together
//! and exposes the operations external callers (CLI, API, scheduler) use.

use chrono::NaiveDate;
use market_common::data::{BackfillProgress, BackfillStats, BulkBackfillReport};
use market_common::error::{ConfigurationError, ErrorCategory, ErrorClassification};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::backfill::{BackfillOrchestrator, BackfillResult};
use crate::config::Settings;
use crate::coordinator::{PendingRequests, RequestCoordinator};
use crate::metrics;
use crate::rate_limit::{RateCategory, RateLimiter, UsageSnapshot};
use crate::session::{SessionManager, SessionState};
use crate::storage::{BarStore, PgBarStore, StorageError};
use crate::upstream::UpstreamClient;

/// Engine construction errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ErrorClassification for EngineError {
    fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Configuration(_) => ErrorCategory::Configuration,
            EngineError::Storage(e) => e.category(),
            EngineError::Metrics(_) => ErrorCategory::Internal,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Point-in-time view of the upstream connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    #[serde(flatten)]
    pub session: SessionState,
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub pending_requests: usize,
    /// Window store currently backing the limiter
    pub rate_limit_store: String,
    /// True while the shared store is failing over to local state
    pub rate_limit_degraded: bool,
}

pub struct AcquisitionEngine {
    session: SessionManager,
    limiter: Arc<RateLimiter>,
    pending: PendingRequests,
    coordinator: Arc<RequestCoordinator>,
    orchestrator: Arc<BackfillOrchestrator>,
}

impl AcquisitionEngine {
    /// Assemble the engine around an upstream client and a bar store.
    ///
    /// Connects to the shared rate-limit store when one is configured.
    pub async fn new(settings: &Settings, client: Arc<dyn UpstreamClient>, store: Arc<dyn BarStore>) -> Self {
        let client_id = settings.upstream.client_id;
        let limiter = Arc::new(RateLimiter::connect(settings.rate_limit.clone(), client_id).await);
        Self::with_limiter(settings, client, store, limiter)
    }

    /// Assemble the engine with an existing limiter
    pub fn with_limiter(
        settings: &Settings,
        client: Arc<dyn UpstreamClient>,
        store: Arc<dyn BarStore>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let pending = PendingRequests::new();
        let session = SessionManager::spawn(
            settings.upstream.clone(),
            settings.session.clone(),
            client.clone(),
            limiter.clone(),
            pending.clone(),
        );
        let coordinator = Arc::new(RequestCoordinator::new(
            session.clone(),
            limiter.clone(),
            pending.clone(),
            client,
        ));
        let orchestrator = Arc::new(BackfillOrchestrator::new(
            coordinator.clone(),
            store,
            settings.backfill.clone(),
        ));

        Self {
            session,
            limiter,
            pending,
            coordinator,
            orchestrator,
        }
    }

    /// Validate settings, open the database pool and assemble the engine
    pub async fn from_settings(settings: &Settings, client: Arc<dyn UpstreamClient>) -> EngineResult<Self> {
        settings.validate()?;
        let store = PgBarStore::from_settings(&settings.database).await?;
        Ok(Self::new(settings, client, Arc::new(store)).await)
    }

    /// Register metrics and open the upstream session.
    ///
    /// Returns whether the session is up; a failed start can be retried, and
    /// backfills reconnect on their own.
    pub async fn start(&self) -> EngineResult<bool> {
        metrics::register_metrics()?;
        let upstream = self.session.upstream_settings();
        info!(
            host = %upstream.host,
            port = upstream.port,
            client_id = upstream.client_id,
            rate_limit_store = self.limiter.store_name(),
            "Starting acquisition engine"
        );

        let connected = self.session.ensure_connected().await;
        if !connected {
            warn!("Acquisition engine started without an upstream session");
        }
        Ok(connected)
    }

    /// Cancel any bulk backfill and close the session
    pub async fn stop(&self) {
        self.orchestrator.cancel();
        self.session.disconnect().await;
        info!("Acquisition engine stopped");
    }

    pub async fn backfill_symbol(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        skip_existing: bool,
    ) -> BackfillResult<BackfillStats> {
        self.orchestrator
            .backfill_symbol(symbol, start, end, skip_existing)
            .await
    }

    pub async fn bulk_backfill(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        skip_existing: bool,
    ) -> BackfillResult<BulkBackfillReport> {
        self.orchestrator
            .bulk_backfill(symbols, start, end, skip_existing)
            .await
    }

    pub fn cancel_backfill(&self) {
        self.orchestrator.cancel();
    }

    pub fn backfill_progress(&self) -> Option<BackfillProgress> {
        self.orchestrator.progress()
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        let session = self.session.state().await.unwrap_or_default();
        let upstream = self.session.upstream_settings();
        ConnectionStatus {
            session,
            host: upstream.host.clone(),
            port: upstream.port,
            client_id: upstream.client_id,
            pending_requests: self.pending.len(),
            rate_limit_store: self.limiter.store_name().to_string(),
            rate_limit_degraded: self.limiter.is_degraded(),
        }
    }

    pub async fn usage(&self, category: RateCategory) -> UsageSnapshot {
        self.limiter.get_usage(category).await
    }

    pub async fn usage_all(&self) -> Vec<UsageSnapshot> {
        self.limiter.usage_all().await
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator> {
        &self.coordinator
    }

    pub fn orchestrator(&self) -> &Arc<BackfillOrchestrator> {
        &self.orchestrator
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}
