//! Backfill orchestration
//!
//! Drives single-symbol and bulk historical backfills through the request
//! coordinator. Failures below the symbol level (a chunk that times out, a bar
//! that fails validation) are recorded in [`BackfillStats`] and never abort
//! the run; a bulk backfill always returns a full report.

use chrono::{NaiveDate, Utc};
use market_common::data::{
    compute_gaps, BackfillProgress, BackfillStats, BarValidator, BulkBackfillReport, DailyBar, DateGap,
};
use market_common::error::{ErrorCategory, ErrorClassification};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::chunking::{plan_chunks, Chunk};
use crate::config::BackfillSettings;
use crate::coordinator::{CoordinatorError, RequestCoordinator};
use crate::metrics;
use crate::storage::{BarStore, StorageError, StorageResult};
use crate::upstream::{Contract, ContractDefaults, HistoricalRequest, RawBar};

/// Backfill errors surfaced to the caller
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackfillError {
    /// No upstream session could be established
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Storage failed; `stats` carries what was stored before the failure
    #[error("Persistence error: {source}")]
    Persistence {
        #[source]
        source: StorageError,
        stats: Box<BackfillStats>,
    },

    #[error("Invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),
}

impl ErrorClassification for BackfillError {
    fn category(&self) -> ErrorCategory {
        match self {
            BackfillError::Connectivity(_) => ErrorCategory::Transient,
            BackfillError::Persistence { source, .. } => source.category(),
            BackfillError::InvalidRange { .. } => ErrorCategory::Permanent,
            BackfillError::InvalidSymbol(_) => ErrorCategory::Permanent,
        }
    }
}

impl BackfillError {
    /// Stats gathered before a storage failure ended the symbol
    pub fn partial_stats(&self) -> Option<&BackfillStats> {
        match self {
            BackfillError::Persistence { stats, .. } => Some(stats.as_ref()),
            _ => None,
        }
    }
}

pub type BackfillResult<T> = Result<T, BackfillError>;

pub struct BackfillOrchestrator {
    coordinator: Arc<RequestCoordinator>,
    store: Arc<dyn BarStore>,
    settings: BackfillSettings,
    contract: ContractDefaults,
    validator: BarValidator,
    cancelled: AtomicBool,
    progress: RwLock<Option<BackfillProgress>>,
}

impl BackfillOrchestrator {
    pub fn new(
        coordinator: Arc<RequestCoordinator>,
        store: Arc<dyn BarStore>,
        settings: BackfillSettings,
    ) -> Self {
        let contract = coordinator.session().upstream_settings().contract.clone();
        let validator = BarValidator::new(settings.validator_config());
        Self {
            coordinator,
            store,
            settings,
            contract,
            validator,
            cancelled: AtomicBool::new(false),
            progress: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &BackfillSettings {
        &self.settings
    }

    /// Stop a running bulk backfill before its next symbol
    pub fn cancel(&self) {
        info!("Backfill cancellation requested");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Progress of the current or last bulk backfill
    pub fn progress(&self) -> Option<BackfillProgress> {
        self.progress.read().clone()
    }

    /// Backfill one symbol over `[start, end]`.
    ///
    /// With `skip_existing`, only the weekday gaps missing from storage are
    /// requested. Chunk failures are recorded in the stats; only storage
    /// failures and invalid input are returned as errors. A storage failure
    /// stops the symbol and returns the stats gathered so far inside
    /// [`BackfillError::Persistence`].
    pub async fn backfill_symbol(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        skip_existing: bool,
    ) -> BackfillResult<BackfillStats> {
        if start > end {
            return Err(BackfillError::InvalidRange { start, end });
        }
        let symbol = normalize_symbol(symbol)?;
        let started = Instant::now();
        let mut stats = BackfillStats::new(&symbol, start, end);

        let ranges = if skip_existing {
            let existing = match self.store.list_existing_dates(&symbol, start, end).await {
                Ok(existing) => existing,
                Err(e) => return Err(persistence_failure(e, stats, started)),
            };
            let gaps = compute_gaps(&existing, start, end);
            stats.gaps_found = gaps.len() as u64;
            info!(
                %symbol,
                existing = existing.len(),
                gaps = gaps.len(),
                "Gap scan complete"
            );
            gaps
        } else {
            vec![DateGap::new(start, end)]
        };

        if ranges.is_empty() {
            info!(%symbol, %start, %end, "No missing dates, nothing to backfill");
            return Ok(stats.complete(skip_existing, started.elapsed()));
        }

        for range in ranges {
            for chunk in plan_chunks(range, self.settings.max_chunk_days) {
                if let Err(e) = self.run_chunk(&symbol, chunk, &mut stats).await {
                    error!(
                        %symbol,
                        start = %chunk.start,
                        end = %chunk.end,
                        stored = stats.bars_stored,
                        error = %e,
                        "Storage failed, stopping symbol"
                    );
                    return Err(persistence_failure(e, stats, started));
                }
            }
        }

        let stats = stats.complete(skip_existing, started.elapsed());
        if stats.success {
            info!(
                %symbol,
                stored = stats.bars_stored,
                rejected = stats.bars_rejected,
                chunks = stats.chunks_total,
                failed_chunks = stats.chunks_failed,
                "Backfill complete"
            );
        } else {
            error!(
                %symbol,
                chunks = stats.chunks_total,
                failed_chunks = stats.chunks_failed,
                error = stats.error_message.as_deref().unwrap_or("no bars stored"),
                "Backfill failed"
            );
        }
        Ok(stats)
    }

    /// Request, validate and store one chunk
    async fn run_chunk(&self, symbol: &str, chunk: Chunk, stats: &mut BackfillStats) -> StorageResult<()> {
        stats.chunks_total += 1;
        stats.bars_requested += chunk.expected_bars();

        let request = HistoricalRequest {
            contract: Contract::stock(symbol, &self.contract),
            end_date: chunk.end,
            duration: chunk.duration,
            bar_size: self.settings.bar_size.clone(),
            what_to_show: self.settings.what_to_show.clone(),
            use_rth: self.settings.use_rth,
        };
        debug!(%symbol, start = %chunk.start, end = %chunk.end, duration = %chunk.duration, "Requesting chunk");

        let mut attempt = 0;
        let outcome = loop {
            match self
                .coordinator
                .request_historical(&request, self.settings.historical_timeout())
                .await
            {
                Ok(outcome) => break outcome,
                Err(e) if e.is_transient() && attempt < self.settings.chunk_retries.min(e.max_retries()) => {
                    attempt += 1;
                    let delay = e.suggested_retry_delay().unwrap_or_default();
                    warn!(
                        %symbol,
                        start = %chunk.start,
                        end = %chunk.end,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chunk failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log_chunk_failure(symbol, &chunk, &e);
                    stats.record_chunk_failure(format!("chunk {}..={}: {}", chunk.start, chunk.end, e));
                    return Ok(());
                }
            }
        };

        stats.bars_received += outcome.bars.len() as u64;
        let bars = self.accept_bars(symbol, &chunk, outcome.bars, stats);
        if bars.is_empty() {
            debug!(%symbol, start = %chunk.start, end = %chunk.end, "Chunk returned no storable bars");
            return Ok(());
        }

        let written = self.store.upsert_bars(&bars).await?;
        stats.bars_stored += written as u64;
        metrics::BARS_STORED_TOTAL.inc_by(written as u64);
        Ok(())
    }

    /// Parse and validate; rejected bars are counted and dropped
    fn accept_bars(
        &self,
        symbol: &str,
        chunk: &Chunk,
        raw: Vec<RawBar>,
        stats: &mut BackfillStats,
    ) -> Vec<DailyBar> {
        let mut accepted = Vec::with_capacity(raw.len());
        for raw_bar in raw {
            let bar = match raw_bar.into_daily_bar(symbol) {
                Ok(bar) => bar,
                Err(e) => {
                    warn!(%symbol, error = %e, "Rejected bar with unparseable date");
                    reject(stats);
                    continue;
                }
            };
            if !chunk.contains(bar.date) {
                continue;
            }
            if let Err(e) = self.validator.validate(&bar) {
                warn!(%symbol, date = %bar.date, reason = %e, "Rejected bar");
                reject(stats);
                continue;
            }
            accepted.push(bar);
        }
        accepted
    }

    /// Backfill symbols one after another.
    ///
    /// Fails only when no session can be established up front. Every
    /// attempted symbol gets an entry in the report; symbols left after a
    /// cancellation are listed as skipped.
    pub async fn bulk_backfill(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        skip_existing: bool,
    ) -> BackfillResult<BulkBackfillReport> {
        if start > end {
            return Err(BackfillError::InvalidRange { start, end });
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let session = self.coordinator.session();
        session.reset_retries().await;
        if !session.ensure_connected().await {
            error!(symbols = symbols.len(), "Cannot start bulk backfill, upstream unavailable");
            return Err(BackfillError::Connectivity(
                "upstream session could not be established".into(),
            ));
        }

        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        *self.progress.write() = Some(BackfillProgress::new(symbols.len()));
        info!(%batch_id, symbols = symbols.len(), %start, %end, skip_existing, "Starting bulk backfill");

        let mut results = Vec::with_capacity(symbols.len());
        let mut skipped = Vec::new();

        for (index, symbol) in symbols.iter().enumerate() {
            if index > 0 && !self.settings.inter_symbol_delay().is_zero() {
                tokio::time::sleep(self.settings.inter_symbol_delay()).await;
            }
            if self.is_cancelled() {
                warn!(%batch_id, remaining = symbols.len() - index, "Bulk backfill cancelled");
                skipped = symbols[index..].to_vec();
                break;
            }
            self.update_progress(index, Some(symbol));
            info!(%batch_id, %symbol, position = index + 1, total = symbols.len(), "Backfilling symbol");

            let symbol_started = Instant::now();
            let stats = match self.backfill_symbol(symbol, start, end, skip_existing).await {
                Ok(stats) => stats,
                Err(BackfillError::Persistence { stats, .. }) => {
                    error!(%batch_id, %symbol, stored = stats.bars_stored, "Symbol backfill stopped by storage failure");
                    *stats
                }
                Err(e) => {
                    error!(%batch_id, %symbol, error = %e, "Symbol backfill aborted");
                    BackfillStats::failed(symbol.clone(), start, end, e.to_string(), symbol_started.elapsed())
                }
            };
            results.push(stats);
        }

        self.update_progress(results.len(), None);
        let report = BulkBackfillReport::from_stats(batch_id, started_at, results, skipped);
        info!(
            %batch_id,
            successful = report.successful_symbols,
            failed = report.failed_symbols,
            skipped = report.skipped_symbols.len(),
            bars_stored = report.total_bars_stored,
            "Bulk backfill finished"
        );
        Ok(report)
    }

    fn update_progress(&self, completed: usize, symbol: Option<&str>) {
        if let Some(progress) = self.progress.write().as_mut() {
            progress.advance(completed, symbol, Utc::now());
        }
    }
}

fn normalize_symbol(symbol: &str) -> BackfillResult<String> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(BackfillError::InvalidSymbol(symbol.to_string()));
    }
    Ok(symbol.to_uppercase())
}

fn persistence_failure(source: StorageError, stats: BackfillStats, started: Instant) -> BackfillError {
    let stats = stats.abort(format!("Persistence error: {}", source), started.elapsed());
    BackfillError::Persistence {
        source,
        stats: Box::new(stats),
    }
}

fn reject(stats: &mut BackfillStats) {
    stats.bars_rejected += 1;
    metrics::BARS_REJECTED_TOTAL.inc();
}

fn log_chunk_failure(symbol: &str, chunk: &Chunk, e: &CoordinatorError) {
    match e {
        CoordinatorError::Subscription { .. } => {
            warn!(%symbol, start = %chunk.start, end = %chunk.end, error = %e, "Chunk skipped, subscription issue")
        }
        _ => error!(%symbol, start = %chunk.start, end = %chunk.end, error = %e, "Chunk failed"),
    }
}
