//! Backfill accounting types
//!
//! These types are produced by the backfill orchestrator in `data-farmer` and
//! consumed by whatever reports on it (CLI, API, scheduler). They are plain
//! data and never persisted by the engine itself.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::gap_detection::weekdays_between;

/// A contiguous range of missing weekdays, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateGap {
    /// First missing date (inclusive)
    pub start: NaiveDate,
    /// Last missing date (inclusive)
    pub end: NaiveDate,
}

impl DateGap {
    /// Create a new gap; `start` must not be after `end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "gap start {} after end {}", start, end);
        Self { start, end }
    }

    /// Single-day gap
    pub fn single(date: NaiveDate) -> Self {
        Self::new(date, date)
    }

    /// Calendar days covered, counting both ends
    pub fn calendar_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Weekdays covered, counting both ends
    pub fn weekday_count(&self) -> u64 {
        weekdays_between(self.start, self.end).count() as u64
    }

    /// Whether the date lies inside the gap
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl std::fmt::Display for DateGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Outcome of one symbol's backfill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillStats {
    pub symbol: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Weekdays covered by the issued chunks (naive estimate of expected bars)
    pub bars_requested: u64,
    /// Bars delivered by the upstream, valid or not
    pub bars_received: u64,
    /// Successful idempotent upserts
    pub bars_stored: u64,
    /// Bars dropped by validation
    pub bars_rejected: u64,
    /// Gaps found when restricting to missing dates; 0 otherwise
    pub gaps_found: u64,
    /// Chunks issued to the upstream
    pub chunks_total: u32,
    /// Chunks that timed out or were rejected
    pub chunks_failed: u32,
    pub duration_seconds: f64,
    pub success: bool,
    /// Last chunk error, or the error that ended the symbol
    pub error_message: Option<String>,
}

impl BackfillStats {
    /// Empty stats for a symbol and range
    pub fn new(symbol: impl Into<String>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            symbol: symbol.into(),
            start_date,
            end_date,
            bars_requested: 0,
            bars_received: 0,
            bars_stored: 0,
            bars_rejected: 0,
            gaps_found: 0,
            chunks_total: 0,
            chunks_failed: 0,
            duration_seconds: 0.0,
            success: false,
            error_message: None,
        }
    }

    /// Stats for a symbol that failed before any chunk completed
    pub fn failed(
        symbol: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        error: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self::new(symbol, start_date, end_date).abort(error, elapsed)
    }

    /// Finalize a symbol that stopped part way; counts gathered so far are kept
    pub fn abort(mut self, error: impl Into<String>, elapsed: Duration) -> Self {
        self.error_message = Some(error.into());
        self.duration_seconds = elapsed.as_secs_f64();
        self.success = false;
        self
    }

    /// Record a failed chunk, keeping the latest error message
    pub fn record_chunk_failure(&mut self, error: impl Into<String>) {
        self.chunks_failed += 1;
        self.error_message = Some(error.into());
    }

    /// Finalize after all chunks ran.
    ///
    /// Success means at least one bar was stored, or gap detection ran and
    /// found nothing to fill.
    pub fn complete(mut self, gaps_scanned: bool, elapsed: Duration) -> Self {
        self.duration_seconds = elapsed.as_secs_f64();
        self.success = self.bars_stored > 0 || (gaps_scanned && self.gaps_found == 0);
        self
    }
}

/// Progress of a running bulk backfill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillProgress {
    pub total_symbols: usize,
    pub completed_symbols: usize,
    pub current_symbol: Option<String>,
    pub started_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl BackfillProgress {
    pub fn new(total_symbols: usize) -> Self {
        Self {
            total_symbols,
            completed_symbols: 0,
            current_symbol: None,
            started_at: Utc::now(),
            estimated_completion: None,
        }
    }

    /// Mark `symbol` as in progress after `completed` symbols finished.
    ///
    /// The completion estimate extrapolates the average time per finished symbol.
    pub fn advance(&mut self, completed: usize, symbol: Option<&str>, now: DateTime<Utc>) {
        self.completed_symbols = completed;
        self.current_symbol = symbol.map(str::to_string);
        self.estimated_completion = if completed == 0 {
            None
        } else {
            let elapsed = now - self.started_at;
            let per_symbol = elapsed / completed as i32;
            let remaining = self.total_symbols.saturating_sub(completed) as i32;
            Some(now + per_symbol * remaining)
        };
    }

    /// Fraction of symbols finished, in [0, 1]
    pub fn fraction_complete(&self) -> f64 {
        if self.total_symbols == 0 {
            return 1.0;
        }
        self.completed_symbols as f64 / self.total_symbols as f64
    }
}

/// Full report of a bulk backfill; always complete, even when every symbol failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkBackfillReport {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per attempted symbol, in input order
    pub stats: Vec<BackfillStats>,
    /// Symbols never attempted because the batch was cancelled
    pub skipped_symbols: Vec<String>,
    pub cancelled: bool,
    pub successful_symbols: usize,
    pub failed_symbols: usize,
    pub total_bars_stored: u64,
}

impl BulkBackfillReport {
    /// Build the report and its derived counts
    pub fn from_stats(
        batch_id: Uuid,
        started_at: DateTime<Utc>,
        stats: Vec<BackfillStats>,
        skipped_symbols: Vec<String>,
    ) -> Self {
        let successful_symbols = stats.iter().filter(|s| s.success).count();
        let total_bars_stored = stats.iter().map(|s| s.bars_stored).sum();
        Self {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            failed_symbols: stats.len() - successful_symbols,
            successful_symbols,
            total_bars_stored,
            cancelled: !skipped_symbols.is_empty(),
            skipped_symbols,
            stats,
        }
    }

    /// Wall-clock duration of the batch
    pub fn elapsed(&self) -> ChronoDuration {
        self.finished_at - self.started_at
    }

    pub fn summary(&self) -> BackfillSummary {
        let total_duration_seconds: f64 = self.stats.iter().map(|s| s.duration_seconds).sum();
        let failed: Vec<(String, Option<String>)> = self
            .stats
            .iter()
            .filter(|s| !s.success)
            .map(|s| (s.symbol.clone(), s.error_message.clone()))
            .collect();

        BackfillSummary {
            total_symbols: self.stats.len(),
            successful_symbols: self.successful_symbols,
            failed_symbols: self.failed_symbols,
            total_bars_stored: self.total_bars_stored,
            total_duration_seconds,
            average_duration_per_symbol: if self.stats.is_empty() {
                0.0
            } else {
                total_duration_seconds / self.stats.len() as f64
            },
            failed_symbol_details: failed,
        }
    }
}

/// Aggregate view of a bulk backfill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub total_symbols: usize,
    pub successful_symbols: usize,
    pub failed_symbols: usize,
    pub total_bars_stored: u64,
    pub total_duration_seconds: f64,
    pub average_duration_per_symbol: f64,
    pub failed_symbol_details: Vec<(String, Option<String>)>,
}
