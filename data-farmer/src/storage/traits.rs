use async_trait::async_trait;
use chrono::NaiveDate;
use market_common::data::DailyBar;
use market_common::error::{DatabaseError, ErrorCategory, ErrorClassification};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.into())
    }
}

impl ErrorClassification for StorageError {
    fn category(&self) -> ErrorCategory {
        match self {
            StorageError::Database(e) => e.category(),
            StorageError::InvalidData(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            StorageError::Database(e) => e.suggested_retry_delay(),
            _ => None,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence for daily bars.
///
/// Implementations must be safe under concurrent callers writing the same
/// `(symbol, date)`: the last write wins and no duplicate row appears.
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Insert or update one bar
    async fn upsert_bar(&self, bar: &DailyBar) -> StorageResult<()>;

    /// Insert or update a batch; returns the number of bars written
    async fn upsert_bars(&self, bars: &[DailyBar]) -> StorageResult<usize> {
        for bar in bars {
            self.upsert_bar(bar).await?;
        }
        Ok(bars.len())
    }

    /// Dates in `[start, end]` that already have a bar for `symbol`
    async fn list_existing_dates(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StorageResult<BTreeSet<NaiveDate>>;

    fn name(&self) -> &str;
}

/// Reject bars that cannot be written regardless of validation settings
pub(crate) fn check_storable(bar: &DailyBar) -> StorageResult<()> {
    if bar.symbol.trim().is_empty() {
        return Err(StorageError::InvalidData(format!(
            "bar for {} has an empty symbol",
            bar.date
        )));
    }
    Ok(())
}
