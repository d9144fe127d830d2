use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One daily OHLCV record, corresponding one-to-one with the `daily_prices` table.
///
/// The table is unique on `(symbol, date)`; writes update the existing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    /// Upper-cased instrument symbol, e.g. "BHP"
    pub symbol: String,
    /// Trading date
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Traded volume; upstream "not reported" is stored as 0
    pub volume: i64,
    /// Adjusted close; equal to close unless an adjustment source is wired in
    pub adj_close: Decimal,
}

impl DailyBar {
    /// Create a bar whose adjusted close equals its close
    pub fn new(
        symbol: impl Into<String>,
        date: NaiveDate,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: i64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            date,
            open,
            high,
            low,
            close,
            volume,
            adj_close: close,
        }
    }

    /// Override the adjusted close
    pub fn with_adj_close(mut self, adj_close: Decimal) -> Self {
        self.adj_close = adj_close;
        self
    }
}
