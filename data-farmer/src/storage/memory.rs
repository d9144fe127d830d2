//! In-memory bar store for tests and dry runs

use async_trait::async_trait;
use chrono::NaiveDate;
use market_common::data::DailyBar;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

use super::traits::{check_storable, BarStore, StorageResult};

/// Bars keyed by symbol, then date
#[derive(Default)]
pub struct InMemoryBarStore {
    bars: RwLock<BTreeMap<String, BTreeMap<NaiveDate, DailyBar>>>,
}

impl InMemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing bars
    pub fn with_bars(bars: impl IntoIterator<Item = DailyBar>) -> Self {
        let store = Self::new();
        {
            let mut map = store.bars.write();
            for bar in bars {
                map.entry(bar.symbol.clone()).or_default().insert(bar.date, bar);
            }
        }
        store
    }

    pub fn get(&self, symbol: &str, date: NaiveDate) -> Option<DailyBar> {
        self.bars.read().get(symbol).and_then(|m| m.get(&date)).cloned()
    }

    /// All bars for a symbol, in date order
    pub fn bars_for(&self, symbol: &str) -> Vec<DailyBar> {
        self.bars
            .read()
            .get(symbol)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total rows across symbols
    pub fn len(&self) -> usize {
        self.bars.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BarStore for InMemoryBarStore {
    async fn upsert_bar(&self, bar: &DailyBar) -> StorageResult<()> {
        check_storable(bar)?;
        self.bars
            .write()
            .entry(bar.symbol.clone())
            .or_default()
            .insert(bar.date, bar.clone());
        Ok(())
    }

    async fn list_existing_dates(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StorageResult<BTreeSet<NaiveDate>> {
        if start > end {
            return Ok(BTreeSet::new());
        }
        Ok(self
            .bars
            .read()
            .get(symbol)
            .map(|m| m.range(start..=end).map(|(date, _)| *date).collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
