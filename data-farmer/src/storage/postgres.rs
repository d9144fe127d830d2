//! PostgreSQL bar store

use async_trait::async_trait;
use chrono::NaiveDate;
use market_common::data::DailyBar;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

use super::traits::{check_storable, BarStore, StorageError, StorageResult};
use crate::config::DatabaseSettings;

/// Rows per multi-row upsert; 8 binds each stays well under the bind limit
const UPSERT_BATCH_SIZE: usize = 1000;

/// Bar store over the `daily_prices` table.
///
/// Expects a unique constraint on `(symbol, date)`.
pub struct PgBarStore {
    pool: PgPool,
}

impl PgBarStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_settings(settings: &DatabaseSettings) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&settings.url)
            .await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_batch(&self, bars: &[&DailyBar]) -> StorageResult<usize> {
        let mut query = QueryBuilder::new(
            "INSERT INTO daily_prices (symbol, date, open, high, low, close, volume, adj_close) ",
        );
        query.push_values(bars.iter().copied(), |mut row, bar| {
            row.push_bind(&bar.symbol)
                .push_bind(bar.date)
                .push_bind(bar.open)
                .push_bind(bar.high)
                .push_bind(bar.low)
                .push_bind(bar.close)
                .push_bind(bar.volume)
                .push_bind(bar.adj_close);
        });
        query.push(
            r#"
            ON CONFLICT (symbol, date) DO UPDATE SET
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume,
                adj_close = EXCLUDED.adj_close
            "#,
        );

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl BarStore for PgBarStore {
    async fn upsert_bar(&self, bar: &DailyBar) -> StorageResult<()> {
        check_storable(bar)?;
        sqlx::query(
            r#"
            INSERT INTO daily_prices (symbol, date, open, high, low, close, volume, adj_close)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (symbol, date) DO UPDATE SET
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume,
                adj_close = EXCLUDED.adj_close
            "#,
        )
        .bind(&bar.symbol)
        .bind(bar.date)
        .bind(bar.open)
        .bind(bar.high)
        .bind(bar.low)
        .bind(bar.close)
        .bind(bar.volume)
        .bind(bar.adj_close)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_bars(&self, bars: &[DailyBar]) -> StorageResult<usize> {
        bars.iter().try_for_each(check_storable)?;

        // One statement cannot update the same row twice; the later bar wins
        let mut latest: BTreeMap<(&str, NaiveDate), &DailyBar> = BTreeMap::new();
        for bar in bars {
            latest.insert((bar.symbol.as_str(), bar.date), bar);
        }
        let unique: Vec<&DailyBar> = latest.into_values().collect();

        let mut written = 0;
        for chunk in unique.chunks(UPSERT_BATCH_SIZE) {
            written += self.upsert_batch(chunk).await?;
        }
        debug!(written, "Upserted daily bars");
        Ok(written)
    }

    async fn list_existing_dates(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StorageResult<BTreeSet<NaiveDate>> {
        let rows = sqlx::query(
            r#"
            SELECT date FROM daily_prices
            WHERE symbol = $1 AND date BETWEEN $2 AND $3
            "#,
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<NaiveDate, _>("date").map_err(StorageError::from))
            .collect()
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
