//! End-to-end backfill runs against the mock upstream and in-memory storage

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use data_farmer::upstream::{ConnectBehavior, MockResponse, MockUpstream};
use data_farmer::{AcquisitionEngine, BackfillError, BarStore, InMemoryBarStore, Settings};
use market_common::data::{weekdays_between, DailyBar};
use rust_decimal_macros::dec;

struct Fixture {
    mock: Arc<MockUpstream>,
    store: Arc<InMemoryBarStore>,
    engine: Arc<AcquisitionEngine>,
}

async fn fixture(mock: MockUpstream, store: InMemoryBarStore) -> Fixture {
    let mock = Arc::new(mock);
    let store = Arc::new(store);
    let engine = AcquisitionEngine::new(&Settings::default_settings(), mock.clone(), store.clone()).await;
    Fixture {
        mock,
        store,
        engine: Arc::new(engine),
    }
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn symbols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn bulk_backfill_survives_a_timed_out_symbol() -> anyhow::Result<()> {
    let f = fixture(
        MockUpstream::new().with_response("CBA", MockResponse::Silent),
        InMemoryBarStore::new(),
    )
    .await;

    let report = f
        .engine
        .bulk_backfill(&symbols(&["BHP", "CBA", "WBC"]), d(2024, 1, 1), d(2024, 1, 31), false)
        .await?;

    assert_eq!(report.successful_symbols, 2);
    assert_eq!(report.failed_symbols, 1);
    assert!(!report.cancelled);
    assert_eq!(report.stats.len(), 3);
    assert_eq!(report.total_bars_stored, 46);

    // The symbol after the failure was still attempted
    assert_eq!(f.mock.requests_for("WBC").len(), 1);
    assert_eq!(f.store.bars_for("WBC").len(), 23);
    assert!(f.store.bars_for("CBA").is_empty());

    let summary = report.summary();
    assert_eq!(summary.failed_symbol_details.len(), 1);
    assert_eq!(summary.failed_symbol_details[0].0, "CBA");
    assert!(summary.failed_symbol_details[0].1.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn skip_existing_over_covered_range_issues_no_requests() -> anyhow::Result<()> {
    let start = d(2024, 1, 1);
    let end = d(2024, 3, 29);
    let existing: Vec<DailyBar> = weekdays_between(start, end)
        .map(|date| DailyBar::new("BHP", date, dec!(45), dec!(46), dec!(44), dec!(45.5), 1000))
        .collect();
    let f = fixture(MockUpstream::new(), InMemoryBarStore::with_bars(existing)).await;

    let stats = f.engine.backfill_symbol("BHP", start, end, true).await?;
    assert!(stats.success);
    assert_eq!(stats.gaps_found, 0);
    assert_eq!(stats.chunks_total, 0);
    assert_eq!(f.mock.request_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn repeated_backfill_is_idempotent() -> anyhow::Result<()> {
    let f = fixture(MockUpstream::new(), InMemoryBarStore::new()).await;
    let (start, end) = (d(2024, 2, 1), d(2024, 2, 29));

    let first = f.engine.backfill_symbol("BHP", start, end, false).await?;
    let rows = f.store.len();
    let second = f.engine.backfill_symbol("BHP", start, end, false).await?;

    assert_eq!(first.bars_stored, second.bars_stored);
    assert_eq!(f.store.len(), rows);
    assert_eq!(f.mock.requests_for("BHP").len(), 2);

    let existing = f.store.list_existing_dates("BHP", start, end).await?;
    assert_eq!(existing.len() as u64, first.bars_stored);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn multi_year_backfill_chunks_in_ascending_order() -> anyhow::Result<()> {
    let f = fixture(MockUpstream::new(), InMemoryBarStore::new()).await;

    let stats = f
        .engine
        .backfill_symbol("BHP", d(2022, 1, 1), d(2024, 6, 30), false)
        .await?;
    assert!(stats.success);
    assert_eq!(stats.chunks_total, 3);

    let ends: Vec<NaiveDate> = f.mock.requests().iter().map(|r| r.end_date).collect();
    assert_eq!(ends, vec![d(2022, 12, 31), d(2023, 12, 31), d(2024, 6, 30)]);
    assert_eq!(stats.bars_stored, weekdays_between(d(2022, 1, 1), d(2024, 6, 30)).count() as u64);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelled_bulk_backfill_lists_skipped_symbols() -> anyhow::Result<()> {
    let f = fixture(MockUpstream::new(), InMemoryBarStore::new()).await;

    let engine = f.engine.clone();
    let run = tokio::spawn(async move {
        engine
            .bulk_backfill(&symbols(&["BHP", "CBA", "WBC"]), d(2024, 1, 1), d(2024, 1, 5), false)
            .await
    });

    // First symbol completes at once; cancel during the inter-symbol delay
    tokio::time::sleep(Duration::from_millis(500)).await;
    f.engine.cancel_backfill();

    let report = run.await??;
    assert!(report.cancelled);
    assert_eq!(report.stats.len(), 1);
    assert_eq!(report.skipped_symbols, symbols(&["CBA", "WBC"]));
    assert_eq!(f.mock.request_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bulk_backfill_fails_only_without_a_session() {
    let f = fixture(
        MockUpstream::new().with_connect_behavior(ConnectBehavior::Refuse),
        InMemoryBarStore::new(),
    )
    .await;

    let result = f
        .engine
        .bulk_backfill(&symbols(&["BHP"]), d(2024, 1, 1), d(2024, 1, 5), false)
        .await;
    assert!(matches!(result, Err(BackfillError::Connectivity(_))));
    assert_eq!(f.mock.request_count(), 0);
}
