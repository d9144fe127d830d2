//! Session behaviour seen through the engine

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use data_farmer::coordinator::CoordinatorError;
use data_farmer::upstream::{
    Contract, ContractDefaults, DurationDescriptor, HistoricalRequest, MockResponse, MockUpstream, UpstreamEvent,
};
use data_farmer::{AcquisitionEngine, InMemoryBarStore, SessionStatus, Settings};

async fn engine(mock: Arc<MockUpstream>) -> AcquisitionEngine {
    AcquisitionEngine::new(&Settings::default_settings(), mock, Arc::new(InMemoryBarStore::new())).await
}

fn request(symbol: &str) -> HistoricalRequest {
    HistoricalRequest {
        contract: Contract::stock(symbol, &ContractDefaults::default()),
        end_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        duration: DurationDescriptor::Days(5),
        bar_size: "1 day".into(),
        what_to_show: "TRADES".into(),
        use_rth: true,
    }
}

#[tokio::test(start_paused = true)]
async fn connectivity_loss_fails_in_flight_requests() -> anyhow::Result<()> {
    let mock = Arc::new(MockUpstream::new().with_response("CBA", MockResponse::Silent));
    let engine = engine(mock.clone()).await;
    assert!(engine.start().await?);

    let coordinator = engine.coordinator().clone();
    let in_flight = tokio::spawn(async move {
        coordinator
            .request_historical(&request("CBA"), Duration::from_secs(30))
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.connection_status().await.pending_requests, 1);

    assert!(mock.emit(UpstreamEvent::Error {
        request_id: None,
        code: 1100,
        message: "Connectivity between client and server is broken".into(),
    }));

    let result = in_flight.await?;
    assert!(matches!(result, Err(CoordinatorError::ConnectivityLost { code: 1100, .. })));

    let status = engine.connection_status().await;
    assert_eq!(status.session.status, SessionStatus::Error);
    assert_eq!(status.pending_requests, 0);

    // Next request reconnects first
    let outcome = engine
        .coordinator()
        .request_historical(&request("BHP"), Duration::from_secs(30))
        .await?;
    assert_eq!(outcome.bars.len(), 5);
    assert_eq!(mock.connect_count(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pacing_violation_locks_out_historical_requests() -> anyhow::Result<()> {
    let mock = Arc::new(MockUpstream::new().with_response(
        "NAB",
        MockResponse::Error {
            code: 100,
            message: "Max rate of messages per second has been exceeded".into(),
        },
    ));
    let engine = engine(mock.clone()).await;
    assert!(engine.start().await?);

    let result = engine
        .coordinator()
        .request_historical(&request("NAB"), Duration::from_secs(30))
        .await;
    assert!(matches!(result, Err(CoordinatorError::RateViolation { .. })));

    let usage = engine.usage(data_farmer::RateCategory::Historical).await;
    assert!(usage.in_lockout);
    assert_eq!(engine.connection_status().await.session.status, SessionStatus::Connected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_upstream_goes_unhealthy_after_heartbeat_timeout() -> anyhow::Result<()> {
    let mock = Arc::new(MockUpstream::new());
    let engine = engine(mock).await;
    assert!(engine.start().await?);

    tokio::time::sleep(Duration::from_secs(331)).await;
    let status = engine.connection_status().await;
    assert_eq!(status.session.status, SessionStatus::Error);

    engine.stop().await;
    assert_eq!(engine.connection_status().await.session.status, SessionStatus::Disconnected);
    Ok(())
}
