//! Mock upstream for testing
//!
//! Scriptable per symbol: generated bars, fixed bars, an error code, or no
//! response at all. Connection behaviour is scriptable too, and every request
//! is logged for assertions.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use market_common::data::weekdays_between;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

use super::traits::{UpstreamClient, UpstreamError, UpstreamResult};
use super::types::{ConnectParams, HistoricalRequest, RawBar, UpstreamEvent};

/// How the mock answers a historical request
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    /// One bar per weekday covered by the request
    Generated,
    /// Exactly these bars
    Bars(Vec<RawBar>),
    /// Never answer; the caller's timeout fires
    Silent,
    /// Answer with an error callback
    Error { code: i32, message: String },
}

/// How the mock answers connect()
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Transport opens and the session-ready signal follows
    Ready,
    /// Transport opens but the session never becomes ready
    NeverReady,
    /// Transport refuses the connection
    Refuse,
}

pub struct MockUpstream {
    responses: Mutex<HashMap<String, MockResponse>>,
    /// One-shot responses used before the standing one
    queued: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    default_response: Mutex<MockResponse>,
    connect_behavior: Mutex<ConnectBehavior>,
    /// Connects that fail before `connect_behavior` applies
    failing_connects: AtomicU32,
    events: Mutex<Option<mpsc::UnboundedSender<UpstreamEvent>>>,
    requests: Mutex<Vec<(i64, HistoricalRequest)>>,
    cancelled: Mutex<Vec<i64>>,
    connects: AtomicU32,
    next_valid_id: i64,
    /// Base price for generated bars
    pub base_price: Decimal,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            default_response: Mutex::new(MockResponse::Generated),
            connect_behavior: Mutex::new(ConnectBehavior::Ready),
            failing_connects: AtomicU32::new(0),
            events: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            connects: AtomicU32::new(0),
            next_valid_id: 1,
            base_price: Decimal::from(50),
        }
    }

    /// Script the response for one symbol
    pub fn with_response(self, symbol: &str, response: MockResponse) -> Self {
        self.set_response(symbol, response);
        self
    }

    /// Answer the symbol's next request with `response`, then fall back
    pub fn with_response_once(self, symbol: &str, response: MockResponse) -> Self {
        self.queue_response(symbol, response);
        self
    }

    /// Request id announced in the session-ready event
    pub fn with_next_valid_id(mut self, id: i64) -> Self {
        self.next_valid_id = id;
        self
    }

    pub fn with_connect_behavior(self, behavior: ConnectBehavior) -> Self {
        *self.connect_behavior.lock() = behavior;
        self
    }

    pub fn set_response(&self, symbol: &str, response: MockResponse) {
        self.responses.lock().insert(symbol.to_uppercase(), response);
    }

    pub fn queue_response(&self, symbol: &str, response: MockResponse) {
        self.queued
            .lock()
            .entry(symbol.to_uppercase())
            .or_default()
            .push_back(response);
    }

    /// Response for symbols without a scripted one
    pub fn set_default_response(&self, response: MockResponse) {
        *self.default_response.lock() = response;
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        *self.connect_behavior.lock() = behavior;
    }

    /// Refuse the next `n` connects regardless of behaviour
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Push an event as if the upstream had sent it; false when not connected
    pub fn emit(&self, event: UpstreamEvent) -> bool {
        self.events
            .lock()
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    /// Simulate the peer dropping the connection
    pub fn drop_connection(&self) {
        if let Some(tx) = self.events.lock().take() {
            let _ = tx.send(UpstreamEvent::ConnectionClosed);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.events.lock().is_some()
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HistoricalRequest> {
        self.requests.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests issued for one symbol
    pub fn requests_for(&self, symbol: &str) -> Vec<HistoricalRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|(_, r)| r.contract.symbol == symbol)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn cancelled(&self) -> Vec<i64> {
        self.cancelled.lock().clone()
    }

    fn generate_bars(&self, request: &HistoricalRequest) -> Vec<RawBar> {
        let span = request.duration.approx_days() as i64;
        let start = request.end_date - ChronoDuration::days(span - 1);

        weekdays_between(start, request.end_date)
            .enumerate()
            .map(|(i, date)| {
                let step = Decimal::from((i % 5) as i64);
                let close = self.base_price + step;
                RawBar {
                    date: date.format("%Y%m%d").to_string(),
                    open: close - Decimal::ONE,
                    high: close + Decimal::ONE,
                    low: close - Decimal::TWO,
                    close,
                    volume: 10_000 + i as i64,
                }
            })
            .collect()
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn connect(
        &self,
        _params: &ConnectParams,
        events: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> UpstreamResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let behavior = *self.connect_behavior.lock();
        if failing || behavior == ConnectBehavior::Refuse {
            return Err(UpstreamError::Connection("connection refused".into()));
        }

        if behavior == ConnectBehavior::Ready {
            let _ = events.send(UpstreamEvent::SessionReady {
                next_valid_id: self.next_valid_id,
            });
        }
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn disconnect(&self) -> UpstreamResult<()> {
        self.events.lock().take();
        Ok(())
    }

    async fn request_historical(&self, request_id: i64, request: &HistoricalRequest) -> UpstreamResult<()> {
        let events = self.events.lock().clone().ok_or(UpstreamError::NotConnected)?;
        self.requests.lock().push((request_id, request.clone()));

        let queued = self
            .queued
            .lock()
            .get_mut(&request.contract.symbol)
            .and_then(VecDeque::pop_front);
        let response = queued.unwrap_or_else(|| {
            self.responses
                .lock()
                .get(&request.contract.symbol)
                .cloned()
                .unwrap_or_else(|| self.default_response.lock().clone())
        });

        let bars = match response {
            MockResponse::Generated => self.generate_bars(request),
            MockResponse::Bars(bars) => bars,
            MockResponse::Silent => return Ok(()),
            MockResponse::Error { code, message } => {
                let _ = events.send(UpstreamEvent::Error {
                    request_id: Some(request_id),
                    code,
                    message,
                });
                return Ok(());
            }
        };

        for bar in bars {
            let _ = events.send(UpstreamEvent::HistoricalBar { request_id, bar });
        }
        let _ = events.send(UpstreamEvent::HistoricalEnd { request_id });
        Ok(())
    }

    async fn cancel_historical(&self, request_id: i64) -> UpstreamResult<()> {
        self.cancelled.lock().push(request_id);
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
