//! Session actor and its handle
//!
//! One task owns [`SessionState`] and applies every change in the order the
//! commands arrive: connect and disconnect requests from callers, signals
//! from the upstream event router, and ticks from the health monitor.
//! [`SessionManager`] is the cloneable handle callers use.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::classify::{classify, ErrorClass};
use super::state::{SessionError, SessionResult, SessionState, SessionStatus, ViolationSink};
use crate::config::{SessionSettings, UpstreamSettings};
use crate::coordinator::PendingRequests;
use crate::metrics;
use crate::rate_limit::RateCategory;
use crate::upstream::{spawn_router, UpstreamClient};

/// First request id handed out before the upstream announces its own
const FIRST_REQUEST_ID: i64 = 1000;

/// Upstream-originated input to the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Ready { next_valid_id: i64 },
    Heartbeat,
    /// Data arrived; also counts as a heartbeat
    Data,
    Closed,
    Error {
        code: i32,
        message: String,
        /// Category of the request the error belongs to, if any
        category: Option<RateCategory>,
    },
}

enum Command {
    Connect { reply: oneshot::Sender<bool> },
    Disconnect { reply: oneshot::Sender<()> },
    State { reply: oneshot::Sender<SessionState> },
    HealthCheck { reply: Option<oneshot::Sender<SessionState>> },
    CountRetry,
    ResetRetries,
    Signal(SessionSignal),
    Apply {
        signal: SessionSignal,
        reply: oneshot::Sender<()>,
    },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Sender half used by the event router
#[derive(Clone)]
pub struct SessionSignals {
    commands: mpsc::Sender<Command>,
}

impl SessionSignals {
    /// Forward a signal; false once the session has shut down
    pub async fn send(&self, signal: SessionSignal) -> bool {
        self.commands.send(Command::Signal(signal)).await.is_ok()
    }

    /// Forward a signal and wait until the session has applied it
    pub async fn apply(&self, signal: SessionSignal) -> bool {
        let (reply, applied) = oneshot::channel();
        if self.commands.send(Command::Apply { signal, reply }).await.is_err() {
            return false;
        }
        applied.await.is_ok()
    }
}

/// Cloneable handle to the session actor
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
    upstream: Arc<UpstreamSettings>,
    next_request_id: Arc<AtomicI64>,
    ensure_lock: Arc<AsyncMutex<()>>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl SessionManager {
    /// Spawn the session actor. The session starts DISCONNECTED.
    pub fn spawn(
        upstream: UpstreamSettings,
        session: SessionSettings,
        client: Arc<dyn UpstreamClient>,
        violations: Arc<dyn ViolationSink>,
        pending: PendingRequests,
    ) -> Self {
        let (tx, rx) = mpsc::channel(session.command_buffer.max(1));
        let upstream = Arc::new(upstream);
        let next_request_id = Arc::new(AtomicI64::new(FIRST_REQUEST_ID));

        let actor = SessionActor {
            upstream: upstream.clone(),
            settings: session,
            client,
            violations,
            pending,
            commands: tx.downgrade(),
            next_request_id: next_request_id.clone(),
            state: SessionState::default(),
            heartbeat_at: None,
            data_at: None,
            connected_at: None,
            pending_connect: None,
            health_task: None,
            router_task: None,
        };
        let handle = tokio::spawn(actor.run(rx));

        Self {
            commands: tx,
            upstream,
            next_request_id,
            ensure_lock: Arc::new(AsyncMutex::new(())),
            task: Arc::new(parking_lot::Mutex::new(Some(handle))),
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> SessionResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::ActorStopped)?;
        rx.await.map_err(|_| SessionError::ActorStopped)
    }

    /// Open the session and wait up to the connect timeout for readiness.
    ///
    /// Returns false on timeout or transport failure; never errors.
    pub async fn connect(&self) -> bool {
        self.request(|reply| Command::Connect { reply })
            .await
            .unwrap_or(false)
    }

    /// Tear down the session and stop health monitoring
    pub async fn disconnect(&self) {
        if self.request(|reply| Command::Disconnect { reply }).await.is_err() {
            debug!("Disconnect requested after session actor stopped");
        }
    }

    /// True if connected, otherwise reconnect within the retry budget.
    ///
    /// The budget counts attempts since the last successful connection; see
    /// [`reset_retries`](Self::reset_retries).
    pub async fn ensure_connected(&self) -> bool {
        let _guard = self.ensure_lock.lock().await;
        loop {
            let state = match self.state().await {
                Ok(state) => state,
                Err(_) => return false,
            };
            if state.is_connected() {
                return true;
            }
            if state.retry_count >= self.upstream.max_retries {
                warn!(
                    retries = state.retry_count,
                    status = %state.status,
                    "Connection retries exhausted"
                );
                return false;
            }

            let attempt = state.retry_count + 1;
            let delay = self.upstream.reconnect_delay(attempt);
            if !delay.is_zero() {
                info!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                tokio::time::sleep(delay).await;
            }

            if self.commands.send(Command::CountRetry).await.is_err() {
                return false;
            }
            info!(attempt, max_retries = self.upstream.max_retries, "Connecting to upstream");
            if self.connect().await {
                return true;
            }
        }
    }

    /// Restore the full reconnect budget
    pub async fn reset_retries(&self) {
        let _ = self.commands.send(Command::ResetRetries).await;
    }

    /// Feed an upstream error callback into the session
    pub async fn on_error(&self, code: i32, message: impl Into<String>, category: Option<RateCategory>) {
        self.signals()
            .send(SessionSignal::Error {
                code,
                message: message.into(),
                category,
            })
            .await;
    }

    /// Run one health check now and return the resulting state
    pub async fn health_check(&self) -> SessionResult<SessionState> {
        self.request(|reply| Command::HealthCheck { reply: Some(reply) })
            .await
    }

    pub async fn state(&self) -> SessionResult<SessionState> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Current status; DISCONNECTED once the actor has stopped
    pub async fn status(&self) -> SessionStatus {
        self.state()
            .await
            .map(|s| s.status)
            .unwrap_or(SessionStatus::Disconnected)
    }

    /// Allocate the next upstream request id
    pub fn next_request_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn upstream_settings(&self) -> &UpstreamSettings {
        &self.upstream
    }

    pub fn signals(&self) -> SessionSignals {
        SessionSignals {
            commands: self.commands.clone(),
        }
    }

    /// Disconnect and stop the actor
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Session manager stopped");
    }
}

struct PendingConnect {
    waiters: Vec<oneshot::Sender<bool>>,
    deadline: Instant,
}

struct SessionActor {
    upstream: Arc<UpstreamSettings>,
    settings: SessionSettings,
    client: Arc<dyn UpstreamClient>,
    violations: Arc<dyn ViolationSink>,
    pending: PendingRequests,
    commands: mpsc::WeakSender<Command>,
    next_request_id: Arc<AtomicI64>,
    state: SessionState,
    heartbeat_at: Option<Instant>,
    data_at: Option<Instant>,
    connected_at: Option<Instant>,
    pending_connect: Option<PendingConnect>,
    health_task: Option<JoinHandle<()>>,
    router_task: Option<JoinHandle<()>>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.pending_connect.as_ref().map(|p| p.deadline);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.disconnect().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.connect_timed_out().await;
                }
            }
        }
        debug!("Session actor exited");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.connect(reply).await,
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::State { reply } => {
                let _ = reply.send(self.state.clone());
            }
            Command::HealthCheck { reply } => {
                self.health_check();
                if let Some(reply) = reply {
                    let _ = reply.send(self.state.clone());
                }
            }
            Command::CountRetry => self.state.retry_count += 1,
            Command::ResetRetries => self.state.retry_count = 0,
            Command::Signal(signal) => self.on_signal(signal).await,
            Command::Apply { signal, reply } => {
                self.on_signal(signal).await;
                let _ = reply.send(());
            }
            // Handled in run()
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn transition(&mut self, to: SessionStatus) {
        let from = self.state.status;
        if from != to {
            info!(%from, %to, "Session state change");
            self.state.status = to;
        }
    }

    async fn connect(&mut self, reply: oneshot::Sender<bool>) {
        match self.state.status {
            SessionStatus::Connected => {
                let _ = reply.send(true);
                return;
            }
            SessionStatus::Connecting => {
                match self.pending_connect.as_mut() {
                    Some(pending) => pending.waiters.push(reply),
                    None => {
                        let _ = reply.send(false);
                    }
                }
                return;
            }
            SessionStatus::Disconnected | SessionStatus::Error => {}
        }

        if self.state.status == SessionStatus::Error {
            // Drop whatever is left of the failed session before reconnecting
            self.close_transport().await;
        }
        self.transition(SessionStatus::Connecting);
        let deadline = Instant::now() + self.upstream.connect_timeout();
        let params = self.upstream.connect_params();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let result = tokio::time::timeout_at(deadline, self.client.connect(&params, events_tx)).await;
        match result {
            Ok(Ok(())) => {
                debug!(host = %params.host, port = params.port, client_id = params.client_id, "Transport open, awaiting session ready");
                self.start_router(events_rx);
                self.pending_connect = Some(PendingConnect {
                    waiters: vec![reply],
                    deadline,
                });
            }
            Ok(Err(e)) => {
                warn!(error = %e, host = %params.host, port = params.port, "Upstream connect failed");
                self.state.last_error_message = Some(e.to_string());
                self.transition(SessionStatus::Error);
                let _ = reply.send(false);
            }
            Err(_) => {
                warn!(host = %params.host, port = params.port, "Upstream connect timed out");
                self.state.last_error_message = Some("connect timed out".into());
                self.close_transport().await;
                self.transition(SessionStatus::Error);
                let _ = reply.send(false);
            }
        }
    }

    fn start_router(&mut self, events: mpsc::UnboundedReceiver<crate::upstream::UpstreamEvent>) {
        if let Some(old) = self.router_task.take() {
            old.abort();
        }
        if let Some(commands) = self.commands.upgrade() {
            let signals = SessionSignals { commands };
            self.router_task = Some(spawn_router(events, signals, self.pending.clone()));
        }
    }

    fn resolve_connect(&mut self, connected: bool) {
        if let Some(pending) = self.pending_connect.take() {
            for waiter in pending.waiters {
                let _ = waiter.send(connected);
            }
        }
    }

    async fn connect_timed_out(&mut self) {
        warn!(
            timeout_secs = self.upstream.connect_timeout_secs,
            "No session-ready signal before connect timeout"
        );
        self.state.last_error_message = Some("session ready timed out".into());
        self.close_transport().await;
        self.transition(SessionStatus::Error);
        self.resolve_connect(false);
    }

    async fn close_transport(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "Upstream disconnect failed");
        }
        if let Some(router) = self.router_task.take() {
            router.abort();
        }
    }

    /// Enter CONNECTED. A fresh session restarts `connected_since`; a restored
    /// one keeps it.
    fn mark_connected(&mut self, fresh: bool) {
        let now = Instant::now();
        self.transition(SessionStatus::Connected);
        self.touch_heartbeat();
        if fresh || self.connected_at.is_none() {
            self.connected_at = Some(now);
            self.state.connected_since = Some(Utc::now());
        }
        self.start_health_monitor();
        self.resolve_connect(true);
    }

    fn restored(&mut self) {
        if self.state.status == SessionStatus::Disconnected {
            debug!("Ignoring connectivity restore while disconnected");
            return;
        }
        self.mark_connected(false);
    }

    async fn disconnect(&mut self) {
        if let Some(health) = self.health_task.take() {
            health.abort();
        }
        self.resolve_connect(false);
        if self.state.status != SessionStatus::Disconnected {
            self.close_transport().await;
        }
        self.connected_at = None;
        self.state.connected_since = None;
        self.transition(SessionStatus::Disconnected);
    }

    fn start_health_monitor(&mut self) {
        if self.health_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let period = Duration::from_secs(self.settings.health_check_interval_secs.max(1));
        // Only a weak reference, so the monitor never keeps the actor alive
        let commands = commands.downgrade();

        self.health_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                if commands.send(Command::HealthCheck { reply: None }).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn health_check(&mut self) {
        let now = Instant::now();
        let heartbeat_timeout = Duration::from_secs(self.settings.heartbeat_timeout_secs);
        let staleness = Duration::from_secs(self.settings.data_staleness_secs);

        if self.state.status == SessionStatus::Connected {
            if let Some(last) = self.heartbeat_at.or(self.connected_at) {
                let silent = now.duration_since(last);
                if silent > heartbeat_timeout {
                    warn!(
                        silent_secs = silent.as_secs(),
                        timeout_secs = heartbeat_timeout.as_secs(),
                        "No heartbeat from upstream, marking session unhealthy"
                    );
                    self.state.last_error_message = Some("heartbeat timeout".into());
                    self.transition(SessionStatus::Error);
                }
            }
        }

        if let Some(last) = self.data_at.or(self.connected_at) {
            let silent = now.duration_since(last);
            if silent > staleness && !self.state.data_stale {
                warn!(
                    silent_secs = silent.as_secs(),
                    "No market data received recently"
                );
                self.state.data_stale = true;
            }
        }
    }

    fn touch_heartbeat(&mut self) {
        self.heartbeat_at = Some(Instant::now());
        self.state.last_heartbeat_at = Some(Utc::now());
    }

    async fn on_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Ready { next_valid_id } => {
                self.next_request_id.fetch_max(next_valid_id, Ordering::SeqCst);
                if self.state.status == SessionStatus::Connecting {
                    info!(next_valid_id, "Upstream session ready");
                    self.state.retry_count = 0;
                    self.mark_connected(true);
                } else {
                    debug!(status = %self.state.status, "Ignoring session-ready outside of connect");
                }
            }
            SessionSignal::Heartbeat => self.touch_heartbeat(),
            SessionSignal::Data => {
                self.touch_heartbeat();
                self.data_at = self.heartbeat_at;
                self.state.last_data_received_at = self.state.last_heartbeat_at;
                self.state.data_stale = false;
            }
            SessionSignal::Closed => match self.state.status {
                SessionStatus::Connecting => {
                    warn!("Upstream closed the connection during handshake");
                    self.state.last_error_message = Some("connection closed during handshake".into());
                    self.transition(SessionStatus::Error);
                    self.resolve_connect(false);
                }
                SessionStatus::Connected => {
                    warn!("Upstream closed the connection");
                    self.state.last_error_message = Some("connection closed".into());
                    self.transition(SessionStatus::Error);
                }
                _ => {}
            },
            SessionSignal::Error {
                code,
                message,
                category,
            } => self.on_error(code, message, category).await,
        }
    }

    async fn on_error(&mut self, code: i32, message: String, category: Option<RateCategory>) {
        let class = classify(code);
        self.state.error_count += 1;
        self.state.last_error_code = Some(code);
        self.state.last_error_message = Some(message.clone());
        metrics::SESSION_ERRORS_TOTAL
            .with_label_values(&[class.as_str()])
            .inc();

        match class {
            ErrorClass::RateViolation => {
                let category = category.unwrap_or(RateCategory::General);
                warn!(code, %category, %message, "Upstream reported rate violation");
                self.violations.record_violation(category).await;
            }
            ErrorClass::ConnectivityLost => {
                error!(code, %message, "Upstream connectivity lost");
                if matches!(self.state.status, SessionStatus::Connected | SessionStatus::Connecting) {
                    self.transition(SessionStatus::Error);
                    self.resolve_connect(false);
                }
            }
            ErrorClass::ConnectivityRestoredDataLost => {
                warn!(code, %message, "Upstream connectivity restored, subscriptions lost");
                self.restored();
            }
            ErrorClass::ConnectivityRestoredDataKept => {
                info!(code, %message, "Upstream connectivity restored");
                self.restored();
            }
            ErrorClass::SubscriptionIssue => {
                warn!(code, %message, "Market data subscription issue");
            }
            ErrorClass::Fatal => {
                error!(code, %message, "Upstream rejected request");
            }
            ErrorClass::Info => {
                debug!(code, %message, "Upstream status message");
            }
        }
    }
}
