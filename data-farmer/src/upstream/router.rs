//! Upstream event router
//!
//! Consumes the event stream of one upstream connection. Session-level events
//! become [`SessionSignal`]s; request-level events go to the channel of the
//! request that owns them.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::types::UpstreamEvent;
use crate::coordinator::{PendingRequests, RequestEvent};
use crate::session::{classify, ErrorClass, SessionSignal, SessionSignals};

/// Upstream "no request" id
const NO_REQUEST: i64 = -1;

/// Route events until the upstream drops its sender or the session stops
pub fn spawn_router(
    mut events: mpsc::UnboundedReceiver<UpstreamEvent>,
    session: SessionSignals,
    pending: PendingRequests,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !route(event, &session, &pending).await {
                break;
            }
        }
        debug!("Upstream event stream ended");
    })
}

/// Route one event; false once the session is gone
async fn route(event: UpstreamEvent, session: &SessionSignals, pending: &PendingRequests) -> bool {
    match event {
        UpstreamEvent::SessionReady { next_valid_id } => {
            session.send(SessionSignal::Ready { next_valid_id }).await
        }
        UpstreamEvent::Heartbeat => session.send(SessionSignal::Heartbeat).await,
        UpstreamEvent::ConnectionClosed => session.send(SessionSignal::Closed).await,
        UpstreamEvent::HistoricalBar { request_id, bar } => {
            if !pending.deliver(request_id, RequestEvent::Bar(bar)) {
                trace!(request_id, "Bar for unknown or finished request");
            }
            session.send(SessionSignal::Data).await
        }
        UpstreamEvent::HistoricalEnd { request_id } => {
            if !pending.deliver(request_id, RequestEvent::End) {
                trace!(request_id, "End marker for unknown or finished request");
            }
            session.send(SessionSignal::Heartbeat).await
        }
        UpstreamEvent::Error {
            request_id,
            code,
            message,
        } => {
            let request_id = request_id.filter(|id| *id != NO_REQUEST);
            let class = classify(code);
            let category = request_id.and_then(|id| pending.category_of(id));

            // Session first, so a violation lockout is in place before the caller sees the error
            let alive = session
                .apply(SessionSignal::Error {
                    code,
                    message: message.clone(),
                    category,
                })
                .await;

            let event = RequestEvent::Error { code, message };
            match request_id {
                Some(id) if class.fails_request() => {
                    pending.deliver(id, event);
                }
                None if class == ErrorClass::ConnectivityLost => {
                    let failed = pending.broadcast(event);
                    if failed > 0 {
                        debug!(failed, "Failed in-flight requests after connectivity loss");
                    }
                }
                _ => {}
            }
            alive
        }
    }
}
