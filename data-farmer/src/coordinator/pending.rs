//! In-flight request registry
//!
//! Maps upstream request ids to the channel of the caller awaiting the result.
//! The event router delivers into it; the coordinator registers and removes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::metrics;
use crate::rate_limit::RateCategory;
use crate::upstream::RawBar;

/// Request-scoped event forwarded to the waiting caller
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    Bar(RawBar),
    End,
    Error { code: i32, message: String },
}

/// An admitted request awaiting completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: i64,
    pub category: RateCategory,
    pub symbol: String,
    pub submitted_at: DateTime<Utc>,
}

struct Entry {
    info: PendingRequest,
    tx: mpsc::UnboundedSender<RequestEvent>,
}

#[derive(Clone, Default)]
pub struct PendingRequests {
    entries: Arc<DashMap<i64, Entry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and return the receiver for its events
    pub fn register(&self, info: PendingRequest) -> mpsc::UnboundedReceiver<RequestEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.insert(info.request_id, Entry { info, tx });
        metrics::PENDING_REQUESTS.set(self.entries.len() as i64);
        rx
    }

    pub fn remove(&self, request_id: i64) -> Option<PendingRequest> {
        let removed = self.entries.remove(&request_id).map(|(_, entry)| entry.info);
        metrics::PENDING_REQUESTS.set(self.entries.len() as i64);
        removed
    }

    /// Forward an event to the request's caller; false if the request is unknown
    pub fn deliver(&self, request_id: i64, event: RequestEvent) -> bool {
        match self.entries.get(&request_id) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Forward an event to every pending request; returns how many received it
    pub fn broadcast(&self, event: RequestEvent) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.tx.send(event.clone()).is_ok())
            .count()
    }

    pub fn category_of(&self, request_id: i64) -> Option<RateCategory> {
        self.entries.get(&request_id).map(|entry| entry.info.category)
    }

    pub fn contains(&self, request_id: i64) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending requests ordered by id
    pub fn snapshot(&self) -> Vec<PendingRequest> {
        let mut all: Vec<PendingRequest> = self.entries.iter().map(|e| e.info.clone()).collect();
        all.sort_by_key(|p| p.request_id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(request_id: i64, category: RateCategory) -> PendingRequest {
        PendingRequest {
            request_id,
            category,
            symbol: "BHP".into(),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_deliver_remove() {
        let pending = PendingRequests::new();
        let mut rx = pending.register(info(1000, RateCategory::Historical));

        assert!(pending.deliver(1000, RequestEvent::End));
        assert_eq!(rx.recv().await, Some(RequestEvent::End));
        assert_eq!(pending.category_of(1000), Some(RateCategory::Historical));

        let removed = pending.remove(1000).unwrap();
        assert_eq!(removed.request_id, 1000);
        assert!(!pending.deliver(1000, RequestEvent::End));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all() {
        let pending = PendingRequests::new();
        let mut a = pending.register(info(1, RateCategory::Historical));
        let mut b = pending.register(info(2, RateCategory::General));

        let event = RequestEvent::Error {
            code: 1100,
            message: "lost".into(),
        };
        assert_eq!(pending.broadcast(event.clone()), 2);
        assert_eq!(a.recv().await, Some(event.clone()));
        assert_eq!(b.recv().await, Some(event));
        assert_eq!(
            pending.snapshot().iter().map(|p| p.request_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
