//! # Data Farmer
//!
//! Rate-governed acquisition of historical daily bars from an upstream
//! market-data session.
//!
//! ## Features
//!
//! - **Rate limiting**: Trailing-window admission per request category, shared
//!   across workers through Redis, with exponential lockouts after upstream
//!   pacing violations
//! - **Session management**: One actor owns the upstream connection state,
//!   monitors heartbeats and reconnects within a retry budget
//! - **Request coordination**: Admission, request-id allocation and
//!   coordinator-side timeouts for every upstream request
//! - **Backfill**: Gap detection against storage, chunked historical requests,
//!   per-bar validation and idempotent upserts, with batch runs that survive
//!   individual failures
//!
//! ## Architecture
//!
//! The [`engine::AcquisitionEngine`] wires a [`rate_limit::RateLimiter`], a
//! [`session::SessionManager`], a [`coordinator::RequestCoordinator`] and a
//! [`backfill::BackfillOrchestrator`] around an [`upstream::UpstreamClient`]
//! and a [`storage::BarStore`]. The upstream wire protocol lives behind the
//! client trait; [`upstream::MockUpstream`] stands in for it in tests.

pub mod backfill;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod metrics;
pub mod rate_limit;
pub mod session;
pub mod storage;
pub mod upstream;

// Re-export commonly used types
pub use backfill::{BackfillError, BackfillOrchestrator, BackfillResult};
pub use config::Settings;
pub use coordinator::{CoordinatorError, CoordinatorResult, RequestCoordinator};
pub use engine::{AcquisitionEngine, ConnectionStatus, EngineError};
pub use rate_limit::{RateCategory, RateLimiter, UsageSnapshot};
pub use session::{SessionManager, SessionState, SessionStatus};
pub use storage::{BarStore, InMemoryBarStore, PgBarStore, StorageError};
pub use upstream::{UpstreamClient, UpstreamError, UpstreamEvent};
