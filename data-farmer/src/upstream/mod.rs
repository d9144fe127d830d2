//! Upstream broker API boundary
//!
//! The client contract, the request and event types it speaks, the router
//! that fans events out to the session and to waiting requests, and a
//! scriptable mock.

pub mod mock;
mod router;
mod traits;
mod types;

pub use mock::{ConnectBehavior, MockResponse, MockUpstream};
pub use router::spawn_router;
pub use traits::*;
pub use types::*;
