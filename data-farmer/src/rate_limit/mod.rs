//! Upstream pacing
//!
//! - `types`: categories, per-category limits, settings, usage snapshots
//! - `store`: the window store contract and key layout
//! - `memory` / `redis_store`: process-local and shared stores
//! - `limiter`: the [`RateLimiter`] every request goes through

mod limiter;
mod memory;
mod redis_store;
mod store;
mod types;

pub use limiter::{apply_jitter, backoff_duration, RateLimiter};
pub use memory::InMemoryWindowStore;
pub use redis_store::RedisWindowStore;
pub use store::{KeySpace, RateWindowStore};
pub use types::*;
