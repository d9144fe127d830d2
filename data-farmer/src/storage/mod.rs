//! Daily bar storage
//!
//! Writes are idempotent upserts keyed on `(symbol, date)`, so overlapping
//! backfills and duplicate upstream bars are harmless.

mod memory;
mod postgres;
mod traits;

pub use memory::InMemoryBarStore;
pub use postgres::PgBarStore;
pub use traits::*;
