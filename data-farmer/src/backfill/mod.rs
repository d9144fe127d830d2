//! Historical backfill: chunk planning and the orchestrator

mod chunking;
mod orchestrator;

pub use chunking::{plan_chunks, Chunk};
pub use orchestrator::*;
