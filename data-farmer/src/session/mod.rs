//! Upstream session lifecycle
//!
//! - `classify`: error code table
//! - `state`: [`SessionStatus`], [`SessionState`], errors, the violation hook
//! - `manager`: the session actor and its [`SessionManager`] handle

mod classify;
mod manager;
mod state;

pub use classify::{classify, ErrorClass};
pub use manager::{SessionManager, SessionSignal, SessionSignals};
pub use state::*;
