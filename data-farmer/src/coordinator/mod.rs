//! Request coordination: pending registry and the coordinator

mod request;
mod pending;

pub use request::*;
pub use pending::*;
