//! Consolidated error handling for the acquisition workspace.
//!
//! This module provides:
//! - Common error types that crate-level errors wrap with `#[from]`
//! - The `ErrorClassification` trait used to decide whether to retry
//!
//! # Usage
//!
//! ```rust,ignore
//! use market_common::error::{ErrorCategory, ErrorClassification};
//!
//! fn should_retry(err: &impl ErrorClassification, attempt: u32) -> bool {
//!     err.is_transient() && attempt < err.max_retries()
//! }
//! ```

mod common;
mod traits;

pub use common::*;
pub use traits::*;
