pub mod backfill;
pub mod gap_detection;
pub mod types;
pub mod validator;

pub use backfill::{BackfillProgress, BackfillStats, BackfillSummary, BulkBackfillReport, DateGap};
pub use gap_detection::{compute_gaps, is_weekday, weekdays_between, GapDetector};
pub use types::DailyBar;
pub use validator::{BarValidationError, BarValidator, BarValidatorConfig};
