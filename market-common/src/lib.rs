// market-common: shared types for the acquisition engine
// Used by data-farmer and by any service that reads the stored daily bars

pub mod data;
pub mod error;
pub mod logging;
