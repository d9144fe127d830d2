//! Splitting date ranges into upstream-sized requests

use chrono::{Duration as ChronoDuration, NaiveDate};
use market_common::data::{weekdays_between, DateGap};
use serde::{Deserialize, Serialize};

use crate::upstream::DurationDescriptor;

/// One historical request's worth of dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub start: NaiveDate,
    /// Request end date
    pub end: NaiveDate,
    /// Covers at least `start..=end` counting back from `end`
    pub duration: DurationDescriptor,
}

impl Chunk {
    pub fn calendar_days(&self) -> u32 {
        ((self.end - self.start).num_days() + 1) as u32
    }

    /// Weekdays in the chunk, i.e. the bars it should yield at most
    pub fn expected_bars(&self) -> u64 {
        weekdays_between(self.start, self.end).count() as u64
    }

    /// Whether a returned bar belongs to this chunk. Rounded-up durations
    /// reach before `start`.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Split a range into ascending chunks of at most `max_chunk_days` calendar days
pub fn plan_chunks(range: DateGap, max_chunk_days: u32) -> Vec<Chunk> {
    let max_chunk_days = max_chunk_days.max(1) as i64;
    let mut chunks = Vec::new();
    let mut start = range.start;

    while start <= range.end {
        let end = (start + ChronoDuration::days(max_chunk_days - 1)).min(range.end);
        let days = ((end - start).num_days() + 1) as u32;
        chunks.push(Chunk {
            start,
            end,
            duration: DurationDescriptor::for_days(days),
        });
        start = end + ChronoDuration::days(1);
    }
    chunks
}
