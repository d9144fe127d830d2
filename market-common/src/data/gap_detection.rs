//! Missing-date detection for daily bars
//!
//! Daily bars exist only on weekdays. Given the dates already persisted for a
//! symbol, [`compute_gaps`] returns the weekday ranges still to be fetched.
//! Exchange holidays are not modelled; a holiday shows up as a one-day gap
//! and the upstream simply returns no bar for it.
//!
//! ```
//! use std::collections::BTreeSet;
//! use chrono::NaiveDate;
//! use market_common::data::compute_gaps;
//!
//! let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
//! let existing: BTreeSet<_> = [d(2), d(3)].into_iter().collect();
//!
//! let gaps = compute_gaps(&existing, d(1), d(5));
//! assert_eq!(gaps.len(), 2);
//! assert_eq!((gaps[0].start, gaps[0].end), (d(1), d(1)));
//! assert_eq!((gaps[1].start, gaps[1].end), (d(4), d(5)));
//! ```

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::collections::BTreeSet;

use super::backfill::DateGap;

/// Whether the date falls Monday..=Friday
pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Iterate the weekdays in `[start, end]` in ascending order.
///
/// Yields nothing when `start > end`.
pub fn weekdays_between(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start
        .iter_days()
        .take_while(move |d| *d <= end)
        .filter(|d| is_weekday(*d))
}

/// Compute the missing weekday ranges in `[start, end]`.
///
/// Result is sorted ascending and pairwise disjoint. Ranges join on calendar
/// adjacency only, so consecutive gaps are separated either by an existing
/// weekday or by a weekend. Dates in `existing` outside the range are ignored.
pub fn compute_gaps(existing: &BTreeSet<NaiveDate>, start: NaiveDate, end: NaiveDate) -> Vec<DateGap> {
    let mut gaps: Vec<DateGap> = Vec::new();

    for date in weekdays_between(start, end).filter(|d| !existing.contains(d)) {
        match gaps.last_mut() {
            Some(last) if date - last.end == Duration::days(1) => last.end = date,
            _ => gaps.push(DateGap::single(date)),
        }
    }

    gaps
}

/// Helpers over lists of gaps
pub struct GapDetector;

impl GapDetector {
    /// Merge overlapping or calendar-adjacent gaps
    pub fn merge_gaps(gaps: &[DateGap]) -> Vec<DateGap> {
        let mut sorted = gaps.to_vec();
        sorted.sort();

        let mut merged: Vec<DateGap> = Vec::with_capacity(sorted.len());
        for gap in sorted {
            if let Some(last) = merged.last_mut() {
                if gap.start <= last.end + Duration::days(1) {
                    last.end = last.end.max(gap.end);
                    continue;
                }
            }
            merged.push(gap);
        }
        merged
    }

    /// Total weekdays across all gaps
    pub fn total_days(gaps: &[DateGap]) -> u64 {
        gaps.iter().map(DateGap::weekday_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn set(dates: &[NaiveDate]) -> BTreeSet<NaiveDate> {
        dates.iter().copied().collect()
    }

    #[test]
    fn test_gaps_at_start_and_end() {
        // Mon 2024-01-01 .. Fri 2024-01-05
        let existing = set(&[d(2024, 1, 2), d(2024, 1, 3)]);
        let gaps = compute_gaps(&existing, d(2024, 1, 1), d(2024, 1, 5));
        assert_eq!(
            gaps,
            vec![
                DateGap::new(d(2024, 1, 1), d(2024, 1, 1)),
                DateGap::new(d(2024, 1, 4), d(2024, 1, 5)),
            ]
        );
    }

    #[test]
    fn test_empty_existing_is_split_by_weekends() {
        // Wed 2024-01-03 .. Wed 2024-01-10
        let gaps = compute_gaps(&BTreeSet::new(), d(2024, 1, 3), d(2024, 1, 10));
        assert_eq!(
            gaps,
            vec![
                DateGap::new(d(2024, 1, 3), d(2024, 1, 5)),
                DateGap::new(d(2024, 1, 8), d(2024, 1, 10)),
            ]
        );
    }

    #[test]
    fn test_fully_covered_range() {
        let existing: BTreeSet<_> = weekdays_between(d(2024, 3, 1), d(2024, 3, 31)).collect();
        assert!(compute_gaps(&existing, d(2024, 3, 1), d(2024, 3, 31)).is_empty());
    }

    #[test]
    fn test_weekend_only_range_has_no_gaps() {
        // Sat 2024-01-06 .. Sun 2024-01-07
        assert!(compute_gaps(&BTreeSet::new(), d(2024, 1, 6), d(2024, 1, 7)).is_empty());
    }

    #[test]
    fn test_inverted_range_is_empty() {
        assert!(compute_gaps(&BTreeSet::new(), d(2024, 1, 5), d(2024, 1, 1)).is_empty());
    }

    #[test]
    fn test_gap_properties_hold() {
        // Sparse coverage over a quarter
        let existing: BTreeSet<_> = weekdays_between(d(2024, 1, 1), d(2024, 3, 31))
            .enumerate()
            .filter(|(i, _)| i % 7 == 0 || i % 11 == 3)
            .map(|(_, date)| date)
            .collect();
        let (start, end) = (d(2024, 1, 1), d(2024, 3, 31));
        let gaps = compute_gaps(&existing, start, end);

        // Coverage: every weekday is either existing or inside a gap
        for date in weekdays_between(start, end) {
            assert!(existing.contains(&date) || gaps.iter().any(|g| g.contains(date)));
        }

        // Gaps never contain existing dates
        for gap in &gaps {
            for date in weekdays_between(gap.start, gap.end) {
                assert!(!existing.contains(&date));
            }
        }

        // Sorted and disjoint; neighbours never touch, and only an existing
        // weekday or a weekend lies between them
        for pair in gaps.windows(2) {
            assert!(pair[1].start - pair[0].end > Duration::days(1));
            let between: Vec<_> =
                weekdays_between(pair[0].end + Duration::days(1), pair[1].start - Duration::days(1)).collect();
            assert!(between.is_empty() || between.iter().any(|date| existing.contains(date)));
        }
    }

    #[test]
    fn test_merge_adjacent_gaps() {
        let gaps = vec![
            DateGap::new(d(2024, 1, 8), d(2024, 1, 9)),
            DateGap::new(d(2024, 1, 1), d(2024, 1, 3)),
            DateGap::new(d(2024, 1, 4), d(2024, 1, 5)),
            DateGap::new(d(2024, 1, 15), d(2024, 1, 16)),
        ];
        let merged = GapDetector::merge_gaps(&gaps);
        assert_eq!(
            merged,
            vec![
                DateGap::new(d(2024, 1, 1), d(2024, 1, 5)),
                DateGap::new(d(2024, 1, 8), d(2024, 1, 9)),
                DateGap::new(d(2024, 1, 15), d(2024, 1, 16)),
            ]
        );
        assert_eq!(GapDetector::total_days(&merged), 9);
    }
}
