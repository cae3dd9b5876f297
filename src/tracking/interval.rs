//! Interval union used for every duration total in the store.
//!
//! Per-domain totals, the whole-day total and per-channel totals all go
//! through [`merge`], so overlapping browsing in two windows is counted once.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn duration(self) -> i64 {
        self.end - self.start
    }
}

impl From<[i64; 2]> for Interval {
    fn from(pair: [i64; 2]) -> Self {
        Self::new(pair[0], pair[1])
    }
}

/// Unit of the interval endpoints. Callers always say which one they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub merged: Vec<Interval>,
    /// Sum of merged run lengths, in the input unit.
    pub total: i64,
    pub unit: TimeUnit,
}

impl MergeResult {
    pub fn total_seconds(&self) -> i64 {
        match self.unit {
            TimeUnit::Seconds => self.total,
            TimeUnit::Milliseconds => self.total.div_euclid(1000),
        }
    }
}

/// Collapses possibly overlapping, unsorted intervals into sorted disjoint runs.
///
/// Touching endpoints are treated as contiguous. Intervals with `end < start`
/// break the interval invariant and are skipped.
pub fn merge(intervals: &[Interval], unit: TimeUnit) -> MergeResult {
    let mut sorted: Vec<Interval> = intervals
        .iter()
        .filter(|interval| interval.end >= interval.start)
        .copied()
        .collect();
    sorted.sort_by_key(|interval| (interval.start, interval.end));

    let mut merged: Vec<Interval> = Vec::with_capacity(sorted.len());
    for interval in sorted {
        if let Some(last) = merged.last_mut() {
            if interval.start <= last.end {
                last.end = last.end.max(interval.end);
                continue;
            }
        }
        merged.push(interval);
    }

    let total = merged.iter().map(|interval| interval.duration()).sum();
    MergeResult {
        merged,
        total,
        unit,
    }
}
