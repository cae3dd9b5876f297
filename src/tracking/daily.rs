use super::{
    day_split::DailySegment,
    interval::{Interval, TimeUnit, merge},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `key -> [[start_sec, end_sec], ...]` in Unix seconds.
///
/// Entries for the same key may overlap; overlaps are resolved when totals are
/// computed, never when appending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompactSessions(BTreeMap<String, Vec<[i64; 2]>>);

impl CompactSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: &str, start_sec: i64, end_sec: i64) {
        self.0
            .entry(key.to_string())
            .or_default()
            .push([start_sec, end_sec]);
    }

    pub fn get(&self, key: &str) -> Option<&[[i64; 2]]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<[i64; 2]>)> {
        self.0.iter()
    }

    /// Merged seconds per key plus the merged union across all keys.
    pub fn totals(&self) -> (BTreeMap<String, i64>, i64) {
        let mut per_key = BTreeMap::new();
        let mut everything = Vec::new();
        for (key, pairs) in &self.0 {
            let intervals: Vec<Interval> = pairs.iter().copied().map(Interval::from).collect();
            per_key.insert(key.clone(), merge(&intervals, TimeUnit::Seconds).total_seconds());
            everything.extend(intervals);
        }
        (per_key, merge(&everything, TimeUnit::Seconds).total_seconds())
    }

    /// Converts the pre-compact list format. Millisecond endpoints are floored
    /// to seconds; entries that collapse to nothing are dropped.
    pub fn from_legacy(entries: &[LegacySession]) -> Self {
        let mut sessions = Self::new();
        for entry in entries {
            let start_sec = entry.start_time.div_euclid(1000);
            let end_sec = entry.end_time.div_euclid(1000);
            if end_sec > start_sec {
                sessions.append(&entry.domain, start_sec, end_sec);
            }
        }
        sessions
    }
}

/// One element of the array-based session list older stores persisted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacySession {
    pub domain: String,
    pub start_time: i64,
    pub end_time: i64,
}

/// The `sessions` column as it may be found on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StoredSessions {
    Compact(CompactSessions),
    Legacy(Vec<LegacySession>),
}

impl StoredSessions {
    pub fn is_legacy(&self) -> bool {
        matches!(self, StoredSessions::Legacy(_))
    }

    pub fn into_compact(self) -> CompactSessions {
        match self {
            StoredSessions::Compact(sessions) => sessions,
            StoredSessions::Legacy(entries) => CompactSessions::from_legacy(&entries),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub date: NaiveDate,
    pub total_time: i64,
    pub sites: BTreeMap<String, i64>,
    pub visits: u64,
    pub blocked_attempts: u64,
    pub sessions: CompactSessions,
    #[serde(default)]
    pub channels: BTreeMap<String, i64>,
    #[serde(default)]
    pub channel_sessions: CompactSessions,
}

impl DailyStats {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            total_time: 0,
            sites: BTreeMap::new(),
            visits: 0,
            blocked_attempts: 0,
            sessions: CompactSessions::new(),
            channels: BTreeMap::new(),
            channel_sessions: CompactSessions::new(),
        }
    }

    /// Rebuilds every derived total from the interval maps.
    pub fn recompute(&mut self) {
        let (sites, total_time) = self.sessions.totals();
        let (channels, _) = self.channel_sessions.totals();
        self.sites = sites;
        self.total_time = total_time;
        self.channels = channels;
    }

    pub fn session_entries(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self
            .sessions
            .iter()
            .flat_map(|(domain, pairs)| {
                pairs.iter().map(move |[start, end]| SessionEntry {
                    domain: domain.clone(),
                    start_time: *start,
                    end_time: *end,
                    duration: end - start,
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        entries
    }

    pub fn domain_entries(&self, domain: &str) -> Vec<SessionEntry> {
        let mut entries: Vec<SessionEntry> = self
            .sessions
            .get(domain)
            .unwrap_or_default()
            .iter()
            .map(|[start, end]| SessionEntry {
                domain: domain.to_string(),
                start_time: *start,
                end_time: *end,
                duration: end - start,
            })
            .collect();
        entries.sort_by_key(|entry| entry.start_time);
        entries
    }
}

/// Expanded, display-oriented view of one stored interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub domain: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
}

/// Which interval map of a day a batch of segments is appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentTarget {
    Site,
    Channel,
}

/// Appends one recorded session's day segments into `days`.
///
/// A visit is counted once for the whole call, on the first segment's day,
/// and only for site sessions.
pub fn apply_segments(
    days: &mut BTreeMap<NaiveDate, DailyStats>,
    target: SegmentTarget,
    key: &str,
    segments: &[DailySegment],
) {
    for (index, segment) in segments.iter().enumerate() {
        let stats = days
            .entry(segment.date)
            .or_insert_with(|| DailyStats::new(segment.date));
        match target {
            SegmentTarget::Site => {
                stats
                    .sessions
                    .append(key, segment.start_sec, segment.end_sec);
                if index == 0 {
                    stats.visits += 1;
                }
            }
            SegmentTarget::Channel => {
                stats
                    .channel_sessions
                    .append(key, segment.start_sec, segment.end_sec);
            }
        }
        stats.recompute();
    }
}
