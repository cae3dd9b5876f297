use chrono::{Local, NaiveDate, TimeZone};

/// Portion of a recorded session that falls inside one local calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySegment {
    pub date: NaiveDate,
    pub start_sec: i64,
    pub end_sec: i64,
}

impl DailySegment {
    pub fn duration_secs(&self) -> i64 {
        self.end_sec - self.start_sec
    }
}

/// Splits `[start_ms, end_ms)` at the host's local midnights.
pub fn split_by_local_day(start_ms: i64, end_ms: i64) -> Vec<DailySegment> {
    split_by_day(&Local, start_ms, end_ms)
}

/// Splits `[start_ms, end_ms)` at midnights of `tz`.
///
/// Endpoints are floored to whole seconds and segments that become empty are
/// dropped, so the result never contains zero-length rows.
pub fn split_by_day<Tz: TimeZone>(tz: &Tz, start_ms: i64, end_ms: i64) -> Vec<DailySegment> {
    let mut segments = Vec::new();
    if end_ms <= start_ms {
        return segments;
    }

    let mut cursor = start_ms;
    while cursor < end_ms {
        let Some(cursor_at) = tz.timestamp_millis_opt(cursor).single() else {
            tracing::debug!(cursor, "timestamp outside representable range; stopping split");
            break;
        };
        let date = cursor_at.date_naive();
        let boundary = next_day_start_ms(tz, date)
            .filter(|boundary| *boundary > cursor)
            .unwrap_or(end_ms);
        let segment_end = end_ms.min(boundary);

        let start_sec = cursor.div_euclid(1000);
        let end_sec = segment_end.div_euclid(1000);
        if end_sec > start_sec {
            segments.push(DailySegment {
                date,
                start_sec,
                end_sec,
            });
        }
        cursor = segment_end;
    }

    segments
}

fn next_day_start_ms<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> Option<i64> {
    let next = date.succ_opt()?;
    // DST can skip local midnight; the day then starts at the first hour that exists.
    (0..24)
        .find_map(|hour| {
            let naive = next.and_hms_opt(hour, 0, 0)?;
            tz.from_local_datetime(&naive).earliest()
        })
        .map(|start| start.timestamp_millis())
}
