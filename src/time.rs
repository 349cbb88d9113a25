//! GTFS time and calendar semantics.
//!
//! GTFS clock times are noon-relative signed offsets so a service day can be
//! anchored at local noon and frequency/arrival math stays simple arithmetic
//! across the DST discontinuity most services never cross.

use chrono::{DateTime, Duration, NaiveDate, TimeZone};
use std::collections::HashSet;

/// Parse a GTFS `H[H...]:MM:SS` time string (hours may exceed 23) into
/// signed seconds relative to service-day noon: `(H-12)*3600 + M*60 + S`.
pub fn parse_gtfs_time(s: &str) -> Option<i32> {
    let mut parts = s.split(':');
    let h: i32 = parts.next()?.parse().ok()?;
    let m: i32 = parts.next()?.parse().ok()?;
    let sec: i32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((h - 12) * 3600 + m * 60 + sec)
}

/// Parse a GTFS `YYYYMMDD` date string into a `NaiveDate`.
pub fn parse_gtfs_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[4..6].parse().ok()?;
    let day: u32 = s[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Anchor a local date at noon in `tz`, returned as an absolute instant.
pub fn noon_of<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<DateTime<Tz>> {
    let naive = date.and_hms_opt(12, 0, 0)?;
    tz.from_local_datetime(&naive).earliest()
}

/// A calendar service: weekday mask + date range + explicit exceptions.
///
/// `range` is `None` for services defined purely via `calendar_dates.txt`
/// (no `calendar.txt` row) — common in real-world feeds.
#[derive(Debug, Clone)]
pub struct Service {
    pub service_id: String,
    pub range: Option<(NaiveDate, NaiveDate)>,
    /// Bit per ISO weekday, index 0 = Monday .. 6 = Sunday.
    pub weekdays: [bool; 7],
    pub added_dates: HashSet<NaiveDate>,
    pub removed_dates: HashSet<NaiveDate>,
}

impl Service {
    /// `start_date <= d <= end_date AND d not in removed_dates AND (weekday
    /// bit set OR d in added_dates)`. The range check is unconditional — an
    /// added date outside `[start_date, end_date]` still does not validate
    /// (spec.md §3's formula), except when there is no `calendar.txt` row at
    /// all, in which case only the explicit exception lists apply.
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        if self.removed_dates.contains(&date) {
            return false;
        }
        match self.range {
            Some((start, end)) => {
                if date < start || date > end {
                    return false;
                }
                let idx = date.format("%u").to_string().parse::<usize>().unwrap_or(1) - 1;
                self.weekdays[idx] || self.added_dates.contains(&date)
            }
            None => self.added_dates.contains(&date),
        }
    }
}

/// Iterate local calendar days spanning `[start, end]` inclusive, one per day.
pub fn expand_days<Tz: TimeZone>(start: &DateTime<Tz>, end: &DateTime<Tz>) -> Vec<NaiveDate> {
    if start > end {
        return Vec::new();
    }
    let mut day = start.date_naive();
    let last = end.date_naive();
    let mut out = Vec::new();
    loop {
        out.push(day);
        if day >= last {
            break;
        }
        day = match day.succ_opt() {
            Some(d) => d,
            None => break,
        };
    }
    out
}

/// Default query end when unspecified: `start + 3 hours`.
pub fn default_window_end<Tz: TimeZone>(start: &DateTime<Tz>) -> DateTime<Tz> {
    start.clone() + Duration::hours(3)
}
