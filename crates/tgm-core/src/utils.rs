use std::str::FromStr;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone};

// ============== Timestamp Helpers ==============

const ISO_LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Local naive ISO-8601 timestamp with microseconds.
///
/// This is the format session files on disk already use, e.g.
/// `2024-06-01T13:45:10.123456`.
pub fn iso_timestamp_local() -> String {
    format_local(Local::now())
}

pub fn format_local(at: DateTime<Local>) -> String {
    at.naive_local().format(ISO_LOCAL_FORMAT).to_string()
}

/// Parse an ISO-8601 timestamp into local time.
///
/// Accepts RFC 3339 with an offset, naive date-times (taken as local time,
/// fractional seconds optional) and bare dates (local midnight).
pub fn parse_iso_timestamp(raw: &str) -> Option<DateTime<Local>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Local));
    }

    let naive = NaiveDateTime::from_str(s)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;

    Local.from_local_datetime(&naive).earliest()
}

/// Whether `raw` parses and is no older than `max_age` relative to `now`.
///
/// Timestamps in the future count as within the window.
pub fn is_within_age(raw: &str, max_age: Duration, now: DateTime<Local>) -> bool {
    let Some(at) = parse_iso_timestamp(raw) else {
        return false;
    };
    now.signed_duration_since(at) <= max_age
}

/// Local midnight of today minus `days`.
///
/// `None` when the result falls outside chrono's representable range.
pub fn local_midnight_days_ago(days: u32, now: DateTime<Local>) -> Option<DateTime<Local>> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|n| Local.from_local_datetime(&n).earliest())
        .unwrap_or(now);
    Duration::try_days(i64::from(days)).and_then(|d| midnight.checked_sub_signed(d))
}

/// `H:MM:SS` rendering of a duration in seconds (negative clamps to zero).
pub fn format_hms(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    format!("{hours}:{minutes:02}:{secs:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_timestamps_parse_back() {
        let now = Local::now();
        let s = format_local(now);
        let back = parse_iso_timestamp(&s).unwrap();
        assert!((now - back).num_milliseconds().abs() < 1);
    }

    #[test]
    fn parses_common_iso_shapes() {
        assert!(parse_iso_timestamp("2024-01-01T00:00:00").is_some());
        assert!(parse_iso_timestamp("2024-01-01T00:00:00.5").is_some());
        assert!(parse_iso_timestamp("2024-01-01T00:00:00+02:00").is_some());
        assert!(parse_iso_timestamp("2024-01-01T00:00:00Z").is_some());
        assert!(parse_iso_timestamp("2024-01-01 08:30:00").is_some());
        assert!(parse_iso_timestamp("2024-01-01").is_some());
        assert!(parse_iso_timestamp("yesterday").is_none());
        assert!(parse_iso_timestamp("").is_none());
    }

    #[test]
    fn age_window() {
        let now = Local::now();
        let recent = format_local(now - Duration::minutes(30));
        let old = format_local(now - Duration::hours(2));
        let future = format_local(now + Duration::hours(3));

        assert!(is_within_age(&recent, Duration::hours(1), now));
        assert!(!is_within_age(&old, Duration::hours(1), now));
        assert!(is_within_age(&future, Duration::hours(1), now));
        assert!(!is_within_age("not a date", Duration::hours(1), now));
    }

    #[test]
    fn midnight_cutoff() {
        let now = Local::now();
        let today = local_midnight_days_ago(0, now).unwrap();
        assert_eq!(today.date_naive(), now.date_naive());
        assert_eq!(today.format("%H:%M:%S").to_string(), "00:00:00");

        let week = local_midnight_days_ago(7, now).unwrap();
        assert_eq!((today.date_naive() - week.date_naive()).num_days(), 7);

        assert!(local_midnight_days_ago(u32::MAX, now).is_none());
    }

    #[test]
    fn hms_formatting() {
        assert_eq!(format_hms(0.0), "0:00:00");
        assert_eq!(format_hms(3723.9), "1:02:03");
        assert_eq!(format_hms(-5.0), "0:00:00");
    }
}
