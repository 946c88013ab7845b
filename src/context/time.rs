//! Best-effort timestamp resolution.
//!
//! Forges disagree on timestamp formats (GitLab alone sends both RFC 3339 and
//! `2024-01-01 10:00:00 UTC`), so every format seen in the wild is tried in
//! turn.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use tracing::warn;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%d %H:%M:%S UTC",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%dT%H:%M:%S%z"];

/// Resolves a raw timestamp to UTC.
///
/// Returns `None` for an empty string. An unparseable non-empty string is
/// logged and resolves to the current time, so it sorts after everything
/// with a real timestamp.
pub fn resolve_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(t) = DateTime::parse_from_str(raw, format) {
            return Some(t.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(t.and_utc());
        }
    }
    warn!(timestamp = raw, "Failed to parse timestamp, using current time");
    Some(Utc::now())
}

/// Canonical rendering used in timeline lines.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn parses_known_formats() {
        let expected = utc(10, 30, 0);
        for raw in [
            "2024-03-01T10:30:00Z",
            "2024-03-01T10:30:00.000Z",
            "2024-03-01T12:30:00+02:00",
            "2024-03-01 10:30:00 UTC",
            "2024-03-01 11:30:00 +0100",
            "2024-03-01 10:30:00",
            "2024-03-01T10:30:00",
        ] {
            assert_eq!(resolve_timestamp(raw), Some(expected), "format {raw}");
        }
    }

    #[test]
    fn empty_is_none() {
        assert_eq!(resolve_timestamp(""), None);
        assert_eq!(resolve_timestamp("   "), None);
    }

    #[test]
    fn garbage_resolves_to_now() {
        let before = Utc::now();
        let t = resolve_timestamp("yesterday-ish").unwrap();
        assert!(t >= before);
    }

    #[test]
    fn format_is_rfc3339_seconds() {
        assert_eq!(format_timestamp(utc(9, 5, 7)), "2024-03-01T09:05:07Z");
    }
}
