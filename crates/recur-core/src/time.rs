//! Timestamp encoding shared by every table.
//!
//! All instants are stored as RFC 3339 UTC strings with a fixed nanosecond
//! precision (`2026-01-01T09:00:00.000000000Z`). Fixed width means SQLite's string
//! comparison orders them chronologically, which the due-schedule and
//! lock-expiry queries rely on.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn fmt_opt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(fmt_ts)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Directory-safe compact form used in artifact paths (`20260101T090000Z`).
pub fn compact_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_width_encoding_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(5);
        let c = a + chrono::Duration::days(400);
        let (sa, sb, sc) = (fmt_ts(a), fmt_ts(b), fmt_ts(c));
        assert_eq!(sa, "2026-01-01T09:00:00.000000000Z");
        assert!(sa < sb && sb < sc);
        assert_eq!(parse_ts(&sb).unwrap(), b);
    }

    #[test]
    fn compact_form_has_no_separators() {
        let a = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(compact_ts(a), "20260304T050607Z");
    }
}
