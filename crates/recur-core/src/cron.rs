//! Cron expressions evaluated against IANA timezones.
//!
//! Accepts standard 5-field Unix expressions (minute, hour, day-of-month,
//! month, day-of-week) as well as 6/7-field expressions with a leading
//! seconds field. The `cron` crate wants seconds first and numbers
//! days-of-week 1-7 starting on Sunday, so numeric day-of-week values are
//! shifted from the Unix 0-6 (Sunday = 0, 7 also Sunday) convention.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let normalized = normalize(expression)?;
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| format!("invalid cron expression '{expression}': {e}"))?;
        Ok(Self { schedule })
    }

    /// First fire time strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        self.schedule
            .after(&local)
            .map(|dt| dt.with_timezone(&Utc))
            .find(|dt| *dt > after)
    }

    /// First fire time at or after `at`.
    pub fn next_at_or_after(&self, at: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        self.next_after(at - chrono::Duration::milliseconds(1), tz)
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| format!("unknown IANA timezone '{name}'"))
}

fn normalize(expression: &str) -> Result<String, String> {
    let mut fields: Vec<String> = expression.split_whitespace().map(String::from).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => {
            return Err(format!(
                "cron expression '{expression}' has {n} fields, expected 5, 6 or 7"
            ))
        }
    }
    fields[5] = translate_day_of_week(&fields[5])?;
    Ok(fields.join(" "))
}

/// Shift numeric Unix day-of-week values (0-7) to the 1-7 Sunday-first scale.
/// Names (`MON-FRI`) and `*` pass through untouched.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (part, None),
        };
        if let Some(days) = stepped_days(range, step)? {
            parts.push(days);
            continue;
        }
        let translated = match range.split_once('-') {
            Some((a, b)) => match (shift_dow(a)?, b.parse::<u8>().ok()) {
                // `5-7` is Friday through Sunday: split across the week boundary.
                (Some(start), Some(7)) if start > 1 => format!("{start}-7,1"),
                (Some(_), Some(7)) => "1-7".to_string(),
                (Some(start), Some(_)) => match shift_dow(b)? {
                    Some(end) => format!("{start}-{end}"),
                    None => format!("{start}-{b}"),
                },
                _ => range.to_string(),
            },
            None => match shift_dow(range)? {
                Some(day) => day.to_string(),
                None => range.to_string(),
            },
        };
        match step {
            Some(step) => parts.push(format!("{translated}/{step}")),
            None => parts.push(translated),
        }
    }
    Ok(parts.join(","))
}

/// Expand a stepped numeric range (`1-7/2`, or `1/2` meaning `1-7/2`) into
/// explicit shifted days, so a range crossing Sunday keeps its step.
/// Returns `None` for anything that is not numeric with a step.
fn stepped_days(range: &str, step: Option<&str>) -> Result<Option<String>, String> {
    let Some(step) = step else {
        return Ok(None);
    };
    let (first, last) = match range.split_once('-') {
        Some((a, b)) => (a, b),
        None => (range, "7"),
    };
    let (Ok(first), Ok(last)) = (first.parse::<u8>(), last.parse::<u8>()) else {
        return Ok(None);
    };
    let step = match step.parse::<u8>() {
        Ok(n) if n > 0 => n,
        _ => return Err(format!("invalid day-of-week step '{step}'")),
    };
    if first > last {
        return Err(format!("day-of-week range {first}-{last} is reversed"));
    }
    let mut days: Vec<u8> = Vec::new();
    for n in (first..=last).step_by(step as usize) {
        if let Some(day) = shift_dow(&n.to_string())? {
            if !days.contains(&day) {
                days.push(day);
            }
        }
    }
    Ok(Some(
        days.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(","),
    ))
}

fn shift_dow(token: &str) -> Result<Option<u8>, String> {
    match token.parse::<u8>() {
        Ok(n) if n <= 7 => Ok(Some(n % 7 + 1)),
        Ok(n) => Err(format!("day-of-week {n} out of range 0-7")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize("0 * * * *").unwrap(), "0 0 * * * *");
        assert_eq!(normalize("0 0 * * * *").unwrap(), "0 0 * * * *");
        assert!(normalize("* * *").is_err());
    }

    #[test]
    fn unix_day_of_week_numbers_are_shifted() {
        assert_eq!(translate_day_of_week("1-5").unwrap(), "2-6");
        assert_eq!(translate_day_of_week("0").unwrap(), "1");
        assert_eq!(translate_day_of_week("7").unwrap(), "1");
        assert_eq!(translate_day_of_week("5-7").unwrap(), "6-7,1");
        assert_eq!(translate_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(translate_day_of_week("*/2").unwrap(), "*/2");
        assert!(translate_day_of_week("9").is_err());
    }

    #[test]
    fn stepped_ranges_keep_their_step_across_sunday() {
        assert_eq!(translate_day_of_week("1-7/2").unwrap(), "2,4,6,1");
        assert_eq!(translate_day_of_week("5-7/2").unwrap(), "6,1");
        assert_eq!(translate_day_of_week("1-5/2").unwrap(), "2,4,6");
        assert_eq!(translate_day_of_week("0-7/7").unwrap(), "1");
        assert_eq!(translate_day_of_week("1/3").unwrap(), "2,5,1");
        assert!(translate_day_of_week("1-7/0").is_err());
        assert!(translate_day_of_week("6-2/2").is_err());
    }

    #[test]
    fn every_other_day_from_monday_never_fires_on_tuesday() {
        let cron = CronSchedule::parse("0 9 * * 1-7/2").unwrap();
        // Thursday 2026-01-01
        let mut at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut fired = Vec::new();
        for _ in 0..8 {
            at = cron.next_after(at, Tz::UTC).unwrap();
            fired.push(at.weekday());
        }
        assert_eq!(
            fired,
            [
                Weekday::Fri,
                Weekday::Sun,
                Weekday::Mon,
                Weekday::Wed,
                Weekday::Fri,
                Weekday::Sun,
                Weekday::Mon,
                Weekday::Wed,
            ]
        );
    }

    #[test]
    fn weekday_expression_skips_the_weekend() {
        let cron = CronSchedule::parse("30 9 * * 1-5").unwrap();
        // Saturday 2026-01-03 10:00 UTC
        let sat = Utc.with_ymd_and_hms(2026, 1, 3, 10, 0, 0).unwrap();
        let next = cron.next_after(sat, Tz::UTC).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!((next.hour(), next.minute()), (9, 30));
    }

    #[test]
    fn next_after_is_strictly_after() {
        let cron = CronSchedule::parse("0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2026, 1, 1, 5, 0, 0).unwrap();
        let next = cron.next_after(on_the_hour, Tz::UTC).unwrap();
        assert_eq!(next, on_the_hour + chrono::Duration::hours(1));
        assert_eq!(cron.next_at_or_after(on_the_hour, Tz::UTC).unwrap(), on_the_hour);
    }

    #[test]
    fn evaluates_in_the_job_timezone() {
        let cron = CronSchedule::parse("0 9 * * *").unwrap();
        let tz = parse_timezone("America/New_York").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let next = cron.next_after(from, tz).unwrap();
        // 09:00 EST is 14:00 UTC in January.
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 15, 14, 0, 0).unwrap());
    }

    #[test]
    fn rejects_unknown_timezones() {
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
        assert!(parse_timezone("Europe/Rome").is_ok());
    }
}
