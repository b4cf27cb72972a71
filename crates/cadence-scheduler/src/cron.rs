//! Cron expression handling.
//! Supports: "MIN HOUR DOM MON DOW" (5-field) and the 6/7-field form with
//! leading seconds (and trailing year) understood by the `cron` crate.
//! Example: "0 8 * * *" = every day at 8:00 UTC
//!
//! In the 5-field form day-of-week numbers are the classic ones (0 and 7 =
//! Sunday, 1 = Monday). They are rewritten to day names before parsing
//! because the `cron` crate counts from 1 = Sunday.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

/// Parse an expression into a schedule, accepting the classic 5-field form.
pub fn parse(expression: &str) -> Result<Schedule, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let dow = day_names(fields[4]).map_err(|e| format!("'{expression}': {e}"))?;
            format!("0 {} {dow}", fields[..4].join(" "))
        }
        6 | 7 => fields.join(" "),
        n => {
            return Err(format!(
                "'{expression}' has {n} fields (need 5: MIN HOUR DOM MON DOW)"
            ));
        }
    };
    Schedule::from_str(&normalized).map_err(|e| format!("'{expression}': {e}"))
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Rewrite a classic numeric day-of-week field as a list of day names.
/// Fields that are `*`, `?` or already use names pass through.
fn day_names(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }
    let number = |s: &str| -> Result<u32, String> {
        let n: u32 = s.parse().map_err(|_| format!("bad day-of-week '{s}'"))?;
        if n > 7 {
            return Err(format!("day-of-week {n} out of range 0-7"));
        }
        Ok(n)
    };

    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("bad step '{step}'"))?;
                if step == 0 {
                    return Err("step must be > 0".into());
                }
                (range, Some(step))
            }
            None => (part, None),
        };
        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (number(lo)?, number(hi)?)
        } else {
            let n = number(range)?;
            (n, if step.is_some() { 7 } else { n })
        };
        if lo > hi {
            return Err(format!("day-of-week range {lo}-{hi} is reversed"));
        }
        for day in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            days.insert(day % 7);
        }
    }
    Ok(days
        .into_iter()
        .map(|d| DAY_NAMES[d as usize])
        .collect::<Vec<_>>()
        .join(","))
}

/// Compute the first fire instant strictly after `after`.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match parse(expression) {
        Ok(schedule) => schedule.after(&after).next(),
        Err(e) => {
            tracing::warn!("Invalid cron expression {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};

    // 2026-02-21 is a Saturday, 2026-02-22 a Sunday.
    fn sunday_7am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, 7, 0, 0).unwrap()
    }

    #[test]
    fn test_monday_is_one() {
        let next = next_run_from_cron("0 8 * * 1", sunday_7am()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 23, 8, 0, 0).unwrap());
        assert_eq!(next.weekday(), Weekday::Mon);

        let next = next_run_from_cron("* * * * 1", sunday_7am()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 23, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_sunday_is_zero_or_seven() {
        for expr in ["0 8 * * 0", "0 8 * * 7"] {
            let next = next_run_from_cron(expr, sunday_7am()).unwrap();
            assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 22, 8, 0, 0).unwrap(), "{expr}");
        }
    }

    #[test]
    fn test_weekday_range_skips_weekend() {
        let saturday = Utc.with_ymd_and_hms(2026, 2, 21, 9, 0, 0).unwrap();
        let next = next_run_from_cron("0 8 * * 1-5", saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 23, 8, 0, 0).unwrap());

        let next = next_run_from_cron("0 8 * * 5-7", saturday).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_day_of_week_lists_steps_and_names() {
        assert_eq!(day_names("1,3,5").unwrap(), "Mon,Wed,Fri");
        assert_eq!(day_names("*/2").unwrap(), "Sun,Tue,Thu,Sat");
        assert_eq!(day_names("1-5/2").unwrap(), "Mon,Wed,Fri");
        assert_eq!(day_names("0-7").unwrap(), "Sun,Mon,Tue,Wed,Thu,Fri,Sat");
        assert_eq!(day_names("Mon-Fri").unwrap(), "Mon-Fri");
        assert_eq!(day_names("1/2").unwrap(), "Sun,Mon,Wed,Fri");
        assert!(day_names("8").is_err());
        assert!(day_names("5-1").is_err());
        assert!(parse("0 8 * * 9").is_err());
    }

    #[test]
    fn test_year_field_form() {
        let next = next_run_from_cron("0 0 12 1 1 * 2030", sunday_7am()).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_strictly_after_boundary() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 8, 0, 0).unwrap();
        let next = next_run_from_cron("0 8 * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 23, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_day_of_month_honoured() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 7, 0, 0).unwrap();
        let next = next_run_from_cron("30 6 1 * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 6, 30, 0).unwrap());
    }

    #[test]
    fn test_seconds_field_accepted() {
        assert!(parse("*/10 * * * * *").is_ok());
    }

    #[test]
    fn test_invalid_expression() {
        let after = Utc::now();
        assert!(next_run_from_cron("bad", after).is_none());
        assert!(parse("61 * * * *").is_err());
    }
}
