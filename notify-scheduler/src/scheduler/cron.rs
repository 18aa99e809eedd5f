//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, each field accepting `*`,
//! `?` (day fields), single values, `A-B` ranges, `/N` steps and comma lists.
//! Months accept `JAN`..`DEC`, weekdays `SUN`..`SAT` with `0` and `7` both
//! meaning Sunday. The `@hourly`, `@daily`/`@midnight`, `@weekly`,
//! `@monthly` and `@yearly`/`@annually` shortcuts are also accepted.
//!
//! Fields are normalized to explicit value lists and evaluated by the `cron`
//! crate with the seconds field pinned to 0. When both day fields are
//! restricted, a day matching either one fires, as in classic cron.
//! Expressions that can never fire are rejected.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::{Error, Result};

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of `names[0]`.
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_base: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    names_base: 0,
};

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    /// One schedule, or two when both day fields are restricted.
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(invalid(format!("unknown shortcut '{trimmed}'")));
            }
            _ => trimmed,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let minute = parse_field(fields[0], MINUTE).map_err(&invalid)?;
        let hour = parse_field(fields[1], HOUR).map_err(&invalid)?;
        let dom = parse_field(fields[2], DAY_OF_MONTH).map_err(&invalid)?;
        let month = parse_field(fields[3], MONTH).map_err(&invalid)?;
        let dow = parse_field(fields[4], DAY_OF_WEEK).map_err(&invalid)?;

        let build = |dom: &FieldValues, dow: &FieldValues| {
            let normalized = format!(
                "0 {} {} {} {} {}",
                render_numeric(&minute),
                render_numeric(&hour),
                render_numeric(dom),
                render_numeric(&month),
                render_weekdays(dow),
            );
            cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
        };

        let schedules = if dom.is_some() && dow.is_some() {
            vec![build(&dom, &None)?, build(&None, &dow)?]
        } else {
            vec![build(&dom, &dow)?]
        };

        let parsed = Self {
            expression: trimmed.to_string(),
            schedules,
        };
        if parsed.next_after(Utc::now(), Tz::UTC).is_none() {
            return Err(invalid("expression never fires".to_string()));
        }
        Ok(parsed)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = tz.from_utc_datetime(&after.naive_utc());
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&local).next())
            .min()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Up to `count` upcoming occurrences after `after`, in order.
    pub fn upcoming(&self, after: DateTime<Utc>, tz: Tz, count: usize) -> Vec<DateTime<Utc>> {
        let local = tz.from_utc_datetime(&after.naive_utc());
        let merged: BTreeSet<DateTime<Utc>> = self
            .schedules
            .iter()
            .flat_map(|schedule| {
                schedule
                    .after(&local)
                    .take(count)
                    .map(|dt| dt.with_timezone(&Utc))
            })
            .collect();
        merged.into_iter().take(count).collect()
    }
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parsed field: `None` means "every value".
type FieldValues = Option<BTreeSet<u32>>;

fn parse_field(raw: &str, spec: FieldSpec) -> std::result::Result<FieldValues, String> {
    let is_weekday = spec.name == DAY_OF_WEEK.name;
    if raw == "*" || (raw == "?" && (is_weekday || spec.name == DAY_OF_MONTH.name)) {
        return Ok(None);
    }

    let mut values = BTreeSet::new();
    for part in raw.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `A/N` runs from A to the end of the field.
            (value, if step.is_some() { spec.max } else { value })
        };

        if start > end {
            return Err(format!("range {start}-{end} is reversed in {} field", spec.name));
        }

        let mut value = start;
        while value <= end {
            values.insert(value);
            value += step.unwrap_or(1);
        }
    }

    if is_weekday && values.remove(&7) {
        values.insert(0);
    }

    let full = if is_weekday {
        7
    } else {
        (spec.max - spec.min + 1) as usize
    };
    if values.len() == full {
        return Ok(None);
    }
    Ok(Some(values))
}

fn parse_value(raw: &str, spec: FieldSpec) -> std::result::Result<u32, String> {
    let upper = raw.to_ascii_uppercase();
    if let Some(index) = spec.names.iter().position(|n| *n == upper) {
        return Ok(spec.names_base + index as u32);
    }
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value '{raw}' in {} field", spec.name))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "value {value} out of range {}-{} in {} field",
            spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

fn render_numeric(values: &FieldValues) -> String {
    match values {
        None => "*".to_string(),
        Some(values) => values
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(","),
    }
}

fn render_weekdays(values: &FieldValues) -> String {
    match values {
        None => "*".to_string(),
        Some(values) => values
            .iter()
            .map(|&v| WEEKDAY_NAMES[v as usize % 7])
            .collect::<Vec<_>>()
            .join(","),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_five_minutes() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let next = schedule.next_after(utc(2026, 1, 1, 10, 2), Tz::UTC).unwrap();
        assert_eq!(next, utc(2026, 1, 1, 10, 5));

        // Strictly after.
        let next = schedule.next_after(utc(2026, 1, 1, 10, 5), Tz::UTC).unwrap();
        assert_eq!(next, utc(2026, 1, 1, 10, 10));
    }

    #[test]
    fn test_weekdays_at_nine() {
        let schedule = CronSchedule::parse("0 9 * * MON-FRI").unwrap();
        // 2026-01-03 is a Saturday.
        let next = schedule.next_after(utc(2026, 1, 3, 12, 0), Tz::UTC).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_sunday_aliases() {
        for expr in ["0 0 * * 0", "0 0 * * 7", "0 0 * * sun", "@weekly"] {
            let schedule = CronSchedule::parse(expr).unwrap();
            let next = schedule.next_after(utc(2026, 1, 1, 0, 0), Tz::UTC).unwrap();
            assert_eq!(next.weekday(), Weekday::Sun, "{expr}");
        }
    }

    #[test]
    fn test_lists_ranges_steps() {
        let schedule = CronSchedule::parse("15,45 8-10/2 1 JAN,jul *").unwrap();
        let upcoming = schedule.upcoming(utc(2026, 1, 1, 0, 0), Tz::UTC, 5);
        assert_eq!(
            upcoming,
            vec![
                utc(2026, 1, 1, 8, 15),
                utc(2026, 1, 1, 8, 45),
                utc(2026, 1, 1, 10, 15),
                utc(2026, 1, 1, 10, 45),
                utc(2026, 7, 1, 8, 15),
            ]
        );
    }

    #[test]
    fn test_timezone() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let next = schedule.next_after(utc(2026, 1, 1, 0, 30), tz).unwrap();
        // 09:00 JST is 00:00 UTC.
        assert_eq!(next, utc(2026, 1, 2, 0, 0));
    }

    #[test]
    fn test_shortcuts() {
        let hourly = CronSchedule::parse("@hourly").unwrap();
        assert_eq!(
            hourly.next_after(utc(2026, 1, 1, 5, 30), Tz::UTC),
            Some(utc(2026, 1, 1, 6, 0))
        );
        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(
            daily.next_after(utc(2026, 1, 1, 5, 30), Tz::UTC),
            Some(utc(2026, 1, 2, 0, 0))
        );
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in [
            "",
            "* * * *",
            "0 0 * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
            "1,,2 * * * *",
            "@fortnightly",
            "0 0 31 2 *",
            "0 0 30,31 2 *",
        ] {
            let err = CronSchedule::parse(expr).unwrap_err();
            assert!(matches!(err, Error::InvalidCron { .. }), "{expr:?}");
        }
    }

    #[test]
    fn test_day_fields_match_either() {
        // 2026-01-01 is a Thursday; the first Friday is the 2nd.
        let schedule = CronSchedule::parse("0 0 13 * FRI").unwrap();
        assert_eq!(
            schedule.next_after(utc(2026, 1, 1, 0, 0), Tz::UTC),
            Some(utc(2026, 1, 2, 0, 0))
        );

        let schedule = CronSchedule::parse("0 9 1 * MON").unwrap();
        assert_eq!(
            schedule.upcoming(utc(2026, 1, 1, 12, 0), Tz::UTC, 5),
            vec![
                utc(2026, 1, 5, 9, 0),
                utc(2026, 1, 12, 9, 0),
                utc(2026, 1, 19, 9, 0),
                utc(2026, 1, 26, 9, 0),
                utc(2026, 2, 1, 9, 0),
            ]
        );
    }

    #[test]
    fn test_shared_day_not_duplicated() {
        // 2026-06-01 is a Monday and matches both day fields.
        let schedule = CronSchedule::parse("0 0 1 * MON").unwrap();
        let upcoming = schedule.upcoming(utc(2026, 5, 31, 0, 0), Tz::UTC, 2);
        assert_eq!(upcoming, vec![utc(2026, 6, 1, 0, 0), utc(2026, 6, 8, 0, 0)]);
    }
}
