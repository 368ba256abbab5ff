//! Calendar trigger expressions.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds, UTC)
//! Each field: `*`, `*/N`, `N`, `A-B`, `A-B/N`, or a comma list of those.
//! Day-of-week accepts 0-7 (0 and 7 are Sunday) or `sun`..`sat`.
//! Example: "0 8 * * mon" = every Monday at 08:00.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};

use crate::error::HitlError;

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Longest search window; covers Feb 29 schedules.
const SEARCH_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: Vec<bool>,
    hours: Vec<bool>,
    days_of_month: Vec<bool>,
    months: Vec<bool>,
    days_of_week: Vec<bool>,
    dom_any: bool,
    dow_any: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, HitlError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(HitlError::Cron(format!(
                "'{expression}' needs 5 fields: MIN HOUR DOM MON DOW"
            )));
        }
        let field = |text: &str, min: u32, max: u32| {
            parse_field(text, min, max)
                .ok_or_else(|| HitlError::Cron(format!("bad field '{text}' in '{expression}'")))
        };

        let mut days_of_week = field(&normalize_days(parts[4]), 0, 7)?;
        if days_of_week[7] {
            days_of_week[0] = true;
        }
        days_of_week.truncate(7);

        Ok(Self {
            expression: expression.to_string(),
            minutes: field(parts[0], 0, 59)?,
            hours: field(parts[1], 0, 23)?,
            days_of_month: field(parts[2], 1, 31)?,
            months: field(parts[3], 1, 12)?,
            days_of_week,
            dom_any: parts[2] == "*",
            dow_any: parts[4] == "*",
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, day: DateTime<Utc>) -> bool {
        if !self.months[day.month() as usize] {
            return false;
        }
        let dom = self.days_of_month[day.day() as usize];
        let dow = self.days_of_week[day.weekday().num_days_from_sunday() as usize];
        match (self.dom_any, self.dow_any) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            // Classic cron: either restriction may match.
            (false, false) => dom || dow,
        }
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let first_day = start.date_naive();

        for offset in 0..SEARCH_DAYS {
            let date = first_day + Duration::days(offset);
            let midnight = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
            if !self.day_matches(midnight) {
                continue;
            }
            for hour in 0..24u32 {
                if !self.hours[hour as usize] {
                    continue;
                }
                for minute in 0..60u32 {
                    if !self.minutes[minute as usize] {
                        continue;
                    }
                    let candidate = midnight + Duration::hours(hour.into()) + Duration::minutes(minute.into());
                    if candidate >= start {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}

fn normalize_days(field: &str) -> String {
    let mut out = field.to_ascii_lowercase();
    for (n, name) in DAY_NAMES.iter().enumerate() {
        out = out.replace(name, &n.to_string());
    }
    out
}

/// Parse a cron field into a membership table indexed by value.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<bool>> {
    let mut table = vec![false; max as usize + 1];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<u32>().ok()?),
            None => (part, 1),
        };
        if step == 0 {
            return None;
        }
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (a.parse().ok()?, b.parse().ok()?)
        } else {
            let n: u32 = range.parse().ok()?;
            // "N/step" means from N to the end.
            if part.contains('/') { (n, max) } else { (n, n) }
        };
        if lo < min || hi > max || lo > hi {
            return None;
        }
        for v in (lo..=hi).step_by(step as usize) {
            table[v as usize] = true;
        }
    }
    Some(table)
}
