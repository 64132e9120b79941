//! Next-run arithmetic for the supported frequencies.
//!
//! Weekly jobs may name the weekdays they run on; monthly jobs may pick a
//! fixed day, the last day, or the first or last weekday of the month. All
//! runs happen at the time of day of the job's `start_at`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{ReportError, Result};
use crate::job::Frequency;

/// Which day of the month a monthly job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonthDay {
    /// Fixed day, clamped to the last day of shorter months.
    Day(u32),
    LastDay,
    /// First Monday-to-Friday day of the month.
    FirstWeekday,
    LastWeekday,
}

impl FromStr for MonthDay {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase().replace([' ', '_'], "-");
        match key.as_str() {
            "last-day" | "last" => Ok(MonthDay::LastDay),
            "first-weekday" => Ok(MonthDay::FirstWeekday),
            "last-weekday" => Ok(MonthDay::LastWeekday),
            other => other
                .parse::<u32>()
                .map(MonthDay::Day)
                .map_err(|_| ReportError::Validation(format!("unknown day of month '{s}'"))),
        }
    }
}

impl fmt::Display for MonthDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonthDay::Day(d) => write!(f, "day {d}"),
            MonthDay::LastDay => f.write_str("the last day"),
            MonthDay::FirstWeekday => f.write_str("the first weekday"),
            MonthDay::LastWeekday => f.write_str("the last weekday"),
        }
    }
}

/// Extra recurrence rules on top of the frequency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    /// Weekly jobs only. Empty means the weekday of `start_at`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weekdays: Vec<Weekday>,
    /// Monthly jobs only. `None` means the day-of-month of `start_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_day: Option<MonthDay>,
}

impl Recurrence {
    /// Sorted Monday first, without duplicates.
    pub fn normalized(mut self) -> Self {
        self.weekdays.sort_by_key(|d| d.num_days_from_monday());
        self.weekdays.dedup();
        self
    }

    pub fn validate(&self, frequency: Frequency) -> Result<()> {
        if !self.weekdays.is_empty() && frequency != Frequency::Weekly {
            return Err(ReportError::Validation(format!(
                "weekdays only apply to weekly jobs, not {}",
                frequency.as_str()
            )));
        }
        match self.month_day {
            Some(_) if frequency != Frequency::Monthly => Err(ReportError::Validation(format!(
                "day of month only applies to monthly jobs, not {}",
                frequency.as_str()
            ))),
            Some(MonthDay::Day(d)) if !(1..=31).contains(&d) => Err(ReportError::Validation(
                format!("day of month must be between 1 and 31, got {d}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Earliest occurrence at or after `start_at`.
pub fn first_run(
    frequency: Frequency,
    start_at: DateTime<Utc>,
    recurrence: &Recurrence,
) -> DateTime<Utc> {
    match frequency {
        Frequency::Weekly if !recurrence.weekdays.is_empty() => (0..7)
            .map(|d| start_at + Duration::days(d))
            .find(|t| recurrence.weekdays.contains(&t.weekday()))
            .unwrap_or(start_at),
        Frequency::Monthly => match recurrence.month_day {
            Some(rule) => {
                let this_month = day_in_month(start_at.year(), start_at.month(), rule)
                    .map(|date| date.and_time(start_at.time()).and_utc());
                match this_month {
                    Some(t) if t >= start_at => t,
                    _ => advance(frequency, start_at, recurrence, start_at).unwrap_or(start_at),
                }
            }
            None => start_at,
        },
        _ => start_at,
    }
}

/// One occurrence after `from`. `None` for one-time jobs.
///
/// Monthly jobs without a rule land on the day-of-month of `start_at`,
/// clamped to the last day of shorter months, so Jan 31 → Feb 28 (29) → Mar 31.
pub fn advance(
    frequency: Frequency,
    start_at: DateTime<Utc>,
    recurrence: &Recurrence,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match frequency {
        Frequency::OneTime => None,
        Frequency::Daily => Some(from + Duration::days(1)),
        Frequency::Weekly if recurrence.weekdays.is_empty() => Some(from + Duration::weeks(1)),
        Frequency::Weekly => (1..=7)
            .map(|d| from.date_naive() + Duration::days(d))
            .find(|date| recurrence.weekdays.contains(&date.weekday()))
            .map(|date| date.and_time(start_at.time()).and_utc()),
        Frequency::Monthly => {
            let (year, month) = if from.month() == 12 {
                (from.year() + 1, 1)
            } else {
                (from.year(), from.month() + 1)
            };
            let rule = recurrence
                .month_day
                .unwrap_or(MonthDay::Day(start_at.day()));
            let date = day_in_month(year, month, rule)?;
            Some(date.and_time(start_at.time()).and_utc())
        }
    }
}

fn day_in_month(year: i32, month: u32, rule: MonthDay) -> Option<NaiveDate> {
    let is_weekday = |d: &NaiveDate| d.weekday().num_days_from_monday() < 5;
    match rule {
        MonthDay::Day(day) => clamped_date(year, month, day),
        MonthDay::LastDay => clamped_date(year, month, 31),
        MonthDay::FirstWeekday => (1..=7)
            .filter_map(|d| NaiveDate::from_ymd_opt(year, month, d))
            .find(is_weekday),
        MonthDay::LastWeekday => {
            let last = clamped_date(year, month, 31)?;
            (0..7)
                .map(|back| last - Duration::days(back))
                .find(is_weekday)
        }
    }
}

fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    (1..=day.min(31))
        .rev()
        .find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
}

/// Next run after a successful execution scheduled for `previous`.
///
/// Advances at least one occurrence, then keeps advancing while the result
/// is not in the future. Returns the new time and how many occurrences were
/// skipped beyond the first, or `None` for one-time jobs.
pub fn next_after(
    frequency: Frequency,
    start_at: DateTime<Utc>,
    recurrence: &Recurrence,
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, u32)> {
    let mut next = advance(frequency, start_at, recurrence, previous)?;
    let mut skipped = 0;
    while next <= now {
        next = advance(frequency, start_at, recurrence, next)?;
        skipped += 1;
    }
    Some((next, skipped))
}

/// Human-readable schedule, e.g. "Weekly on Monday, Wednesday at 08:00 UTC".
pub fn describe(frequency: Frequency, start_at: DateTime<Utc>, recurrence: &Recurrence) -> String {
    let time = start_at.format("%H:%M UTC");
    match frequency {
        Frequency::OneTime => format!("Once on {} at {time}", start_at.format("%Y-%m-%d")),
        Frequency::Daily => format!("Daily at {time}"),
        Frequency::Weekly => {
            let days: Vec<&str> = if recurrence.weekdays.is_empty() {
                vec![weekday_name(start_at.weekday())]
            } else {
                recurrence.weekdays.iter().map(|d| weekday_name(*d)).collect()
            };
            format!("Weekly on {} at {time}", days.join(", "))
        }
        Frequency::Monthly => {
            let rule = recurrence
                .month_day
                .unwrap_or(MonthDay::Day(start_at.day()));
            format!("Monthly on {rule} at {time}")
        }
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn plain() -> Recurrence {
        Recurrence::default()
    }

    fn on_days(days: &[Weekday]) -> Recurrence {
        Recurrence {
            weekdays: days.to_vec(),
            month_day: None,
        }
        .normalized()
    }

    fn on(rule: MonthDay) -> Recurrence {
        Recurrence {
            weekdays: Vec::new(),
            month_day: Some(rule),
        }
    }

    #[test]
    fn test_daily_and_weekly_advance_by_whole_periods() {
        let start = at(2026, 3, 1, 8);
        let mut t = start;
        for _ in 0..10 {
            t = advance(Frequency::Daily, start, &plain(), t).unwrap();
        }
        assert_eq!(t, start + Duration::days(10));

        let mut w = start;
        for _ in 0..4 {
            w = advance(Frequency::Weekly, start, &plain(), w).unwrap();
        }
        assert_eq!(w, start + Duration::days(28));
    }

    #[test]
    fn test_monthly_clamps_and_recovers_day() {
        let start = at(2026, 1, 31, 9);
        let feb = advance(Frequency::Monthly, start, &plain(), start).unwrap();
        assert_eq!(feb, at(2026, 2, 28, 9));
        let mar = advance(Frequency::Monthly, start, &plain(), feb).unwrap();
        assert_eq!(mar, at(2026, 3, 31, 9));
        let apr = advance(Frequency::Monthly, start, &plain(), mar).unwrap();
        assert_eq!(apr, at(2026, 4, 30, 9));

        let leap_start = at(2028, 1, 31, 0);
        assert_eq!(
            advance(Frequency::Monthly, leap_start, &plain(), leap_start).unwrap(),
            at(2028, 2, 29, 0)
        );
    }

    #[test]
    fn test_monthly_wraps_year() {
        let start = at(2026, 12, 15, 6);
        assert_eq!(
            advance(Frequency::Monthly, start, &plain(), start).unwrap(),
            at(2027, 1, 15, 6)
        );
    }

    #[test]
    fn test_one_time_has_no_next() {
        let start = at(2026, 5, 5, 5);
        assert!(advance(Frequency::OneTime, start, &plain(), start).is_none());
        assert!(next_after(Frequency::OneTime, start, &plain(), start, start).is_none());
    }

    #[test]
    fn test_catch_up_skips_missed_periods() {
        let start = at(2026, 3, 1, 8);
        // Loop was down for three and a half days.
        let now = start + Duration::hours(84);
        let (next, skipped) = next_after(Frequency::Daily, start, &plain(), start, now).unwrap();
        assert_eq!(next, at(2026, 3, 5, 8));
        assert_eq!(skipped, 3);
        assert!(next > now);
    }

    #[test]
    fn test_next_after_is_strictly_later() {
        let start = at(2026, 3, 1, 8);
        let (next, skipped) =
            next_after(Frequency::Weekly, start, &plain(), start, start).unwrap();
        assert_eq!(next, at(2026, 3, 8, 8));
        assert_eq!(skipped, 0);
    }

    #[test]
    fn test_weekly_on_selected_days() {
        // 2026-03-02 is a Monday.
        let rule = on_days(&[Weekday::Wed, Weekday::Mon, Weekday::Wed]);
        assert_eq!(rule.weekdays, vec![Weekday::Mon, Weekday::Wed]);

        // Starting on a Sunday, the first run is the following Monday.
        let start = at(2026, 3, 1, 8);
        let first = first_run(Frequency::Weekly, start, &rule);
        assert_eq!(first, at(2026, 3, 2, 8));

        let second = advance(Frequency::Weekly, start, &rule, first).unwrap();
        assert_eq!(second, at(2026, 3, 4, 8));
        let third = advance(Frequency::Weekly, start, &rule, second).unwrap();
        assert_eq!(third, at(2026, 3, 9, 8));
    }

    #[test]
    fn test_weekly_single_day_repeats_every_seven_days() {
        let rule = on_days(&[Weekday::Fri]);
        let start = at(2026, 3, 6, 17);
        assert_eq!(first_run(Frequency::Weekly, start, &rule), start);
        assert_eq!(
            advance(Frequency::Weekly, start, &rule, start).unwrap(),
            at(2026, 3, 13, 17)
        );
    }

    #[test]
    fn test_monthly_last_day() {
        let rule = on(MonthDay::LastDay);
        let start = at(2026, 1, 10, 7);
        let first = first_run(Frequency::Monthly, start, &rule);
        assert_eq!(first, at(2026, 1, 31, 7));
        let feb = advance(Frequency::Monthly, start, &rule, first).unwrap();
        assert_eq!(feb, at(2026, 2, 28, 7));
        let mar = advance(Frequency::Monthly, start, &rule, feb).unwrap();
        assert_eq!(mar, at(2026, 3, 31, 7));
    }

    #[test]
    fn test_monthly_first_and_last_weekday() {
        // August 2026 starts on a Saturday and ends on a Monday.
        let start = at(2026, 7, 20, 9);
        let first = on(MonthDay::FirstWeekday);
        assert_eq!(
            advance(Frequency::Monthly, start, &first, start).unwrap(),
            at(2026, 8, 3, 9)
        );
        // May 2026 ends on a Sunday.
        let last = on(MonthDay::LastWeekday);
        let april = at(2026, 4, 10, 9);
        assert_eq!(
            advance(Frequency::Monthly, april, &last, april).unwrap(),
            at(2026, 5, 29, 9)
        );
        assert_eq!(
            advance(Frequency::Monthly, start, &last, start).unwrap(),
            at(2026, 8, 31, 9)
        );
    }

    #[test]
    fn test_monthly_specific_day_already_passed_starts_next_month() {
        let rule = on(MonthDay::Day(5));
        let start = at(2026, 3, 20, 9);
        assert_eq!(first_run(Frequency::Monthly, start, &rule), at(2026, 4, 5, 9));
    }

    #[test]
    fn test_recurrence_validation() {
        assert!(on_days(&[Weekday::Mon]).validate(Frequency::Weekly).is_ok());
        assert!(on_days(&[Weekday::Mon]).validate(Frequency::Daily).is_err());
        assert!(on(MonthDay::LastDay).validate(Frequency::Weekly).is_err());
        assert!(on(MonthDay::Day(0)).validate(Frequency::Monthly).is_err());
        assert!(on(MonthDay::Day(32)).validate(Frequency::Monthly).is_err());
        assert!(on(MonthDay::Day(31)).validate(Frequency::Monthly).is_ok());
    }

    #[test]
    fn test_month_day_parsing() {
        assert_eq!("Last Day".parse::<MonthDay>().unwrap(), MonthDay::LastDay);
        assert_eq!("first_weekday".parse::<MonthDay>().unwrap(), MonthDay::FirstWeekday);
        assert_eq!("15".parse::<MonthDay>().unwrap(), MonthDay::Day(15));
        assert!("someday".parse::<MonthDay>().is_err());
    }

    #[test]
    fn test_describe() {
        let start = at(2026, 3, 2, 8);
        assert_eq!(
            describe(Frequency::Weekly, start, &on_days(&[Weekday::Wed, Weekday::Mon])),
            "Weekly on Monday, Wednesday at 08:00 UTC"
        );
        assert_eq!(
            describe(Frequency::Weekly, start, &plain()),
            "Weekly on Monday at 08:00 UTC"
        );
        assert_eq!(
            describe(Frequency::Monthly, start, &on(MonthDay::LastDay)),
            "Monthly on the last day at 08:00 UTC"
        );
        assert_eq!(
            describe(Frequency::Monthly, start, &plain()),
            "Monthly on day 2 at 08:00 UTC"
        );
        assert_eq!(describe(Frequency::Daily, start, &plain()), "Daily at 08:00 UTC");
    }
}
