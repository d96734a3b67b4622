//! Working-time calendar.
//!
//! Converts between wall-clock instants and working hours. Durations inside
//! the engine are hour counts; this module is the only place that knows
//! about weekdays, daily working windows, and holidays.
//!
//! # Time Model
//! Each working day has one window `[day_start_hour, day_start_hour + hours_per_day)`
//! in UTC. A date is a working day iff its weekday is in `working_days`
//! (0 = Sunday … 6 = Saturday) and it is not listed in `holidays`.
//!
//! # Boundary Rules
//! - Start instants in non-working time snap forward to the next window start
//!   ([`WorkingCalendar::next_working_instant`]).
//! - Finish instants stay where the work runs out: a task that consumes a
//!   whole day finishes at the end of that day's window, not at the start of
//!   the next one ([`WorkingCalendar::add_working_hours`]).
//! - Holidays remove the whole day.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Working-hours configuration as supplied per project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkingHoursConfig {
    /// Declared number of working days per week. Must match `working_days`.
    pub working_days_per_week: u8,
    /// Working hours per working day.
    pub hours_per_day: u32,
    /// Hour of day (UTC) at which the working window opens.
    pub day_start_hour: u32,
    /// Working weekdays, 0 = Sunday … 6 = Saturday.
    pub working_days: Vec<u8>,
    /// Non-working dates.
    pub holidays: Vec<NaiveDate>,
}

impl Default for WorkingHoursConfig {
    fn default() -> Self {
        Self {
            working_days_per_week: 5,
            hours_per_day: 8,
            day_start_hour: 9,
            working_days: vec![1, 2, 3, 4, 5],
            holidays: Vec::new(),
        }
    }
}

impl WorkingHoursConfig {
    /// A calendar where every hour of every day is working time.
    pub fn continuous() -> Self {
        Self {
            working_days_per_week: 7,
            hours_per_day: 24,
            day_start_hour: 0,
            working_days: (0..7).collect(),
            holidays: Vec::new(),
        }
    }

    /// Sets the working weekdays and the matching days-per-week count.
    pub fn with_working_days(mut self, days: Vec<u8>) -> Self {
        self.working_days_per_week = days.len() as u8;
        self.working_days = days;
        self
    }

    /// Sets the daily window.
    pub fn with_hours(mut self, day_start_hour: u32, hours_per_day: u32) -> Self {
        self.day_start_hour = day_start_hour;
        self.hours_per_day = hours_per_day;
        self
    }

    /// Adds a holiday.
    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.push(date);
        self
    }

    /// Validates the configuration and builds a calendar from it.
    pub fn build(&self) -> Result<WorkingCalendar, CalendarError> {
        WorkingCalendar::new(self)
    }
}

/// Invalid calendar configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalendarError {
    #[error("calendar has no working days")]
    NoWorkingDays,
    #[error("invalid weekday {0} (expected 0-6)")]
    InvalidWeekday(u8),
    #[error("invalid daily window: start {start_hour}h + {hours_per_day}h exceeds one day")]
    InvalidWindow { start_hour: u32, hours_per_day: u32 },
    #[error("workingDaysPerWeek is {declared} but {actual} working days are listed")]
    InconsistentWeek { declared: u8, actual: usize },
}

/// Validated working-time calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingCalendar {
    days: [bool; 7],
    day_start: NaiveTime,
    hours_per_day: u32,
    holidays: BTreeSet<NaiveDate>,
}

impl WorkingCalendar {
    /// Builds a calendar, rejecting configurations with no working time.
    pub fn new(config: &WorkingHoursConfig) -> Result<Self, CalendarError> {
        let mut days = [false; 7];
        for &d in &config.working_days {
            if d > 6 {
                return Err(CalendarError::InvalidWeekday(d));
            }
            days[d as usize] = true;
        }
        let actual = days.iter().filter(|d| **d).count();
        if actual == 0 {
            return Err(CalendarError::NoWorkingDays);
        }
        if config.working_days_per_week as usize != actual {
            return Err(CalendarError::InconsistentWeek {
                declared: config.working_days_per_week,
                actual,
            });
        }
        let day_end = config.day_start_hour.checked_add(config.hours_per_day);
        if config.hours_per_day == 0 || day_end.map_or(true, |end| end > 24) {
            return Err(CalendarError::InvalidWindow {
                start_hour: config.day_start_hour,
                hours_per_day: config.hours_per_day,
            });
        }
        let day_start = NaiveTime::from_hms_opt(config.day_start_hour % 24, 0, 0).ok_or(
            CalendarError::InvalidWindow {
                start_hour: config.day_start_hour,
                hours_per_day: config.hours_per_day,
            },
        )?;

        Ok(Self {
            days,
            day_start,
            hours_per_day: config.hours_per_day,
            holidays: config.holidays.iter().copied().collect(),
        })
    }

    /// Working hours per working day.
    pub fn hours_per_day(&self) -> u32 {
        self.hours_per_day
    }

    /// Whether a date is a working day.
    pub fn is_working_day(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday().num_days_from_sunday() as usize;
        self.days[weekday] && !self.holidays.contains(&date)
    }

    /// Whether an instant falls inside a working window.
    pub fn is_working_time(&self, at: DateTime<Utc>) -> bool {
        let at = at.naive_utc();
        self.window(at.date())
            .is_some_and(|(ws, we)| at >= ws && at < we)
    }

    /// The instant itself if it is working time, else the next window start.
    pub fn next_working_instant(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let at = at.naive_utc();
        let mut date = at.date();
        let mut cursor = at;
        loop {
            if let Some((ws, we)) = self.window(date) {
                if cursor < we {
                    return cursor.max(ws).and_utc();
                }
            }
            match date.succ_opt() {
                Some(next) => {
                    date = next;
                    cursor = next.and_time(NaiveTime::MIN);
                }
                None => return cursor.and_utc(),
            }
        }
    }

    /// The instant at which `hours` working hours have elapsed since `from`.
    ///
    /// Negative `hours` walk backwards. Zero returns `from` unchanged.
    pub fn add_working_hours(&self, from: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
        let minutes = hours.saturating_mul(60);
        let from = from.naive_utc();
        let result = match minutes.signum() {
            0 => from,
            1 => self.forward(from, minutes),
            _ => self.backward(from, -minutes),
        };
        result.and_utc()
    }

    /// Signed working hours in `[a, b)`, partial hours rounded up.
    pub fn working_hours_between(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
        if b < a {
            return -self.working_hours_between(b, a);
        }
        let minutes = self.working_minutes(a.naive_utc(), b.naive_utc());
        (minutes + 59) / 60
    }

    /// Start instant of the working hour at `offset` from `origin`.
    pub fn offset_to_start(&self, origin: DateTime<Utc>, offset: i64) -> DateTime<Utc> {
        self.next_working_instant(self.add_working_hours(origin, offset))
    }

    /// Finish instant after `offset` working hours from `origin`.
    pub fn offset_to_finish(&self, origin: DateTime<Utc>, offset: i64) -> DateTime<Utc> {
        self.add_working_hours(origin, offset)
    }

    fn window(&self, date: NaiveDate) -> Option<(NaiveDateTime, NaiveDateTime)> {
        if !self.is_working_day(date) {
            return None;
        }
        let start = date.and_time(self.day_start);
        Some((start, start + Duration::hours(self.hours_per_day as i64)))
    }

    fn forward(&self, from: NaiveDateTime, mut remaining: i64) -> NaiveDateTime {
        let mut date = from.date();
        let mut cursor = from;
        loop {
            if let Some((ws, we)) = self.window(date) {
                let begin = cursor.max(ws);
                if begin < we {
                    let available = (we - begin).num_minutes();
                    if remaining <= available {
                        return begin + Duration::minutes(remaining);
                    }
                    remaining -= available;
                }
            }
            match date.succ_opt() {
                Some(next) => {
                    date = next;
                    cursor = next.and_time(NaiveTime::MIN);
                }
                None => return cursor,
            }
        }
    }

    fn backward(&self, from: NaiveDateTime, mut remaining: i64) -> NaiveDateTime {
        let mut date = from.date();
        let mut cursor = from;
        loop {
            if let Some((ws, we)) = self.window(date) {
                let end = cursor.min(we);
                if end > ws {
                    let available = (end - ws).num_minutes();
                    if remaining <= available {
                        return end - Duration::minutes(remaining);
                    }
                    remaining -= available;
                }
            }
            match date.pred_opt() {
                Some(prev) => {
                    // Midnight after `prev` lies past its window end.
                    cursor = date.and_time(NaiveTime::MIN);
                    date = prev;
                }
                None => return cursor,
            }
        }
    }

    fn working_minutes(&self, a: NaiveDateTime, b: NaiveDateTime) -> i64 {
        let mut total = 0;
        let mut date = a.date();
        while date <= b.date() {
            if let Some((ws, we)) = self.window(date) {
                let begin = ws.max(a);
                let end = we.min(b);
                if end > begin {
                    total += (end - begin).num_minutes();
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // 2024-01-08 is a Monday.
    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    fn standard() -> WorkingCalendar {
        WorkingHoursConfig::default().build().unwrap()
    }

    #[test]
    fn test_window_overflow_rejected() {
        let mut huge = WorkingHoursConfig::default();
        huge.day_start_hour = u32::MAX;
        huge.hours_per_day = 2;
        assert_eq!(
            huge.build(),
            Err(CalendarError::InvalidWindow {
                start_hour: u32::MAX,
                hours_per_day: 2,
            })
        );
    }

    #[test]
    fn test_config_validation() {
        let none = WorkingHoursConfig::default().with_working_days(vec![]);
        assert_eq!(none.build(), Err(CalendarError::NoWorkingDays));

        let bad_day = WorkingHoursConfig::default().with_working_days(vec![1, 7]);
        assert_eq!(bad_day.build(), Err(CalendarError::InvalidWeekday(7)));

        let long_day = WorkingHoursConfig::default().with_hours(20, 8);
        assert!(matches!(
            long_day.build(),
            Err(CalendarError::InvalidWindow { .. })
        ));

        let mut inconsistent = WorkingHoursConfig::default();
        inconsistent.working_days_per_week = 6;
        assert_eq!(
            inconsistent.build(),
            Err(CalendarError::InconsistentWeek {
                declared: 6,
                actual: 5
            })
        );
    }

    #[test]
    fn test_working_day_and_time() {
        let cal = standard();
        assert!(cal.is_working_day(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()));
        assert!(!cal.is_working_day(NaiveDate::from_ymd_opt(2024, 1, 13).unwrap())); // Saturday
        assert!(cal.is_working_time(at(8, 9, 0)));
        assert!(cal.is_working_time(at(8, 16, 59)));
        assert!(!cal.is_working_time(at(8, 17, 0))); // exclusive end
        assert!(!cal.is_working_time(at(8, 8, 0)));
    }

    #[test]
    fn test_holiday_excluded() {
        let cal = WorkingHoursConfig::default()
            .with_holiday(NaiveDate::from_ymd_opt(2024, 1, 9).unwrap())
            .build()
            .unwrap();
        assert!(!cal.is_working_day(NaiveDate::from_ymd_opt(2024, 1, 9).unwrap()));
        // Monday 17:00 + 1h skips Tuesday's holiday.
        assert_eq!(cal.add_working_hours(at(8, 17, 0), 1), at(10, 10, 0));
    }

    #[test]
    fn test_next_working_instant() {
        let cal = standard();
        assert_eq!(cal.next_working_instant(at(8, 10, 30)), at(8, 10, 30));
        assert_eq!(cal.next_working_instant(at(8, 6, 0)), at(8, 9, 0));
        assert_eq!(cal.next_working_instant(at(8, 17, 0)), at(9, 9, 0));
        // Friday evening rolls to Monday.
        assert_eq!(cal.next_working_instant(at(12, 18, 0)), at(15, 9, 0));
    }

    #[test]
    fn test_add_working_hours_forward() {
        let cal = standard();
        assert_eq!(cal.add_working_hours(at(8, 9, 0), 0), at(8, 9, 0));
        assert_eq!(cal.add_working_hours(at(8, 9, 0), 3), at(8, 12, 0));
        // A full day finishes at the end of the window, not the next morning.
        assert_eq!(cal.add_working_hours(at(8, 9, 0), 8), at(8, 17, 0));
        assert_eq!(cal.add_working_hours(at(8, 9, 0), 9), at(9, 10, 0));
        // Friday 15:00 + 4h crosses the weekend.
        assert_eq!(cal.add_working_hours(at(12, 15, 0), 4), at(15, 11, 0));
        // Starting before the window counts from the window start.
        assert_eq!(cal.add_working_hours(at(8, 0, 0), 2), at(8, 11, 0));
    }

    #[test]
    fn test_add_working_hours_backward() {
        let cal = standard();
        assert_eq!(cal.add_working_hours(at(8, 17, 0), -8), at(8, 9, 0));
        assert_eq!(cal.add_working_hours(at(9, 10, 0), -2), at(8, 16, 0));
        // Monday 10:00 - 3h lands on Friday.
        assert_eq!(cal.add_working_hours(at(15, 10, 0), -3), at(12, 15, 0));
    }

    #[test]
    fn test_working_hours_between() {
        let cal = standard();
        assert_eq!(cal.working_hours_between(at(8, 9, 0), at(8, 17, 0)), 8);
        assert_eq!(cal.working_hours_between(at(8, 9, 0), at(10, 9, 0)), 16);
        // Whole week including a weekend: Mon 00:00 -> next Mon 00:00.
        assert_eq!(cal.working_hours_between(at(8, 0, 0), at(15, 0, 0)), 40);
        assert_eq!(cal.working_hours_between(at(8, 17, 0), at(8, 9, 0)), -8);
        // Partial hours round up.
        assert_eq!(cal.working_hours_between(at(8, 9, 0), at(8, 9, 30)), 1);
    }

    #[test]
    fn test_offsets_round_trip() {
        let cal = standard();
        let origin = at(8, 9, 0);
        for offset in [0, 1, 7, 8, 9, 40, 41, 100] {
            let start = cal.offset_to_start(origin, offset);
            let finish = cal.offset_to_finish(origin, offset);
            assert_eq!(cal.working_hours_between(origin, start), offset);
            assert_eq!(cal.working_hours_between(origin, finish), offset);
            assert!(cal.is_working_time(start));
        }
        // End-of-day offsets: finish stays at 17:00, start moves to next morning.
        assert_eq!(cal.offset_to_finish(origin, 8), at(8, 17, 0));
        assert_eq!(cal.offset_to_start(origin, 8), at(9, 9, 0));
    }

    #[test]
    fn test_continuous_calendar() {
        let cal = WorkingHoursConfig::continuous().build().unwrap();
        assert_eq!(cal.add_working_hours(at(13, 22, 0), 5), at(14, 3, 0));
        assert_eq!(cal.working_hours_between(at(13, 0, 0), at(14, 0, 0)), 24);
    }
}
