//! Recurrence calculator
//!
//! Pure functions that turn a reminder's rule into concrete occurrence
//! instants. Every result is truncated down to the whole minute, which is
//! also the granularity notifications are keyed on.
//!
//! - `Once` returns the stored instant.
//! - `Daily` treats `timestamp` as seconds into the day and picks today's or
//!   the neighbouring day's occurrence.
//! - `Custom` starts like `Daily` and then walks day by day until the weekday
//!   mask matches, giving up after a full week.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::clock::{from_unix, truncate_to_minute};
use crate::error::{Error, Result};
use crate::models::{Reminder, RepeatRule, SECONDS_PER_DAY};

/// Days a custom rule may step before the mask is declared unusable.
const MAX_WEEKDAY_STEPS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn step(self) -> Duration {
        match self {
            Self::Forward => Duration::days(1),
            Self::Backward => Duration::days(-1),
        }
    }
}

/// Next occurrence at or after `reference`.
pub fn due_next(reminder: &Reminder, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    due(reminder, reference, Direction::Forward)
}

/// Most recent occurrence at or before `reference`.
pub fn due_prev(reminder: &Reminder, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    due(reminder, reference, Direction::Backward)
}

fn due(reminder: &Reminder, reference: DateTime<Utc>, direction: Direction) -> Result<DateTime<Utc>> {
    match reminder.repeat {
        RepeatRule::Once => from_unix(reminder.timestamp)
            .map(truncate_to_minute)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "timestamp {} of reminder {} is out of range",
                    reminder.timestamp, reminder.uuid
                ))
            }),
        RepeatRule::Daily => {
            let candidate = first_candidate(reminder, reference, direction)?;
            Ok(truncate_to_minute(candidate))
        }
        RepeatRule::Custom => {
            if reminder.weekdays.is_empty() {
                return Err(Error::InvalidRecurrence(format!(
                    "reminder {} has no active weekday",
                    reminder.uuid
                )));
            }
            let mut candidate = first_candidate(reminder, reference, direction)?;
            for _ in 0..MAX_WEEKDAY_STEPS {
                if reminder.weekdays.matches(candidate) {
                    return Ok(truncate_to_minute(candidate));
                }
                candidate += direction.step();
            }
            Err(Error::InvalidRecurrence(format!(
                "no active weekday within a week for reminder {}",
                reminder.uuid
            )))
        }
    }
}

/// Today's occurrence, moved one day in `direction` if it lies on the wrong
/// side of `reference`.
fn first_candidate(
    reminder: &Reminder,
    reference: DateTime<Utc>,
    direction: Direction,
) -> Result<DateTime<Utc>> {
    let time_of_day = reminder.timestamp;
    if !(0..SECONDS_PER_DAY).contains(&time_of_day) {
        return Err(Error::InvalidRecurrence(format!(
            "time of day {time_of_day} of reminder {} is outside one day",
            reminder.uuid
        )));
    }

    let midnight = reference.date_naive().and_time(NaiveTime::MIN).and_utc();
    let today = midnight + Duration::seconds(time_of_day);
    let candidate = match direction {
        Direction::Forward if today < reference => today + Duration::days(1),
        Direction::Backward if today > reference => today - Duration::days(1),
        _ => today,
    };
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WeekdayMask;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use pretty_assertions::assert_eq;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn daily(seconds_of_day: i64) -> Reminder {
        Reminder::daily("Water plants", seconds_of_day, at(2024, 1, 1, 0, 0, 0))
    }

    #[test]
    fn test_once_returns_stored_instant_truncated() {
        let created = at(2024, 3, 4, 8, 0, 0);
        let reminder = Reminder::once("Call", at(2024, 3, 4, 9, 30, 42), created);
        let expected = at(2024, 3, 4, 9, 30, 0);
        assert_eq!(due_next(&reminder, created).unwrap(), expected);
        assert_eq!(due_prev(&reminder, at(2030, 1, 1, 0, 0, 0)).unwrap(), expected);
    }

    #[test]
    fn test_daily_next_today_when_not_passed() {
        let reminder = daily(9 * 3_600);
        let reference = at(2024, 3, 4, 8, 59, 0);
        assert_eq!(
            due_next(&reminder, reference).unwrap(),
            at(2024, 3, 4, 9, 0, 0)
        );
    }

    #[test]
    fn test_daily_next_tomorrow_when_passed() {
        let reminder = daily(9 * 3_600);
        let reference = at(2024, 3, 4, 9, 0, 1);
        assert_eq!(
            due_next(&reminder, reference).unwrap(),
            at(2024, 3, 5, 9, 0, 0)
        );
    }

    #[test]
    fn test_daily_prev_is_mirror() {
        let reminder = daily(9 * 3_600);
        assert_eq!(
            due_prev(&reminder, at(2024, 3, 4, 8, 59, 0)).unwrap(),
            at(2024, 3, 3, 9, 0, 0)
        );
        assert_eq!(
            due_prev(&reminder, at(2024, 3, 4, 9, 0, 0)).unwrap(),
            at(2024, 3, 4, 9, 0, 0)
        );
    }

    #[test]
    fn test_daily_rolls_over_month_and_year() {
        let reminder = daily(30 * 60);
        assert_eq!(
            due_next(&reminder, at(2023, 12, 31, 23, 0, 0)).unwrap(),
            at(2024, 1, 1, 0, 30, 0)
        );
        assert_eq!(
            due_prev(&reminder, at(2024, 3, 1, 0, 10, 0)).unwrap(),
            at(2024, 2, 29, 0, 30, 0)
        );
    }

    #[test]
    fn test_daily_matches_closed_form_for_every_reference() {
        let reminder = daily(17 * 3_600 + 15 * 60);
        let t = Duration::seconds(reminder.timestamp);
        let mut reference = at(2024, 2, 27, 0, 0, 0);
        let end = at(2024, 3, 3, 0, 0, 0);
        while reference < end {
            let midnight = reference.date_naive().and_time(NaiveTime::MIN).and_utc();
            let today = midnight + t;
            let next = if today >= reference {
                today
            } else {
                today + Duration::days(1)
            };
            let prev = if today <= reference {
                today
            } else {
                today - Duration::days(1)
            };
            assert_eq!(due_next(&reminder, reference).unwrap(), next);
            assert_eq!(due_prev(&reminder, reference).unwrap(), prev);
            reference += Duration::minutes(37);
        }
    }

    #[test]
    fn test_custom_next_lands_on_active_day() {
        // 2024-03-04 is a Monday
        let mask = WeekdayMask::of(&[Weekday::Wed, Weekday::Sat]);
        let reminder = Reminder::custom("Gym", 18 * 3_600, mask, at(2024, 1, 1, 0, 0, 0));
        let next = due_next(&reminder, at(2024, 3, 4, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 6, 18, 0, 0));
        assert_eq!(next.weekday(), Weekday::Wed);

        let prev = due_prev(&reminder, at(2024, 3, 4, 12, 0, 0)).unwrap();
        assert_eq!(prev, at(2024, 3, 2, 18, 0, 0));
        assert_eq!(prev.weekday(), Weekday::Sat);
    }

    #[test]
    fn test_custom_same_day_after_time_moves_a_week() {
        let mask = WeekdayMask::of(&[Weekday::Mon]);
        let reminder = Reminder::custom("Standup", 9 * 3_600, mask, at(2024, 1, 1, 0, 0, 0));
        assert_eq!(
            due_next(&reminder, at(2024, 3, 4, 9, 30, 0)).unwrap(),
            at(2024, 3, 11, 9, 0, 0)
        );
        assert_eq!(
            due_prev(&reminder, at(2024, 3, 4, 8, 30, 0)).unwrap(),
            at(2024, 2, 26, 9, 0, 0)
        );
    }

    #[test]
    fn test_custom_next_is_earliest_active_instant() {
        let mask = WeekdayMask::of(&[Weekday::Tue, Weekday::Thu, Weekday::Sun]);
        let reminder = Reminder::custom("Piano", 7 * 3_600 + 45 * 60, mask, at(2024, 1, 1, 0, 0, 0));
        let mut reference = at(2024, 3, 1, 0, 0, 0);
        while reference < at(2024, 3, 15, 0, 0, 0) {
            let next = due_next(&reminder, reference).unwrap();
            assert!(mask.matches(next));
            assert!(next >= truncate_to_minute(reference));
            assert_eq!((next.hour(), next.minute()), (7, 45));

            // No active occurrence hides between the reference and the result.
            let mut day = reference.date_naive().and_time(NaiveTime::MIN).and_utc()
                + Duration::seconds(reminder.timestamp);
            while day < next {
                assert!(day < reference || !mask.matches(day));
                day += Duration::days(1);
            }
            reference += Duration::hours(5);
        }
    }

    #[test]
    fn test_custom_empty_mask_is_invalid() {
        let reminder = Reminder::custom("Never", 60, WeekdayMask::default(), at(2024, 1, 1, 0, 0, 0));
        assert!(matches!(
            due_next(&reminder, at(2024, 3, 4, 0, 0, 0)),
            Err(Error::InvalidRecurrence(_))
        ));
        assert!(matches!(
            due_prev(&reminder, at(2024, 3, 4, 0, 0, 0)),
            Err(Error::InvalidRecurrence(_))
        ));
    }

    #[test]
    fn test_out_of_range_time_of_day_is_invalid() {
        let mut reminder = daily(60);
        reminder.timestamp = SECONDS_PER_DAY + 5;
        assert!(matches!(
            due_next(&reminder, at(2024, 3, 4, 0, 0, 0)),
            Err(Error::InvalidRecurrence(_))
        ));
    }
}
