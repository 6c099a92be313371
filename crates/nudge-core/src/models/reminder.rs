//! Reminder model

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Seconds in one day of the reference clock.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Global identity of a reminder, stable across replicas (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReminderUuid(Uuid);

impl ReminderUuid {
    /// Create a new unique reminder identity using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this identity
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ReminderUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReminderUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReminderUuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Recurrence kind of a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatRule {
    /// Fires once at an absolute instant
    Once,
    /// Fires every day at a time of day
    Daily,
    /// Fires at a time of day on the weekdays set in the mask
    Custom,
}

impl RepeatRule {
    /// Column/wire representation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Daily => "daily",
            Self::Custom => "custom",
        }
    }

    /// Whether `timestamp` is a time of day rather than an instant
    pub const fn is_recurring(self) -> bool {
        !matches!(self, Self::Once)
    }
}

impl fmt::Display for RepeatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepeatRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Self::Once),
            "daily" => Ok(Self::Daily),
            "custom" => Ok(Self::Custom),
            other => Err(Error::InvalidInput(format!("unknown repeat rule '{other}'"))),
        }
    }
}

/// Seven-day activity mask, Monday first. Bit 0 is Monday, bit 6 is Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "[bool; 7]", into = "[bool; 7]")]
pub struct WeekdayMask(u8);

impl WeekdayMask {
    /// Every day of the week
    pub const ALL: Self = Self(0b111_1111);
    /// Monday through Friday
    pub const WORKDAYS: Self = Self(0b001_1111);

    /// Build a mask from raw bits, rejecting bits beyond Sunday.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits > Self::ALL.0 {
            return Err(Error::InvalidInput(format!(
                "weekday mask {bits:#09b} has bits beyond Sunday"
            )));
        }
        Ok(Self(bits))
    }

    /// Build a mask from seven Monday-first flags.
    pub fn from_days(days: [bool; 7]) -> Self {
        let bits = days
            .iter()
            .enumerate()
            .filter(|(_, active)| **active)
            .fold(0u8, |acc, (index, _)| acc | (1 << index));
        Self(bits)
    }

    /// Mask with exactly the given weekdays set.
    pub fn of(weekdays: &[Weekday]) -> Self {
        weekdays
            .iter()
            .fold(Self(0), |mask, day| mask.with(*day))
    }

    /// Copy of this mask with `day` set.
    #[must_use]
    pub fn with(self, day: Weekday) -> Self {
        Self(self.0 | (1 << day.num_days_from_monday()))
    }

    /// Raw bits as persisted.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Seven Monday-first flags.
    pub fn days(self) -> [bool; 7] {
        std::array::from_fn(|index| self.0 & (1 << index) != 0)
    }

    /// Whether `day` is active.
    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    /// Whether the weekday of `instant` is active.
    pub fn matches(self, instant: DateTime<Utc>) -> bool {
        self.contains(instant.weekday())
    }

    /// A mask with no days set can never fire.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<[bool; 7]> for WeekdayMask {
    type Error = Error;

    fn try_from(days: [bool; 7]) -> Result<Self> {
        Ok(Self::from_days(days))
    }
}

impl From<WeekdayMask> for [bool; 7] {
    fn from(mask: WeekdayMask) -> Self {
        mask.days()
    }
}

impl fmt::Display for WeekdayMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LETTERS: [char; 7] = ['M', 'T', 'W', 'T', 'F', 'S', 'S'];
        for (letter, active) in LETTERS.iter().zip(self.days()) {
            write!(f, "{}", if active { *letter } else { '-' })?;
        }
        Ok(())
    }
}

/// A schedulable item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    /// Local surrogate key, unset until persisted
    #[serde(default)]
    pub id: Option<i64>,
    /// Global identity shared by every replica
    pub uuid: ReminderUuid,
    /// Short title shown in the notification
    pub title: String,
    /// Longer body text
    #[serde(default)]
    pub description: String,
    /// Unix seconds for `Once`, seconds into the day for recurring rules
    pub timestamp: i64,
    /// Recurrence kind
    pub repeat: RepeatRule,
    /// Active weekdays for `Custom`
    #[serde(default)]
    pub weekdays: WeekdayMask,
    /// Occurrence counter (stored, not enforced)
    #[serde(default)]
    pub repeat_counter: u32,
    /// Optional counter limit (stored, not enforced)
    #[serde(default)]
    pub repeat_limit: Option<u32>,
    /// Set once a one-shot reminder is acknowledged or deactivated
    #[serde(default)]
    pub finished: bool,
    /// Last modification instant, the only merge signal
    pub changed: DateTime<Utc>,
}

impl Reminder {
    /// One-shot reminder due at `at`.
    #[must_use]
    pub fn once(title: impl Into<String>, at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::build(title.into(), at.timestamp(), RepeatRule::Once, now)
    }

    /// Reminder due every day at `seconds_of_day`.
    #[must_use]
    pub fn daily(title: impl Into<String>, seconds_of_day: i64, now: DateTime<Utc>) -> Self {
        Self::build(title.into(), seconds_of_day, RepeatRule::Daily, now)
    }

    /// Reminder due at `seconds_of_day` on the days in `weekdays`.
    #[must_use]
    pub fn custom(
        title: impl Into<String>,
        seconds_of_day: i64,
        weekdays: WeekdayMask,
        now: DateTime<Utc>,
    ) -> Self {
        let mut reminder = Self::build(title.into(), seconds_of_day, RepeatRule::Custom, now);
        reminder.weekdays = weekdays;
        reminder
    }

    fn build(title: String, timestamp: i64, repeat: RepeatRule, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            uuid: ReminderUuid::new(),
            title,
            description: String::new(),
            timestamp,
            repeat,
            weekdays: WeekdayMask::default(),
            repeat_counter: 0,
            repeat_limit: None,
            finished: false,
            changed: now,
        }
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Check the shape of the record regardless of when it is checked.
    ///
    /// Used for every insert, including records replayed from a peer.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::InvalidInput("title must not be empty".into()));
        }
        match self.repeat {
            RepeatRule::Once => {
                if self.timestamp < SECONDS_PER_DAY {
                    return Err(Error::InvalidInput(format!(
                        "timestamp {} is not an absolute instant",
                        self.timestamp
                    )));
                }
            }
            RepeatRule::Daily | RepeatRule::Custom => {
                if !(0..SECONDS_PER_DAY).contains(&self.timestamp) {
                    return Err(Error::InvalidInput(format!(
                        "time of day {} must be in [0, {SECONDS_PER_DAY})",
                        self.timestamp
                    )));
                }
            }
        }
        if self.repeat == RepeatRule::Custom && self.weekdays.is_empty() {
            return Err(Error::InvalidRecurrence(
                "custom recurrence needs at least one weekday".into(),
            ));
        }
        Ok(())
    }

    /// Validation applied when a user creates a reminder locally.
    ///
    /// On top of [`validate`](Self::validate), a one-shot reminder must lie in
    /// the future.
    pub fn validate_new(&self, now: DateTime<Utc>) -> Result<()> {
        self.validate()?;
        if self.repeat == RepeatRule::Once && self.timestamp <= now.timestamp() {
            return Err(Error::InvalidInput(format!(
                "timestamp {} is not in the future",
                self.timestamp
            )));
        }
        Ok(())
    }

    /// Persisted id, or an error for records that never touched storage.
    pub fn require_id(&self) -> Result<i64> {
        self.id
            .ok_or_else(|| Error::InvalidInput(format!("reminder {} is not persisted", self.uuid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_reminder_uuid_unique() {
        assert_ne!(ReminderUuid::new(), ReminderUuid::new());
    }

    #[test]
    fn test_reminder_uuid_parse() {
        let id = ReminderUuid::new();
        let parsed: ReminderUuid = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_repeat_rule_parse() {
        assert_eq!("Daily".parse::<RepeatRule>().unwrap(), RepeatRule::Daily);
        assert!("weekly".parse::<RepeatRule>().is_err());
    }

    #[test]
    fn test_weekday_mask_monday_first() {
        let mask = WeekdayMask::of(&[Weekday::Mon, Weekday::Sun]);
        assert_eq!(mask.bits(), 0b100_0001);
        assert_eq!(mask.days(), [true, false, false, false, false, false, true]);
        assert_eq!(mask.to_string(), "M-----S");
        assert!(WeekdayMask::from_bits(0x80).is_err());
        assert_eq!(WeekdayMask::from_days(mask.days()), mask);
    }

    #[test]
    fn test_weekday_mask_serializes_as_flags() {
        let json = serde_json::to_string(&WeekdayMask::WORKDAYS).unwrap();
        assert_eq!(json, "[true,true,true,true,true,false,false]");
        let back: WeekdayMask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, WeekdayMask::WORKDAYS);
    }

    #[test]
    fn test_validate_once_must_be_future() {
        let past = Reminder::once("Stand up", now() - chrono::Duration::minutes(1), now());
        assert!(past.validate().is_ok());
        assert!(past.validate_new(now()).is_err());

        let future = Reminder::once("Stand up", now() + chrono::Duration::minutes(10), now());
        assert!(future.validate_new(now()).is_ok());
    }

    #[test]
    fn test_validate_time_of_day_range() {
        assert!(Reminder::daily("Water", 0, now()).validate().is_ok());
        assert!(Reminder::daily("Water", SECONDS_PER_DAY - 1, now())
            .validate()
            .is_ok());
        assert!(Reminder::daily("Water", SECONDS_PER_DAY, now())
            .validate()
            .is_err());
        assert!(Reminder::daily("", 60, now()).validate().is_err());
    }

    #[test]
    fn test_validate_custom_needs_weekday() {
        let empty = Reminder::custom("Gym", 3_600, WeekdayMask::default(), now());
        assert!(matches!(
            empty.validate(),
            Err(Error::InvalidRecurrence(_))
        ));
        let gym = Reminder::custom("Gym", 3_600, WeekdayMask::WORKDAYS, now());
        assert!(gym.validate().is_ok());
    }
}
