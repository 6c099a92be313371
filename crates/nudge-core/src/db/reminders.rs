//! Reminder operations of the gateway

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use crate::error::{Error, Result};
use crate::models::{Reminder, ReminderUuid, RepeatRule, WeekdayMask, SECONDS_PER_DAY};
use crate::recurrence;

use super::connection::{conversion_error, millis_to_instant, Gateway};

const REMINDER_COLUMNS: &str = "id, uuid, title, description, timestamp, repeat_rule, \
     weekday_mask, repeat_counter, repeat_limit, finished, changed";

impl Gateway {
    /// Insert a reminder as given and return the stored row.
    ///
    /// `changed` and `finished` are copied verbatim so that merge replay keeps
    /// the remote's values.
    pub fn add_reminder(&self, reminder: &Reminder) -> Result<Reminder> {
        reminder.validate()?;
        let id = self.write(|conn| {
            conn.execute(
                "INSERT INTO reminder (uuid, title, description, timestamp, repeat_rule,
                    weekday_mask, repeat_counter, repeat_limit, finished, changed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    reminder.uuid.as_str(),
                    reminder.title,
                    reminder.description,
                    reminder.timestamp,
                    reminder.repeat.as_str(),
                    reminder.weekdays.bits(),
                    reminder.repeat_counter,
                    reminder.repeat_limit,
                    i32::from(reminder.finished),
                    reminder.changed.timestamp_millis(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::debug!(reminder_id = id, uuid = %reminder.uuid, "reminder added");
        self.get_reminder_by_id(id)
    }

    /// Delete a reminder and, by cascade, its notifications.
    pub fn delete_reminder(&self, id: i64) -> Result<()> {
        let affected = self.write(|conn| conn.execute("DELETE FROM reminder WHERE id = ?1", [id]))?;
        if affected == 0 {
            return Err(reminder_not_found(id));
        }
        tracing::debug!(reminder_id = id, "reminder deleted");
        Ok(())
    }

    /// Fetch one reminder by local id.
    pub fn get_reminder_by_id(&self, id: i64) -> Result<Reminder> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {REMINDER_COLUMNS} FROM reminder WHERE id = ?1"),
                [id],
                parse_reminder,
            )
            .optional()
        })?
        .ok_or_else(|| reminder_not_found(id))
    }

    /// Fetch one reminder by global identity, if present.
    pub fn get_reminder_by_uuid(&self, uuid: &ReminderUuid) -> Result<Option<Reminder>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {REMINDER_COLUMNS} FROM reminder WHERE uuid = ?1"),
                [uuid.as_str()],
                parse_reminder,
            )
            .optional()
        })
    }

    /// Every reminder, in insertion order.
    pub fn get_all_reminders(&self) -> Result<Vec<Reminder>> {
        self.read(|conn| {
            query_reminders(
                conn,
                &format!("SELECT {REMINDER_COLUMNS} FROM reminder ORDER BY id"),
                &[],
            )
        })
    }

    /// Unfinished reminders whose next occurrence is at or before `deadline`.
    ///
    /// Reminders with a recurrence that can't produce an occurrence are
    /// logged and left out so they never block the rest.
    pub fn get_pending_reminders(&self, deadline: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let now = self.now();
        self.unfinished_where(|reminder| {
            recurrence::due_next(reminder, now).map(|next| next <= deadline)
        })
    }

    /// Unfinished reminders whose most recent occurrence falls after `since`
    /// and no later than now.
    ///
    /// Catches occurrences that slipped between two poll windows.
    pub fn get_missed_reminders(&self, since: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let now = self.now();
        self.unfinished_where(|reminder| {
            recurrence::due_prev(reminder, now).map(|prev| prev > since && prev <= now)
        })
    }

    fn unfinished_where(
        &self,
        keep: impl Fn(&Reminder) -> Result<bool>,
    ) -> Result<Vec<Reminder>> {
        let unfinished = self.read(|conn| {
            query_reminders(
                conn,
                &format!("SELECT {REMINDER_COLUMNS} FROM reminder WHERE finished = 0 ORDER BY id"),
                &[],
            )
        })?;

        let mut matching = Vec::new();
        for reminder in unfinished {
            match keep(&reminder) {
                Ok(true) => matching.push(reminder),
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(reminder_id = ?reminder.id, %error, "skipping reminder");
                }
            }
        }
        Ok(matching)
    }

    pub fn set_title(&self, id: i64, title: &str) -> Result<()> {
        if title.trim().is_empty() {
            return Err(Error::InvalidInput("title must not be empty".into()));
        }
        self.update_field(id, "title", &title)
    }

    pub fn set_description(&self, id: i64, description: &str) -> Result<()> {
        self.update_field(id, "description", &description)
    }

    /// Replace the stored instant (once) or time of day (recurring).
    pub fn set_timestamp(&self, id: i64, timestamp: i64) -> Result<()> {
        let current = self.get_reminder_by_id(id)?;
        validate_timestamp(current.repeat, timestamp)?;
        self.update_field(id, "timestamp", &timestamp)
    }

    /// Resolve or reopen a reminder. Resolving also acknowledges its
    /// pending notifications.
    pub fn set_finished(&self, id: i64, finished: bool) -> Result<()> {
        let now = self.now();
        let affected = self.write(|conn| {
            let affected = conn.execute(
                "UPDATE reminder SET finished = ?1, changed = ?2 WHERE id = ?3",
                params![i32::from(finished), now.timestamp_millis(), id],
            )?;
            if finished && affected > 0 {
                conn.execute(
                    "UPDATE notification
                     SET displayed = COALESCE(displayed, ?1), acknowledged = ?1
                     WHERE reminder_id = ?2 AND acknowledged IS NULL",
                    params![now.timestamp(), id],
                )?;
            }
            Ok(affected)
        })?;
        if affected == 0 {
            return Err(reminder_not_found(id));
        }
        Ok(())
    }

    /// Change the recurrence kind.
    ///
    /// The stored timestamp must already fit the new rule. Use
    /// [`Gateway::set_schedule`] to switch between once and recurring.
    pub fn set_repeat_rule(&self, id: i64, rule: RepeatRule) -> Result<()> {
        let current = self.get_reminder_by_id(id)?;
        require_weekdays(rule, current.weekdays)?;
        self.update_field(id, "repeat_rule", &rule.as_str())
    }

    /// Change recurrence kind and timestamp together.
    ///
    /// Needed whenever a reminder switches between an instant and a time of
    /// day, since the stored pair must stay consistent.
    pub fn set_schedule(&self, id: i64, rule: RepeatRule, timestamp: i64) -> Result<()> {
        validate_timestamp(rule, timestamp)?;
        let current = self.get_reminder_by_id(id)?;
        require_weekdays(rule, current.weekdays)?;
        let changed = self.now().timestamp_millis();
        let affected = self.write(|conn| {
            conn.execute(
                "UPDATE reminder SET repeat_rule = ?1, timestamp = ?2, changed = ?3 WHERE id = ?4",
                params![rule.as_str(), timestamp, changed, id],
            )
        })?;
        if affected == 0 {
            return Err(reminder_not_found(id));
        }
        Ok(())
    }

    /// Replace the active weekdays. A custom reminder keeps at least one.
    pub fn set_weekday_mask(&self, id: i64, mask: WeekdayMask) -> Result<()> {
        let current = self.get_reminder_by_id(id)?;
        require_weekdays(current.repeat, mask)?;
        self.update_field(id, "weekday_mask", &mask.bits())
    }

    pub fn set_repeat_counter(&self, id: i64, counter: u32) -> Result<()> {
        self.update_field(id, "repeat_counter", &counter)
    }

    pub fn set_repeat_limit(&self, id: i64, limit: Option<u32>) -> Result<()> {
        self.update_field(id, "repeat_limit", &limit)
    }

    /// Overwrite `changed` with a caller supplied instant. Merge replay only.
    pub fn set_changed(&self, id: i64, changed: DateTime<Utc>) -> Result<()> {
        let affected = self.write(|conn| {
            conn.execute(
                "UPDATE reminder SET changed = ?1 WHERE id = ?2",
                params![changed.timestamp_millis(), id],
            )
        })?;
        if affected == 0 {
            return Err(reminder_not_found(id));
        }
        Ok(())
    }

    /// Put a finished reminder back into rotation.
    pub fn reactivate(&self, id: i64) -> Result<()> {
        self.update_field(id, "finished", &0)
    }

    /// Set one column and stamp `changed` to now.
    fn update_field(&self, id: i64, column: &'static str, value: &dyn ToSql) -> Result<()> {
        let changed = self.now().timestamp_millis();
        let affected = self.write(|conn| {
            conn.execute(
                &format!("UPDATE reminder SET {column} = ?1, changed = ?2 WHERE id = ?3"),
                params![value, changed, id],
            )
        })?;
        if affected == 0 {
            return Err(reminder_not_found(id));
        }
        tracing::debug!(reminder_id = id, column, "reminder updated");
        Ok(())
    }
}

fn validate_timestamp(rule: RepeatRule, timestamp: i64) -> Result<()> {
    if rule.is_recurring() && !(0..SECONDS_PER_DAY).contains(&timestamp) {
        return Err(Error::InvalidInput(format!(
            "time of day {timestamp} must be in [0, {SECONDS_PER_DAY})"
        )));
    }
    if !rule.is_recurring() && timestamp < SECONDS_PER_DAY {
        return Err(Error::InvalidInput(format!(
            "timestamp {timestamp} is not an absolute instant"
        )));
    }
    Ok(())
}

/// A custom rule without an active day never fires.
fn require_weekdays(rule: RepeatRule, mask: WeekdayMask) -> Result<()> {
    if rule == RepeatRule::Custom && mask.is_empty() {
        return Err(Error::InvalidRecurrence(
            "custom recurrence needs at least one weekday".into(),
        ));
    }
    Ok(())
}

fn reminder_not_found(id: i64) -> Error {
    Error::NotFound(format!("reminder {id}"))
}

fn query_reminders(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> rusqlite::Result<Vec<Reminder>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, parse_reminder)?;
    rows.collect()
}

/// Parse a reminder from a row selected with `REMINDER_COLUMNS`
fn parse_reminder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    let uuid: String = row.get(1)?;
    let repeat: String = row.get(5)?;
    let mask: u8 = row.get(6)?;
    Ok(Reminder {
        id: Some(row.get(0)?),
        uuid: uuid
            .parse()
            .map_err(|e| conversion_error(1, Type::Text, e))?,
        title: row.get(2)?,
        description: row.get(3)?,
        timestamp: row.get(4)?,
        repeat: repeat
            .parse()
            .map_err(|e| conversion_error(5, Type::Text, e))?,
        weekdays: WeekdayMask::from_bits(mask).map_err(|e| conversion_error(6, Type::Integer, e))?,
        repeat_counter: row.get(7)?,
        repeat_limit: row.get(8)?,
        finished: row.get::<_, i32>(9)? != 0,
        changed: millis_to_instant(10, row.get(10)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::{Duration, TimeZone, Weekday};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    fn setup() -> (Gateway, ManualClock) {
        let clock = ManualClock::new(start());
        let gateway = Gateway::open_in_memory(Arc::new(clock.clone())).unwrap();
        (gateway, clock)
    }

    #[test]
    fn test_add_and_get() {
        let (gateway, clock) = setup();
        let reminder = Reminder::once("Dentist", start() + Duration::hours(2), clock.now())
            .with_description("Bring the card");

        let stored = gateway.add_reminder(&reminder).unwrap();
        assert!(stored.id.is_some());
        assert_eq!(
            Reminder {
                id: None,
                ..stored.clone()
            },
            reminder
        );

        let by_uuid = gateway.get_reminder_by_uuid(&reminder.uuid).unwrap().unwrap();
        assert_eq!(by_uuid, stored);
    }

    #[test]
    fn test_uuid_unique() {
        let (gateway, clock) = setup();
        let reminder = Reminder::daily("Water", 3_600, clock.now());
        gateway.add_reminder(&reminder).unwrap();
        let err = gateway.add_reminder(&reminder).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
    }

    #[test]
    fn test_invalid_reminder_rejected_before_storage() {
        let (gateway, clock) = setup();
        let reminder = Reminder::daily("Water", SECONDS_PER_DAY, clock.now());
        assert!(gateway.add_reminder(&reminder).unwrap_err().is_validation());
        assert!(gateway.get_all_reminders().unwrap().is_empty());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (gateway, _) = setup();
        assert!(gateway.get_reminder_by_id(42).unwrap_err().is_not_found());
        assert!(gateway.delete_reminder(42).unwrap_err().is_not_found());
        assert!(gateway.set_title(42, "x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_setters_stamp_changed() {
        let (gateway, clock) = setup();
        let id = gateway
            .add_reminder(&Reminder::daily("Water", 3_600, clock.now()))
            .unwrap()
            .require_id()
            .unwrap();

        clock.advance(Duration::minutes(5));
        gateway.set_title(id, "Water the plants").unwrap();
        gateway.set_description(id, "Balcony too").unwrap();
        gateway
            .set_weekday_mask(id, WeekdayMask::of(&[Weekday::Sat]))
            .unwrap();
        gateway.set_repeat_rule(id, RepeatRule::Custom).unwrap();
        gateway.set_repeat_counter(id, 2).unwrap();
        gateway.set_repeat_limit(id, Some(10)).unwrap();

        let stored = gateway.get_reminder_by_id(id).unwrap();
        assert_eq!(stored.title, "Water the plants");
        assert_eq!(stored.description, "Balcony too");
        assert_eq!(stored.repeat, RepeatRule::Custom);
        assert_eq!(stored.weekdays, WeekdayMask::of(&[Weekday::Sat]));
        assert_eq!(stored.repeat_counter, 2);
        assert_eq!(stored.repeat_limit, Some(10));
        assert_eq!(stored.changed, clock.now());

        let replayed = start() - Duration::days(3);
        gateway.set_changed(id, replayed).unwrap();
        assert_eq!(gateway.get_reminder_by_id(id).unwrap().changed, replayed);
    }

    #[test]
    fn test_set_timestamp_validates_against_rule() {
        let (gateway, clock) = setup();
        let id = gateway
            .add_reminder(&Reminder::daily("Water", 3_600, clock.now()))
            .unwrap()
            .require_id()
            .unwrap();
        assert!(gateway.set_timestamp(id, SECONDS_PER_DAY).is_err());
        gateway.set_timestamp(id, 7_200).unwrap();
        assert_eq!(gateway.get_reminder_by_id(id).unwrap().timestamp, 7_200);
    }

    #[test]
    fn test_empty_title_rejected() {
        let (gateway, clock) = setup();
        let id = gateway
            .add_reminder(&Reminder::daily("Water", 3_600, clock.now()))
            .unwrap()
            .require_id()
            .unwrap();
        assert!(gateway.set_title(id, "  ").unwrap_err().is_validation());
    }

    #[test]
    fn test_switching_rule_needs_fitting_timestamp() {
        let (gateway, clock) = setup();
        let id = gateway
            .add_reminder(&Reminder::once("Call", start() + Duration::hours(1), clock.now()))
            .unwrap()
            .require_id()
            .unwrap();
        let err = gateway.set_repeat_rule(id, RepeatRule::Daily).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));

        gateway.set_schedule(id, RepeatRule::Daily, 8 * 3_600).unwrap();
        let stored = gateway.get_reminder_by_id(id).unwrap();
        assert_eq!((stored.repeat, stored.timestamp), (RepeatRule::Daily, 8 * 3_600));
        assert!(gateway.set_schedule(id, RepeatRule::Once, 60).is_err());
    }

    #[test]
    fn test_custom_rule_keeps_a_weekday() {
        let (gateway, clock) = setup();
        let custom = gateway
            .add_reminder(&Reminder::custom(
                "Gym",
                18 * 3_600,
                WeekdayMask::of(&[Weekday::Mon]),
                clock.now(),
            ))
            .unwrap()
            .require_id()
            .unwrap();
        let err = gateway
            .set_weekday_mask(custom, WeekdayMask::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecurrence(_)));

        let daily = gateway
            .add_reminder(&Reminder::daily("Water", 3_600, clock.now()))
            .unwrap()
            .require_id()
            .unwrap();
        let err = gateway.set_repeat_rule(daily, RepeatRule::Custom).unwrap_err();
        assert!(matches!(err, Error::InvalidRecurrence(_)));
        let err = gateway
            .set_schedule(daily, RepeatRule::Custom, 7_200)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRecurrence(_)));

        // Rejected edits leave both rows schedulable
        for id in [custom, daily] {
            gateway.get_reminder_by_id(id).unwrap().validate().unwrap();
        }
        let pending = gateway
            .get_pending_reminders(clock.now() + Duration::days(8))
            .unwrap();
        assert_eq!(pending.len(), 2);

        // A daily reminder may drop its days freely
        gateway.set_weekday_mask(daily, WeekdayMask::default()).unwrap();
    }

    #[test]
    fn test_pending_reminders_respect_deadline() {
        let (gateway, clock) = setup();
        let soon = gateway
            .add_reminder(&Reminder::once("Soon", start() + Duration::minutes(10), clock.now()))
            .unwrap();
        gateway
            .add_reminder(&Reminder::once("Later", start() + Duration::hours(3), clock.now()))
            .unwrap();
        // 12:20 today
        let daily = gateway
            .add_reminder(&Reminder::daily("Daily", 12 * 3_600 + 20 * 60, clock.now()))
            .unwrap();
        let finished = gateway
            .add_reminder(&Reminder::once("Done", start() + Duration::minutes(5), clock.now()))
            .unwrap();
        gateway
            .set_finished(finished.require_id().unwrap(), true)
            .unwrap();

        let pending = gateway
            .get_pending_reminders(start() + Duration::minutes(30))
            .unwrap();
        let titles: Vec<_> = pending.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Soon", "Daily"]);
        assert_eq!(pending[0].id, soon.id);
        assert_eq!(pending[1].id, daily.id);
    }

    #[test]
    fn test_missed_reminders_since() {
        let (gateway, clock) = setup();
        // 12:20 every day
        let daily = gateway
            .add_reminder(&Reminder::daily("Daily", 12 * 3_600 + 20 * 60, clock.now()))
            .unwrap();
        gateway
            .add_reminder(&Reminder::daily("Evening", 20 * 3_600, clock.now()))
            .unwrap();

        clock.set(start() + Duration::minutes(20) + Duration::milliseconds(500));
        let since = start() + Duration::minutes(19) + Duration::seconds(59);
        let missed = gateway.get_missed_reminders(since).unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].id, daily.id);

        // Already covered by an earlier window
        let since = start() + Duration::minutes(20);
        assert!(gateway.get_missed_reminders(since).unwrap().is_empty());
    }

    #[test]
    fn test_delete_cascades_to_notifications() {
        let (gateway, clock) = setup();
        let id = gateway
            .add_reminder(&Reminder::daily("Water", 3_600, clock.now()))
            .unwrap()
            .require_id()
            .unwrap();
        gateway.add_notification(id, start()).unwrap();
        gateway.delete_reminder(id).unwrap();
        assert!(gateway.get_all_pending_notifications().unwrap().is_empty());
    }

    #[test]
    fn test_set_finished_acknowledges_pending_notifications() {
        let (gateway, clock) = setup();
        let id = gateway
            .add_reminder(&Reminder::once("Call", start() + Duration::minutes(1), clock.now()))
            .unwrap()
            .require_id()
            .unwrap();
        let notification = gateway.add_notification(id, start() + Duration::minutes(1)).unwrap();

        gateway.set_finished(id, true).unwrap();
        let stored = gateway.get_notification_by_id(notification.id).unwrap();
        assert_eq!(stored.acknowledged, Some(start()));
        assert_eq!(stored.displayed, Some(start()));

        gateway.reactivate(id).unwrap();
        assert!(!gateway.get_reminder_by_id(id).unwrap().finished);
    }
}
