//! Notification operations of the gateway

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use crate::clock::truncate_to_minute;
use crate::error::{Error, Result};
use crate::models::Notification;

use super::connection::{secs_to_instant, Gateway};

/// Days resolved or never-shown notifications are kept.
pub const NOTIFICATION_RETENTION_DAYS: i64 = 7;

const NOTIFICATION_COLUMNS: &str = "id, reminder_id, timestamp, displayed, acknowledged";

impl Gateway {
    /// Ensure a notification exists for one occurrence and return it.
    ///
    /// `occurrence` is truncated to the minute. Adding the same
    /// `(reminder, occurrence)` twice returns the existing row.
    pub fn add_notification(
        &self,
        reminder_id: i64,
        occurrence: DateTime<Utc>,
    ) -> Result<Notification> {
        let timestamp = truncate_to_minute(occurrence).timestamp();
        self.write(|conn| {
            let inserted = conn.execute(
                "INSERT INTO notification (reminder_id, timestamp) VALUES (?1, ?2)
                 ON CONFLICT (reminder_id, timestamp) DO NOTHING",
                params![reminder_id, timestamp],
            )?;
            if inserted > 0 {
                tracing::debug!(reminder_id, timestamp, "notification created");
            }
            conn.query_row(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notification
                     WHERE reminder_id = ?1 AND timestamp = ?2"
                ),
                params![reminder_id, timestamp],
                parse_notification,
            )
        })
    }

    /// Record when a notification was first shown.
    pub fn mark_displayed(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let affected = self.write(|conn| {
            conn.execute(
                "UPDATE notification SET displayed = COALESCE(displayed, ?1) WHERE id = ?2",
                params![at.timestamp(), id],
            )
        })?;
        if affected == 0 {
            return Err(notification_not_found(id));
        }
        Ok(())
    }

    /// Record the user's confirmation. Implies displayed.
    pub fn mark_acknowledged(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let affected = self.write(|conn| {
            conn.execute(
                "UPDATE notification
                 SET displayed = COALESCE(displayed, ?1), acknowledged = COALESCE(acknowledged, ?1)
                 WHERE id = ?2",
                params![at.timestamp(), id],
            )
        })?;
        if affected == 0 {
            return Err(notification_not_found(id));
        }
        Ok(())
    }

    pub fn get_notification_by_id(&self, id: i64) -> Result<Notification> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {NOTIFICATION_COLUMNS} FROM notification WHERE id = ?1"),
                [id],
                parse_notification,
            )
            .optional()
        })?
        .ok_or_else(|| notification_not_found(id))
    }

    /// All notifications of a reminder, oldest occurrence first.
    pub fn get_notifications_for_reminder(&self, reminder_id: i64) -> Result<Vec<Notification>> {
        self.read(|conn| {
            query_notifications(
                conn,
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notification
                     WHERE reminder_id = ?1 ORDER BY timestamp"
                ),
                &[&reminder_id],
            )
        })
    }

    /// Unacknowledged notifications of a reminder, oldest occurrence first.
    pub fn get_pending_notifications_for_reminder(
        &self,
        reminder_id: i64,
    ) -> Result<Vec<Notification>> {
        self.read(|conn| {
            query_notifications(
                conn,
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notification
                     WHERE reminder_id = ?1 AND acknowledged IS NULL ORDER BY timestamp"
                ),
                &[&reminder_id],
            )
        })
    }

    pub fn get_all_pending_notifications(&self) -> Result<Vec<Notification>> {
        self.read(|conn| {
            query_notifications(
                conn,
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notification
                     WHERE acknowledged IS NULL ORDER BY timestamp, id"
                ),
                &[],
            )
        })
    }

    /// Remove notifications past the retention window that were either
    /// acknowledged or never shown. Returns the number removed.
    pub fn cleanup_stale_notifications(&self) -> Result<usize> {
        let cutoff = (self.now() - Duration::days(NOTIFICATION_RETENTION_DAYS)).timestamp();
        let removed = self.write(|conn| {
            conn.execute(
                "DELETE FROM notification
                 WHERE timestamp < ?1 AND (acknowledged IS NOT NULL OR displayed IS NULL)",
                [cutoff],
            )
        })?;
        if removed > 0 {
            tracing::info!(removed, "cleaned up stale notifications");
        }
        Ok(removed)
    }
}

fn notification_not_found(id: i64) -> Error {
    Error::NotFound(format!("notification {id}"))
}

fn query_notifications(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> rusqlite::Result<Vec<Notification>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, parse_notification)?;
    rows.collect()
}

fn parse_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let displayed: Option<i64> = row.get(3)?;
    let acknowledged: Option<i64> = row.get(4)?;
    Ok(Notification {
        id: row.get(0)?,
        reminder_id: row.get(1)?,
        timestamp: secs_to_instant(2, row.get(2)?)?,
        displayed: displayed.map(|secs| secs_to_instant(3, secs)).transpose()?,
        acknowledged: acknowledged
            .map(|secs| secs_to_instant(4, secs))
            .transpose()?,
    })
}
