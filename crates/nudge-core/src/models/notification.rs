//! Notification model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle position of one occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationState {
    /// Row exists, never shown
    Pending,
    /// Shown to the user, not yet confirmed
    Displayed,
    /// Confirmed by the user or resolved with its reminder
    Acknowledged,
}

/// One scheduled or displayed occurrence of a reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Local surrogate key
    pub id: i64,
    /// Owning reminder
    pub reminder_id: i64,
    /// Occurrence instant, truncated to the minute
    pub timestamp: DateTime<Utc>,
    /// First time the occurrence was shown
    pub displayed: Option<DateTime<Utc>>,
    /// Time the user confirmed it
    pub acknowledged: Option<DateTime<Utc>>,
}

impl Notification {
    /// Current lifecycle state derived from the timestamps.
    pub const fn state(&self) -> NotificationState {
        match (self.displayed, self.acknowledged) {
            (_, Some(_)) => NotificationState::Acknowledged,
            (Some(_), None) => NotificationState::Displayed,
            (None, None) => NotificationState::Pending,
        }
    }

    /// Not yet acknowledged.
    pub const fn is_pending(&self) -> bool {
        self.acknowledged.is_none()
    }
}
