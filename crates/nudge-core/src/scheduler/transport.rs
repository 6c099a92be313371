//! Notification transport seam
//!
//! The scheduler hands notifications to a [`NotificationTransport`] and
//! later receives [`TransportEvent`]s for the handles it issued, on a
//! separate channel.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Notification, Reminder};

/// Opaque id the transport assigns to one displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationHandle(pub u64);

impl fmt::Display for NotificationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NotificationHandle {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// User actions offered on every notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    Acknowledge,
    Delay,
}

impl NotificationAction {
    /// Both actions, in display order.
    pub const ALL: [Self; 2] = [Self::Acknowledge, Self::Delay];

    /// Button label
    pub const fn label(self) -> &'static str {
        match self {
            Self::Acknowledge => "Acknowledge",
            Self::Delay => "Delay",
        }
    }
}

impl FromStr for NotificationAction {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acknowledge" | "ack" => Ok(Self::Acknowledge),
            "delay" | "snooze" => Ok(Self::Delay),
            other => Err(TransportError::UnknownAction(other.to_string())),
        }
    }
}

/// What happened to a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEventKind {
    /// The user picked an action
    Action(NotificationAction),
    /// The notification went away without an action
    Closed,
}

/// Inbound event for a handle previously returned by `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportEvent {
    pub handle: NotificationHandle,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub const fn action(handle: NotificationHandle, action: NotificationAction) -> Self {
        Self {
            handle,
            kind: TransportEventKind::Action(action),
        }
    }

    pub const fn closed(handle: NotificationHandle) -> Self {
        Self {
            handle,
            kind: TransportEventKind::Closed,
        }
    }
}

/// A notification ready to be shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingNotification {
    pub reminder_id: i64,
    pub notification_id: i64,
    pub title: String,
    pub body: String,
    pub occurrence: DateTime<Utc>,
    pub actions: Vec<NotificationAction>,
}

impl OutgoingNotification {
    /// Notification for one occurrence of `reminder`, offering every action.
    pub fn for_occurrence(reminder: &Reminder, notification: &Notification) -> Self {
        Self {
            reminder_id: notification.reminder_id,
            notification_id: notification.id,
            title: reminder.title.clone(),
            body: reminder.description.clone(),
            occurrence: notification.timestamp,
            actions: NotificationAction::ALL.to_vec(),
        }
    }
}

/// Notification transport failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The notification service can't be reached
    #[error("notification service unavailable: {0}")]
    Unavailable(String),

    /// The notification service refused the notification
    #[error("notification rejected: {0}")]
    Rejected(String),

    /// An action name no transport offers
    #[error("unknown notification action: {0}")]
    UnknownAction(String),
}

/// Shows notifications to the user.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Display `notification` and return the handle later events refer to.
    async fn send(
        &self,
        notification: &OutgoingNotification,
    ) -> Result<NotificationHandle, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse() {
        assert_eq!(
            "Acknowledge".parse::<NotificationAction>().unwrap(),
            NotificationAction::Acknowledge
        );
        assert_eq!(
            "delay".parse::<NotificationAction>().unwrap(),
            NotificationAction::Delay
        );
        assert_eq!(
            "dismiss".parse::<NotificationAction>().unwrap_err(),
            TransportError::UnknownAction("dismiss".into())
        );
    }

    #[test]
    fn test_handle_parse() {
        assert_eq!(" 42".parse::<NotificationHandle>().unwrap(), NotificationHandle(42));
        assert!("x".parse::<NotificationHandle>().is_err());
    }
}
