//! Data models for Nudge

mod envelope;
mod notification;
mod peer;
mod reminder;

pub use envelope::Envelope;
pub use notification::{Notification, NotificationState};
pub use peer::Peer;
pub use reminder::{Reminder, ReminderUuid, RepeatRule, WeekdayMask, SECONDS_PER_DAY};
