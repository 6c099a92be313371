//! nudge-core - Core library for Nudge
//!
//! This crate contains the models, recurrence rules, storage gateway,
//! notification scheduler, peer directory and replica synchronization used
//! by the `nudged` daemon.

pub mod clock;
pub mod db;
pub mod error;
pub mod models;
pub mod peers;
pub mod recurrence;
pub mod scheduler;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use models::{Envelope, Notification, Peer, Reminder, ReminderUuid, RepeatRule, WeekdayMask};
