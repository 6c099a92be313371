//! Notification transport that only logs.
//!
//! Used when no desktop notification service is wired in. A GUI answers
//! through `/notification/{handle}/{action}` instead.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use nudge_core::scheduler::{
    NotificationHandle, NotificationTransport, OutgoingNotification, TransportError,
};

#[derive(Debug, Default)]
pub struct LogTransport {
    next_handle: AtomicU64,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(
        &self,
        notification: &OutgoingNotification,
    ) -> Result<NotificationHandle, TransportError> {
        let handle = NotificationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let actions: Vec<&str> = notification
            .actions
            .iter()
            .map(|action| action.label())
            .collect();
        tracing::info!(
            %handle,
            reminder_id = notification.reminder_id,
            notification_id = notification.notification_id,
            title = %notification.title,
            occurrence = %notification.occurrence,
            ?actions,
            "reminder due"
        );
        Ok(handle)
    }
}
