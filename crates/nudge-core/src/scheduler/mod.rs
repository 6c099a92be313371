//! Notification scheduler.
//!
//! Turns due reminders into displayed notifications and reacts to the
//! user's answers. [`Scheduler::spawn`] starts the loops:
//!
//! - the poll loop enqueues reminders due within the next poll interval
//! - the dispatcher drains the queue and calls [`Scheduler::notify`]
//! - the event loop applies acknowledge/delay actions from the transport
//! - the cleanup loop prunes old notifications
//!
//! All of them stop when the scheduler's cancellation token fires.

mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::GatewayPool;
use crate::error::Result;
use crate::models::{Notification, Reminder, RepeatRule};
use crate::recurrence::{due_next, due_prev};

pub use transport::{
    NotificationAction, NotificationHandle, NotificationTransport, OutgoingNotification,
    TransportError, TransportEvent, TransportEventKind,
};

/// Undisplayed occurrences younger than this are retried by the poll loop.
const MISSED_DISPATCH_WINDOW_SECS: i64 = 3_600;

/// Scheduler timings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Poll period, also how far ahead reminders count as due
    pub poll_interval: Duration,
    /// How long "Delay" postpones an occurrence
    pub delay: Duration,
    /// Reminders waiting for dispatch before the poll loop backs off
    pub queue_capacity: usize,
    /// Period of the stale notification cleanup
    pub cleanup_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            delay: Duration::from_secs(300),
            queue_capacity: 64,
            cleanup_interval: Duration::from_secs(3_600),
        }
    }
}

impl SchedulerConfig {
    fn horizon(&self) -> chrono::Duration {
        to_chrono(self.poll_interval)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Reminder ids waiting for dispatch, deduplicated.
struct DispatchQueue {
    tx: mpsc::Sender<i64>,
    queued: Mutex<HashSet<i64>>,
    /// Delayed notifications, held back until their timer fires
    snoozed: Mutex<HashSet<i64>>,
}

impl DispatchQueue {
    /// Queue `reminder_id` unless it is already waiting.
    ///
    /// Waits for room when the queue is full, so a slow dispatcher holds the
    /// poll loop back.
    async fn push(&self, reminder_id: i64) -> bool {
        let inserted = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reminder_id);
        if !inserted {
            return false;
        }
        if self.tx.send(reminder_id).await.is_err() {
            warn!(reminder_id, "dispatch queue closed");
            self.done(reminder_id);
            return false;
        }
        true
    }

    fn done(&self, reminder_id: i64) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&reminder_id);
    }

    fn snooze(&self, notification_id: i64) {
        self.snoozed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(notification_id);
    }

    fn is_snoozed(&self, notification_id: i64) -> bool {
        self.snoozed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&notification_id)
    }

    /// Release a delayed notification and queue its reminder.
    async fn wake(&self, notification_id: i64, reminder_id: i64) {
        self.snoozed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&notification_id);
        self.push(reminder_id).await;
    }
}

struct SchedulerInner {
    pool: GatewayPool,
    transport: Arc<dyn NotificationTransport>,
    config: SchedulerConfig,
    queue: Arc<DispatchQueue>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<i64>>,
    /// Displayed notifications awaiting an answer, by transport handle
    handles: Mutex<HashMap<NotificationHandle, i64>>,
    /// Deadline of the previous poll; occurrences up to it were queued
    covered_until: Mutex<Option<DateTime<Utc>>>,
    /// Serializes dispatch with action handling
    serial: tokio::sync::Mutex<()>,
    delayed: tokio::sync::Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

/// Drives reminders through pending, displayed and acknowledged.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler. Nothing runs until [`Scheduler::spawn`].
    pub fn new(
        pool: GatewayPool,
        transport: Arc<dyn NotificationTransport>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(SchedulerInner {
                pool,
                transport,
                config,
                queue: Arc::new(DispatchQueue {
                    tx,
                    queued: Mutex::new(HashSet::new()),
                    snoozed: Mutex::new(HashSet::new()),
                }),
                queue_rx: tokio::sync::Mutex::new(rx),
                handles: Mutex::new(HashMap::new()),
                covered_until: Mutex::new(None),
                serial: tokio::sync::Mutex::new(()),
                delayed: tokio::sync::Mutex::new(JoinSet::new()),
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Handles currently awaiting an answer, with their notification ids.
    pub fn live_handles(&self) -> Vec<(NotificationHandle, i64)> {
        let mut live: Vec<_> = self
            .handles()
            .iter()
            .map(|(handle, id)| (*handle, *id))
            .collect();
        live.sort_unstable();
        live
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<NotificationHandle, i64>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn covered_until(&self) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
        self.inner
            .covered_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget handles whose notification was acknowledged or deleted
    /// outside the event path, e.g. by finishing or deleting the reminder.
    async fn prune_handles(&self) -> Result<()> {
        let _serial = self.inner.serial.lock().await;
        if self.handles().is_empty() {
            return Ok(());
        }
        let pending: HashSet<i64> = self
            .inner
            .pool
            .run(|gateway| gateway.get_all_pending_notifications())
            .await?
            .into_iter()
            .map(|notification| notification.id)
            .collect();
        let mut handles = self.handles();
        let before = handles.len();
        handles.retain(|_, notification_id| pending.contains(notification_id));
        let pruned = before - handles.len();
        if pruned > 0 {
            debug!(pruned, "dropped handles of resolved notifications");
        }
        Ok(())
    }

    fn is_live(&self, notification_id: i64) -> bool {
        self.handles().values().any(|id| *id == notification_id)
    }

    /// Start the poll, dispatch, event and cleanup loops.
    pub fn spawn(&self, events: mpsc::Receiver<TransportEvent>) -> Vec<JoinHandle<()>> {
        info!(
            poll_secs = self.inner.config.poll_interval.as_secs(),
            delay_secs = self.inner.config.delay.as_secs(),
            "scheduler started"
        );
        vec![
            tokio::spawn(self.clone().poll_loop()),
            tokio::spawn(self.clone().dispatch_loop()),
            tokio::spawn(self.clone().event_loop(events)),
            tokio::spawn(self.clone().cleanup_loop()),
        ]
    }

    async fn poll_loop(self) {
        let cancel = self.inner.cancel.clone();
        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            // A full queue blocks the poll, so it has to race the token too
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("poll loop cancelled");
                    break;
                }
                _ = interval.tick() => {}
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("poll loop cancelled");
                    break;
                }
                result = self.poll() => {
                    if let Err(error) = result {
                        error!(%error, "poll failed");
                    }
                }
            }
        }
    }

    async fn dispatch_loop(self) {
        let cancel = self.inner.cancel.clone();
        let mut rx = self.inner.queue_rx.lock().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("dispatcher cancelled");
                    break;
                }
                next = rx.recv() => {
                    let Some(reminder_id) = next else { break };
                    self.dispatch(reminder_id).await;
                }
            }
        }
    }

    async fn event_loop(self, mut events: mpsc::Receiver<TransportEvent>) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("transport event loop cancelled");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("transport event channel closed");
                        break;
                    };
                    if let Err(error) = self.handle_event(event).await {
                        error!(handle = %event.handle, %error, "failed to handle transport event");
                    }
                }
            }
        }
    }

    async fn cleanup_loop(self) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.inner.config.cleanup_interval) => {
                    if let Err(error) = self.inner.pool.run(|gateway| gateway.cleanup_stale_notifications()).await {
                        warn!(%error, "notification cleanup failed");
                    }
                }
            }
        }
    }

    /// One poll cycle: queue every reminder due within the poll interval,
    /// reminders whose occurrence fell between the previous poll window and
    /// now, and reminders with a recent occurrence that was never displayed.
    ///
    /// Returns how many reminders were newly queued.
    pub async fn poll(&self) -> Result<usize> {
        self.prune_handles().await?;

        let horizon = self.inner.config.horizon();
        let covered_until = *self.covered_until();
        let (due, deadline) = self
            .inner
            .pool
            .run(move |gateway| {
                let now = gateway.now();
                let deadline = now + horizon;
                let missed_since = now - chrono::Duration::seconds(MISSED_DISPATCH_WINDOW_SECS);

                let mut ids: Vec<i64> = gateway
                    .get_pending_reminders(deadline)?
                    .into_iter()
                    .filter_map(|reminder| reminder.id)
                    .collect();
                if let Some(since) = covered_until {
                    for reminder in gateway.get_missed_reminders(since)? {
                        if let Some(id) = reminder.id.filter(|id| !ids.contains(id)) {
                            ids.push(id);
                        }
                    }
                }
                for notification in gateway.get_all_pending_notifications()? {
                    let missed = notification.displayed.is_none()
                        && notification.timestamp <= deadline
                        && notification.timestamp >= missed_since;
                    if missed && !ids.contains(&notification.reminder_id) {
                        ids.push(notification.reminder_id);
                    }
                }
                Ok((ids, deadline))
            })
            .await?;
        *self.covered_until() = Some(deadline);

        let mut queued = 0;
        for reminder_id in due {
            if self.inner.queue.push(reminder_id).await {
                queued += 1;
            }
        }
        if queued > 0 {
            debug!(queued, "reminders queued for dispatch");
        }
        Ok(queued)
    }

    /// Dispatch everything currently queued. Returns notifications sent.
    pub async fn dispatch_queued(&self) -> usize {
        let mut sent = 0;
        loop {
            let next = self.inner.queue_rx.lock().await.try_recv();
            let Ok(reminder_id) = next else { break };
            sent += self.dispatch(reminder_id).await;
        }
        sent
    }

    async fn dispatch(&self, reminder_id: i64) -> usize {
        let sent = match self.notify(reminder_id).await {
            Ok(sent) => sent,
            Err(error) => {
                warn!(reminder_id, %error, "dispatch failed, retrying next poll");
                0
            }
        };
        self.inner.queue.done(reminder_id);
        sent
    }

    /// Show the imminent occurrences of one reminder.
    ///
    /// Looks at the next occurrence and the most recent one, creating their
    /// notification rows if needed, and sends every unacknowledged one due
    /// within the poll interval that isn't already on screen. Returns how
    /// many were sent.
    pub async fn notify(&self, reminder_id: i64) -> Result<usize> {
        let horizon = self.inner.config.horizon();
        let _serial = self.inner.serial.lock().await;
        let (reminder, due) = self
            .inner
            .pool
            .run(move |gateway| {
                let reminder = gateway.get_reminder_by_id(reminder_id)?;
                if reminder.finished {
                    return Ok((reminder, Vec::new()));
                }
                let now = gateway.now();
                let due = occurrences(&reminder, now)?
                    .into_iter()
                    .map(|occurrence| gateway.add_notification(reminder_id, occurrence))
                    .collect::<Result<Vec<Notification>>>()?
                    .into_iter()
                    .filter(|n| n.is_pending() && n.timestamp <= now + horizon)
                    .collect::<Vec<_>>();
                Ok((reminder, due))
            })
            .await?;

        let mut sent = 0;
        for notification in due {
            if self.is_live(notification.id) || self.inner.queue.is_snoozed(notification.id) {
                continue;
            }
            let outgoing = OutgoingNotification::for_occurrence(&reminder, &notification);
            let handle = match self.inner.transport.send(&outgoing).await {
                Ok(handle) => handle,
                Err(error) => {
                    warn!(reminder_id, notification_id = notification.id, %error, "failed to send notification");
                    continue;
                }
            };
            self.handles().insert(handle, notification.id);

            let notification_id = notification.id;
            self.inner
                .pool
                .run(move |gateway| gateway.mark_displayed(notification_id, gateway.now()))
                .await?;
            info!(reminder_id, notification_id, %handle, "notification displayed");
            sent += 1;
        }
        Ok(sent)
    }

    /// Apply one event from the transport.
    ///
    /// Events for unknown handles are logged and ignored; transports may
    /// repeat or deliver them late. A notification closed without an answer
    /// is shown again after the delay, with its schedule untouched.
    pub async fn handle_event(&self, event: TransportEvent) -> Result<()> {
        let _serial = self.inner.serial.lock().await;
        let removed = self.handles().remove(&event.handle);
        let Some(notification_id) = removed else {
            warn!(handle = %event.handle, kind = ?event.kind, "event for unknown handle ignored");
            return Ok(());
        };

        match event.kind {
            TransportEventKind::Action(NotificationAction::Acknowledge) => {
                self.acknowledge(notification_id).await
            }
            TransportEventKind::Action(NotificationAction::Delay) => {
                self.delay(notification_id).await
            }
            TransportEventKind::Closed => self.closed(notification_id).await,
        }
    }

    async fn closed(&self, notification_id: i64) -> Result<()> {
        let notification = match self
            .inner
            .pool
            .run(move |gateway| gateway.get_notification_by_id(notification_id))
            .await
        {
            Ok(notification) => notification,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => return Err(error),
        };
        debug!(notification_id, "notification closed without an action");
        if notification.is_pending() {
            self.schedule_redispatch(notification.reminder_id, notification_id)
                .await;
        }
        Ok(())
    }

    async fn acknowledge(&self, notification_id: i64) -> Result<()> {
        self.inner
            .pool
            .run(move |gateway| {
                let notification = gateway.get_notification_by_id(notification_id)?;
                let reminder = gateway.get_reminder_by_id(notification.reminder_id)?;
                let now = gateway.now();
                let scope = gateway.transaction()?;
                if reminder.repeat == RepeatRule::Once {
                    scope.set_finished(notification.reminder_id, true)?;
                }
                scope.mark_acknowledged(notification_id, now)?;
                scope.commit()
            })
            .await?;
        info!(notification_id, "notification acknowledged");
        Ok(())
    }

    async fn delay(&self, notification_id: i64) -> Result<()> {
        let delay = to_chrono(self.inner.config.delay);
        let redispatch = self
            .inner
            .pool
            .run(move |gateway| {
                let notification = gateway.get_notification_by_id(notification_id)?;
                let reminder = gateway.get_reminder_by_id(notification.reminder_id)?;
                if reminder.repeat == RepeatRule::Once {
                    let postponed = postpone(&reminder, gateway.now(), delay);
                    gateway.set_timestamp(notification.reminder_id, postponed)?;
                    Ok(None)
                } else {
                    Ok(Some(notification.reminder_id))
                }
            })
            .await?;

        if let Some(reminder_id) = redispatch {
            self.schedule_redispatch(reminder_id, notification_id).await;
        }
        Ok(())
    }

    /// Queue `reminder_id` again once the delay has elapsed, holding back
    /// `notification_id` until then.
    async fn schedule_redispatch(&self, reminder_id: i64, notification_id: i64) {
        let queue = Arc::clone(&self.inner.queue);
        queue.snooze(notification_id);
        let cancel = self.inner.cancel.child_token();
        let delay = self.inner.config.delay;
        let mut delayed = self.inner.delayed.lock().await;
        // Reap finished timers so the set doesn't grow unbounded
        while delayed.try_join_next().is_some() {}
        delayed.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => debug!(reminder_id, "delayed dispatch cancelled"),
                () = tokio::time::sleep(delay) => queue.wake(notification_id, reminder_id).await,
            }
        });
        debug!(reminder_id, delay_secs = delay.as_secs(), "dispatch delayed");
    }

    /// Wait until every pending delayed dispatch has fired or been cancelled.
    pub async fn join_delayed(&self) {
        let mut delayed = self.inner.delayed.lock().await;
        while delayed.join_next().await.is_some() {}
    }

    /// Stop all loops and drop pending delayed dispatches.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.delayed.lock().await.shutdown().await;
        info!("scheduler stopped");
    }
}

/// The next occurrence and, when it differs and happened after the last
/// edit, the most recent one.
fn occurrences(reminder: &Reminder, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
    let next = due_next(reminder, now)?;
    let prev = due_prev(reminder, now)?;
    let mut instants = vec![next];
    if prev != next && prev > reminder.changed {
        instants.push(prev);
    }
    Ok(instants)
}

/// New instant for a delayed one-shot reminder: `delay` after the stored
/// instant, or after `now` when the stored instant already passed.
fn postpone(reminder: &Reminder, now: DateTime<Utc>, delay: chrono::Duration) -> i64 {
    let base = reminder.timestamp.max(now.timestamp());
    base + delay.num_seconds()
}
