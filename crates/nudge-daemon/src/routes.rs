use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use nudge_core::db::{Gateway, GatewayPool};
use nudge_core::peers::PeerDirectory;
use nudge_core::scheduler::{NotificationAction, NotificationHandle, Scheduler, TransportEvent};
use nudge_core::sync::SyncEngine;
use nudge_core::{
    Clock, Envelope, Notification, Peer, Reminder, ReminderUuid, RepeatRule, WeekdayMask,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::error::{AppError, Rejection, Tagged};

#[derive(Clone)]
pub struct AppState {
    pub pool: GatewayPool,
    pub scheduler: Scheduler,
    pub peers: Arc<PeerDirectory>,
    pub sync: SyncEngine,
    events: mpsc::Sender<TransportEvent>,
    request_ids: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        pool: GatewayPool,
        scheduler: Scheduler,
        peers: Arc<PeerDirectory>,
        sync: SyncEngine,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            pool,
            scheduler,
            peers,
            sync,
            events,
            request_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Next envelope id; strictly increasing for the life of the process.
    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

type Mutation = Result<Json<Envelope>, Rejection>;

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/reminder/add", post(add_reminder))
        .route("/reminder/pending", get(pending_reminders))
        .route("/reminder/all", get(all_reminders))
        .route("/reminder/{id}", get(get_reminder))
        .route("/reminder/{id}/update", get(update_reminder))
        .route("/reminder/{id}/reactivate", get(reactivate_reminder))
        .route("/reminder/{id}/delete", get(delete_reminder))
        .route("/reminder/{id}/set_finished/{flag}", get(set_finished))
        .route("/reminder/{id}/{field}", post(edit_field))
        .route("/notification/pending", get(pending_notifications))
        .route("/notification/{handle}/{action}", get(notification_action))
        .route("/peer/all", get(all_peers))
        .route("/sync/pull", get(sync_pull))
        .route("/sync/push", post(sync_push))
        .route("/sync/start", post(sync_start))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    peers: usize,
    live_notifications: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: state.pool.clock().now().timestamp(),
        peers: state.peers.all().len(),
        live_notifications: state.scheduler.live_handles().len(),
    })
}

#[derive(Debug, Deserialize)]
struct NewReminder {
    title: String,
    #[serde(default)]
    description: String,
    timestamp: i64,
    #[serde(default = "default_repeat")]
    repeat: RepeatRule,
    #[serde(default)]
    weekdays: WeekdayMask,
    #[serde(default)]
    repeat_limit: Option<u32>,
}

const fn default_repeat() -> RepeatRule {
    RepeatRule::Once
}

async fn add_reminder(State(state): State<AppState>, Json(request): Json<NewReminder>) -> Mutation {
    let id = state.next_request_id();
    let stored = state
        .pool
        .run(move |gateway| {
            let now = gateway.now();
            let reminder = Reminder {
                id: None,
                uuid: ReminderUuid::new(),
                title: request.title,
                description: request.description,
                timestamp: request.timestamp,
                repeat: request.repeat,
                weekdays: request.weekdays,
                repeat_counter: 0,
                repeat_limit: request.repeat_limit,
                finished: false,
                changed: now,
            };
            reminder.validate_new(now)?;
            gateway.add_reminder(&reminder)
        })
        .await
        .tagged(id)?;
    let reminder_id = stored.require_id().tagged(id)?;
    tracing::info!(reminder_id, uuid = %stored.uuid, "reminder created");
    Ok(Json(Envelope::ok(id, reminder_id.to_string())))
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    /// Unix seconds; defaults to now
    deadline: Option<i64>,
}

async fn pending_reminders(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<Reminder>>, AppError> {
    let deadline = match query.deadline {
        Some(secs) => DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| AppError::bad_request(format!("deadline {secs} out of range")))?,
        None => state.pool.clock().now(),
    };
    let reminders = state
        .pool
        .run(move |gateway| gateway.get_pending_reminders(deadline))
        .await?;
    Ok(Json(reminders))
}

async fn all_reminders(State(state): State<AppState>) -> Result<Json<Vec<Reminder>>, AppError> {
    Ok(Json(state.pool.run(|gateway| gateway.get_all_reminders()).await?))
}

async fn get_reminder(
    State(state): State<AppState>,
    Path(reminder_id): Path<i64>,
) -> Result<Json<Reminder>, AppError> {
    let reminder = state
        .pool
        .run(move |gateway| gateway.get_reminder_by_id(reminder_id))
        .await?;
    Ok(Json(reminder))
}

#[derive(Debug, Deserialize)]
struct FieldValue {
    value: serde_json::Value,
}

async fn edit_field(
    State(state): State<AppState>,
    Path((reminder_id, field)): Path<(i64, String)>,
    Json(body): Json<FieldValue>,
) -> Mutation {
    let id = state.next_request_id();
    let label = field.clone();
    state
        .pool
        .run(move |gateway| apply_field(gateway, reminder_id, &field, body.value))
        .await
        .tagged(id)?;
    Ok(Json(Envelope::ok(
        id,
        format!("reminder {reminder_id}: {label} updated"),
    )))
}

fn apply_field(
    gateway: &Gateway,
    reminder_id: i64,
    field: &str,
    value: serde_json::Value,
) -> nudge_core::Result<()> {
    let invalid = |expected: &str| {
        nudge_core::Error::InvalidInput(format!("{field} expects {expected}, got {value}"))
    };
    match field {
        "title" => gateway.set_title(reminder_id, value.as_str().ok_or_else(|| invalid("a string"))?),
        "description" => gateway.set_description(
            reminder_id,
            value.as_str().ok_or_else(|| invalid("a string"))?,
        ),
        "timestamp" => gateway.set_timestamp(
            reminder_id,
            value.as_i64().ok_or_else(|| invalid("an integer"))?,
        ),
        "repeat" => {
            let rule = value.as_str().ok_or_else(|| invalid("a rule name"))?.parse()?;
            gateway.set_repeat_rule(reminder_id, rule)
        }
        "weekdays" => gateway.set_weekday_mask(reminder_id, parse_weekdays(&value)?),
        "counter" => gateway.set_repeat_counter(
            reminder_id,
            as_u32(&value).ok_or_else(|| invalid("a non-negative integer"))?,
        ),
        "limit" => {
            let limit = if value.is_null() {
                None
            } else {
                Some(as_u32(&value).ok_or_else(|| invalid("a non-negative integer or null"))?)
            };
            gateway.set_repeat_limit(reminder_id, limit)
        }
        other => Err(nudge_core::Error::InvalidInput(format!(
            "unknown reminder field '{other}'"
        ))),
    }
}

/// Mask bits as a number, or seven Monday-first booleans.
fn parse_weekdays(value: &serde_json::Value) -> nudge_core::Result<WeekdayMask> {
    if let Some(bits) = value.as_u64() {
        let bits = u8::try_from(bits)
            .map_err(|_| nudge_core::Error::InvalidInput(format!("weekday mask {bits} out of range")))?;
        return WeekdayMask::from_bits(bits);
    }
    serde_json::from_value(value.clone()).map_err(|err| {
        nudge_core::Error::InvalidInput(format!("invalid weekday mask {value}: {err}"))
    })
}

fn as_u32(value: &serde_json::Value) -> Option<u32> {
    value.as_u64().and_then(|number| u32::try_from(number).ok())
}

#[derive(Debug, Default, Deserialize)]
struct UpdateQuery {
    title: Option<String>,
    description: Option<String>,
    repeat: Option<RepeatRule>,
    timestamp: Option<i64>,
    weekdays: Option<u8>,
    counter: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Default)]
struct UpdateOutcome {
    applied: Vec<&'static str>,
    rejected: Vec<String>,
}

/// Multi-field edit in one transaction.
///
/// Fields are grouped (text, schedule, counters) and every group runs in its
/// own savepoint, so a rejected group is undone without losing the others.
async fn update_reminder(
    State(state): State<AppState>,
    Path(reminder_id): Path<i64>,
    Query(query): Query<UpdateQuery>,
) -> Mutation {
    let id = state.next_request_id();
    let outcome = state
        .pool
        .run(move |gateway| update_in_groups(gateway, reminder_id, &query))
        .await
        .tagged(id)?;

    if outcome.rejected.is_empty() {
        let message = if outcome.applied.is_empty() {
            format!("reminder {reminder_id}: nothing to update")
        } else {
            format!("reminder {reminder_id}: updated {}", outcome.applied.join(", "))
        };
        return Ok(Json(Envelope::ok(id, message)));
    }
    Err(AppError::bad_request(format!(
        "reminder {reminder_id}: rejected {}; applied [{}]",
        outcome.rejected.join("; "),
        outcome.applied.join(", ")
    ))
    .tagged(id))
}

fn update_in_groups(
    gateway: &mut Gateway,
    reminder_id: i64,
    query: &UpdateQuery,
) -> nudge_core::Result<UpdateOutcome> {
    let mut scope = gateway.transaction()?;
    let current = scope.get_reminder_by_id(reminder_id)?;
    let mut outcome = UpdateOutcome::default();

    if query.title.is_some() || query.description.is_some() {
        in_savepoint(&mut scope, "text", &mut outcome, |gateway| {
            if let Some(title) = &query.title {
                gateway.set_title(reminder_id, title)?;
            }
            if let Some(description) = &query.description {
                gateway.set_description(reminder_id, description)?;
            }
            Ok(())
        })?;
    }

    if query.repeat.is_some() || query.timestamp.is_some() || query.weekdays.is_some() {
        in_savepoint(&mut scope, "schedule", &mut outcome, |gateway| {
            let weekdays = query.weekdays.map(WeekdayMask::from_bits).transpose()?;
            // Days go in before a switch to custom and come out after leaving it
            let days_first = weekdays.is_some_and(|mask| !mask.is_empty());
            if let Some(mask) = weekdays.filter(|_| days_first) {
                gateway.set_weekday_mask(reminder_id, mask)?;
            }
            match (query.repeat, query.timestamp) {
                (Some(rule), timestamp) => gateway.set_schedule(
                    reminder_id,
                    rule,
                    timestamp.unwrap_or(current.timestamp),
                )?,
                (None, Some(timestamp)) => gateway.set_timestamp(reminder_id, timestamp)?,
                (None, None) => {}
            }
            if let Some(mask) = weekdays.filter(|_| !days_first) {
                gateway.set_weekday_mask(reminder_id, mask)?;
            }
            let updated = gateway.get_reminder_by_id(reminder_id)?;
            updated.validate()
        })?;
    }

    if query.counter.is_some() || query.limit.is_some() {
        in_savepoint(&mut scope, "counters", &mut outcome, |gateway| {
            if let Some(counter) = query.counter {
                gateway.set_repeat_counter(reminder_id, counter)?;
            }
            if let Some(limit) = query.limit {
                gateway.set_repeat_limit(reminder_id, Some(limit))?;
            }
            Ok(())
        })?;
    }

    scope.commit()?;
    Ok(outcome)
}

/// Run `edit` inside savepoint `name`. Validation failures roll the savepoint
/// back and are recorded; anything else aborts the whole update.
fn in_savepoint(
    gateway: &mut Gateway,
    name: &'static str,
    outcome: &mut UpdateOutcome,
    edit: impl FnOnce(&Gateway) -> nudge_core::Result<()>,
) -> nudge_core::Result<()> {
    gateway.create_savepoint(name)?;
    match edit(gateway) {
        Ok(()) => {
            gateway.release_savepoint(name)?;
            outcome.applied.push(name);
        }
        Err(error) if error.is_validation() => {
            gateway.rollback_to_savepoint(name)?;
            tracing::debug!(savepoint = name, %error, "field group rejected");
            outcome.rejected.push(format!("{name}: {error}"));
        }
        Err(error) => return Err(error),
    }
    Ok(())
}

async fn reactivate_reminder(State(state): State<AppState>, Path(reminder_id): Path<i64>) -> Mutation {
    let id = state.next_request_id();
    state
        .pool
        .run(move |gateway| gateway.reactivate(reminder_id))
        .await
        .tagged(id)?;
    Ok(Json(Envelope::ok(id, format!("reminder {reminder_id} reactivated"))))
}

async fn delete_reminder(State(state): State<AppState>, Path(reminder_id): Path<i64>) -> Mutation {
    let id = state.next_request_id();
    state
        .pool
        .run(move |gateway| gateway.delete_reminder(reminder_id))
        .await
        .tagged(id)?;
    tracing::info!(reminder_id, "reminder deleted");
    Ok(Json(Envelope::ok(id, format!("reminder {reminder_id} deleted"))))
}

async fn set_finished(
    State(state): State<AppState>,
    Path((reminder_id, flag)): Path<(i64, String)>,
) -> Mutation {
    let id = state.next_request_id();
    let finished = parse_flag(&flag).tagged(id)?;
    state
        .pool
        .run(move |gateway| gateway.set_finished(reminder_id, finished))
        .await
        .tagged(id)?;
    Ok(Json(Envelope::ok(
        id,
        format!("reminder {reminder_id} finished={finished}"),
    )))
}

fn parse_flag(raw: &str) -> Result<bool, AppError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(AppError::bad_request(format!("'{other}' is not a flag"))),
    }
}

#[derive(Debug, Serialize)]
struct PendingNotification {
    #[serde(flatten)]
    notification: Notification,
    /// Transport handle while the notification is on screen
    handle: Option<NotificationHandle>,
}

async fn pending_notifications(
    State(state): State<AppState>,
) -> Result<Json<Vec<PendingNotification>>, AppError> {
    let pending = state
        .pool
        .run(|gateway| gateway.get_all_pending_notifications())
        .await?;
    let live = state.scheduler.live_handles();
    let listed = pending
        .into_iter()
        .map(|notification| PendingNotification {
            handle: live
                .iter()
                .find(|(_, notification_id)| *notification_id == notification.id)
                .map(|(handle, _)| *handle),
            notification,
        })
        .collect();
    Ok(Json(listed))
}

async fn notification_action(
    State(state): State<AppState>,
    Path((handle, action)): Path<(String, String)>,
) -> Mutation {
    let id = state.next_request_id();
    let handle: NotificationHandle = handle
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid notification handle '{handle}'")))
        .tagged(id)?;
    let event = if action.eq_ignore_ascii_case("close") {
        TransportEvent::closed(handle)
    } else {
        let action: NotificationAction = action
            .parse()
            .map_err(|err: nudge_core::scheduler::TransportError| AppError::bad_request(err.to_string()))
            .tagged(id)?;
        TransportEvent::action(handle, action)
    };

    state
        .events
        .send(event)
        .await
        .map_err(|_| AppError::Internal("scheduler is not running".to_string()))
        .tagged(id)?;
    Ok(Json(Envelope::ok(id, format!("notification {handle}: event queued"))))
}

async fn all_peers(State(state): State<AppState>) -> Json<Vec<Peer>> {
    Json(state.peers.all())
}

async fn sync_pull(State(state): State<AppState>) -> Result<Json<Vec<Reminder>>, AppError> {
    Ok(Json(state.sync.local_snapshot().await?))
}

async fn sync_push(State(state): State<AppState>, Json(delta): Json<Vec<Reminder>>) -> Mutation {
    let id = state.next_request_id();
    let received = delta.len();
    let report = state.sync.accept(delta).await.tagged(id)?;
    tracing::info!(received, "delta pushed by peer merged");
    Ok(Json(Envelope::ok(
        id,
        format!(
            "merged {received}: inserted {}, updated {}, unchanged {}",
            report.inserted, report.updated, report.unchanged
        ),
    )))
}

#[derive(Debug, Deserialize)]
struct SyncStartRequest {
    peer: String,
}

async fn sync_start(
    State(state): State<AppState>,
    Json(request): Json<SyncStartRequest>,
) -> Mutation {
    let id = state.next_request_id();
    let peer = state
        .peers
        .find(&request.peer)
        .ok_or_else(|| AppError::not_found(format!("peer {}", request.peer)))
        .tagged(id)?;
    let report = state.sync.synchronize(&peer).await.tagged(id)?;
    Ok(Json(Envelope::ok(
        id,
        format!(
            "synchronized with {}: pulled {}, inserted {}, updated {}, pushed {}",
            peer.key(),
            report.pulled,
            report.merge.inserted,
            report.merge.updated,
            report.pushed
        ),
    )))
}
