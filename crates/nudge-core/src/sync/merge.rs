//! Merge rule for reminder collections from another replica
//!
//! Records are matched by uuid. A remote record either wins as a whole,
//! when its `changed` is strictly newer, or is ignored; fields are never
//! mixed between replicas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::db::Gateway;
use crate::error::Result;
use crate::models::{Reminder, ReminderUuid};

/// What a merge did to the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Merge `remote` into the local store in one explicit transaction.
///
/// Any failure rolls back the whole merge.
pub fn merge_remote(gateway: &mut Gateway, remote: &[Reminder]) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    let scope = gateway.transaction()?;

    for record in remote {
        match scope.get_reminder_by_uuid(&record.uuid)? {
            None => {
                let copy = Reminder {
                    id: None,
                    ..record.clone()
                };
                scope.add_reminder(&copy)?;
                report.inserted += 1;
            }
            Some(local) if record.changed > local.changed => {
                overwrite(&scope, &local, record)?;
                report.updated += 1;
            }
            Some(_) => report.unchanged += 1,
        }
    }

    scope.commit()?;
    tracing::info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        "merged remote reminders"
    );
    Ok(report)
}

/// Replay `remote` over `local` one setter per differing field, then adopt
/// the remote's `changed`.
fn overwrite(gateway: &Gateway, local: &Reminder, remote: &Reminder) -> Result<()> {
    let id = local.require_id()?;

    if remote.title != local.title {
        gateway.set_title(id, &remote.title)?;
    }
    if remote.description != local.description {
        gateway.set_description(id, &remote.description)?;
    }
    // A custom rule needs its days in place first; leaving custom needs the
    // rule changed before the days can be cleared
    let days_first = !remote.weekdays.is_empty();
    let days_differ = remote.weekdays != local.weekdays;
    if days_differ && days_first {
        gateway.set_weekday_mask(id, remote.weekdays)?;
    }
    if remote.repeat != local.repeat {
        gateway.set_schedule(id, remote.repeat, remote.timestamp)?;
    } else if remote.timestamp != local.timestamp {
        gateway.set_timestamp(id, remote.timestamp)?;
    }
    if days_differ && !days_first {
        gateway.set_weekday_mask(id, remote.weekdays)?;
    }
    if remote.repeat_counter != local.repeat_counter {
        gateway.set_repeat_counter(id, remote.repeat_counter)?;
    }
    if remote.repeat_limit != local.repeat_limit {
        gateway.set_repeat_limit(id, remote.repeat_limit)?;
    }
    if remote.finished != local.finished {
        gateway.set_finished(id, remote.finished)?;
    }
    gateway.set_changed(id, remote.changed)?;

    tracing::debug!(reminder_id = id, uuid = %remote.uuid, "local reminder replaced by newer remote");
    Ok(())
}

/// Local records the remote lacks or holds an older version of.
pub fn compute_delta(local: &[Reminder], remote: &[Reminder]) -> Vec<Reminder> {
    let remote_changed: HashMap<ReminderUuid, _> = remote
        .iter()
        .map(|record| (record.uuid, record.changed))
        .collect();

    local
        .iter()
        .filter(|record| {
            remote_changed
                .get(&record.uuid)
                .map_or(true, |changed| record.changed > *changed)
        })
        .cloned()
        .collect()
}
