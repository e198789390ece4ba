//! Startup recovery from the kv store.
//!
//! Rebuilds the full task tree before the scheduler accepts new requests:
//! trigger blobs, active (child) blobs, and persisted states are read back,
//! parent links are restored, and unfinished work is re-queued in its
//! persisted state. Terminal tasks are left in place so the normal loop
//! observes them and runs their cleanup.

use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_proto::TaskId;
use tracing::{info, warn};

use crate::error::{CoordError, Result};
use crate::scheduler::{TaskScheduler, ACTIVE_TASK_PREFIX, TASK_INFO_PREFIX, TRIGGER_TASK_PREFIX};
use crate::task::codec::unmarshal_task;
use crate::task::condition::TaskOutcome;
use crate::task::{Task, TaskState};

fn id_from_key(key: &str) -> Result<TaskId> {
    key.rsplit('/')
        .next()
        .and_then(|suffix| suffix.parse::<TaskId>().ok())
        .ok_or_else(|| CoordError::RecoveryFailed(format!("malformed task key: {key}")))
}

impl TaskScheduler {
    /// Rebuilds the in-memory task tree from the kv store.
    ///
    /// Must complete before [`start`](Self::start); any failure aborts with
    /// [`CoordError::RecoveryFailed`] and a partially applied view is never
    /// exposed to the scheduler loops.
    pub async fn reload_from_kv(&self) -> Result<()> {
        let trigger_entries = self
            .ctx
            .kv
            .load_with_prefix(TRIGGER_TASK_PREFIX)
            .await
            .map_err(|e| CoordError::RecoveryFailed(e.to_string()))?;
        let active_entries = self
            .ctx
            .kv
            .load_with_prefix(ACTIVE_TASK_PREFIX)
            .await
            .map_err(|e| CoordError::RecoveryFailed(e.to_string()))?;
        let info_entries = self
            .ctx
            .kv
            .load_with_prefix(TASK_INFO_PREFIX)
            .await
            .map_err(|e| CoordError::RecoveryFailed(e.to_string()))?;

        let mut triggers: BTreeMap<TaskId, Arc<dyn Task>> = BTreeMap::new();
        for (key, blob) in &trigger_entries {
            let id = id_from_key(key)?;
            let task = unmarshal_task(id, blob, self.cancel.clone())
                .map_err(|e| CoordError::RecoveryFailed(format!("trigger task {id}: {e}")))?;
            triggers.insert(id, task);
        }

        let mut actives: BTreeMap<TaskId, Arc<dyn Task>> = BTreeMap::new();
        for (key, blob) in &active_entries {
            let id = id_from_key(key)?;
            let task = unmarshal_task(id, blob, self.cancel.clone())
                .map_err(|e| CoordError::RecoveryFailed(format!("active task {id}: {e}")))?;
            actives.insert(id, task);
        }

        for (key, value) in &info_entries {
            let id = id_from_key(key)?;
            let text = std::str::from_utf8(value)
                .map_err(|_| CoordError::RecoveryFailed(format!("task {id}: state is not ascii")))?;
            let raw: i32 = text.trim().parse().map_err(|_| {
                CoordError::RecoveryFailed(format!("task {id}: state {text:?} is not a number"))
            })?;
            let state = TaskState::from_i32(raw)
                .ok_or_else(|| CoordError::RecoveryFailed(format!("task {id}: unknown state {raw}")))?;

            match triggers.get(&id).or_else(|| actives.get(&id)) {
                Some(task) => task.base().set_state(state),
                None => warn!(task_id = id, "state entry without task blob"),
            }
        }

        // never reuse an id from a previous incarnation
        let max_id = triggers.keys().chain(actives.keys()).copied().max();
        if let Some(max_id) = max_id {
            self.ctx.bump_id_floor(max_id + 1);
        }

        // link children to their recorded parents; actives with no recorded
        // parent attach to a terminal trigger awaiting cleanup
        let terminal_trigger: Option<Arc<dyn Task>> = triggers
            .values()
            .find(|t| t.base().state().is_terminal())
            .cloned();
        let active_count = actives.len();

        for (id, child) in &actives {
            let parent = child
                .base()
                .parent_id()
                .and_then(|p| triggers.get(&p).cloned())
                .or_else(|| terminal_trigger.clone());
            let Some(parent) = parent else {
                warn!(task_id = id, "active task has no parent trigger");
                continue;
            };

            child.base().set_parent_id(Some(parent.id()));
            parent.base().push_child(Arc::clone(child));
            self.ctx.active_tasks.insert(*id, Arc::clone(child));

            match child.base().state() {
                TaskState::Done => child.base().condition().notify(TaskOutcome::Success),
                TaskState::Failed => child.base().condition().notify(TaskOutcome::Failed(
                    child
                        .base()
                        .result()
                        .unwrap_or_else(|| "failed before restart".to_owned()),
                )),
                // a terminal parent is headed straight for cleanup
                _ if parent.base().state().is_terminal() => {}
                _ => {
                    self.ctx
                        .activate_tx
                        .send(Arc::clone(child))
                        .map_err(|_| {
                            CoordError::RecoveryFailed("scheduler already closed".to_owned())
                        })?;
                }
            }
        }

        // triggers re-enter the queue in ascending timestamp order, id as
        // the tie-break
        let mut ordered: Vec<Arc<dyn Task>> = triggers.values().cloned().collect();
        ordered.sort_by_key(|task| (task.timestamp(), task.id()));
        let trigger_count = ordered.len();
        for task in ordered {
            self.trigger_queue
                .push(task)
                .map_err(|e| CoordError::RecoveryFailed(e.to_string()))?;
        }

        info!(
            triggers = trigger_count,
            actives = active_count,
            "task scheduler recovered from kv"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_parses_from_key_suffix() {
        assert_eq!(id_from_key("queryCoord/triggerTask/100").unwrap(), 100);
        assert_eq!(id_from_key("queryCoord/taskInfo/7").unwrap(), 7);
        assert!(id_from_key("queryCoord/taskInfo/abc").is_err());
        assert!(id_from_key("").is_err());
    }
}
