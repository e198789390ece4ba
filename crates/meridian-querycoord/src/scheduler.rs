//! The task scheduler: durable orchestration of trigger and child tasks.
//!
//! Two cooperating loops run under one cancellation scope. The trigger loop
//! pops triggers FIFO, expands them into children, and awaits the whole tree.
//! The activate loop dispatches children to worker nodes concurrently. A
//! third loop watches the session registry and re-homes work when a node
//! dies.
//!
//! Every lifecycle transition is written to the kv store before any action
//! that depends on the new state, so a crash at any point recovers cleanly.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use dashmap::DashMap;
use meridian_kv::MetaKv;
use meridian_proto::{LoadBalanceRequest, MsgBase, NodeId, TaskId, TriggerCondition};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cluster::{Cluster, NodeEvent};
use crate::config::CoordConfig;
use crate::error::{CoordError, Result};
use crate::meta::MetaView;
use crate::queue::TaskQueue;
use crate::retry;
use crate::task::balance::LoadBalanceTask;
use crate::task::condition::TaskOutcome;
use crate::task::{Task, TaskContext, TaskState};

/// Kv prefix for trigger tasks.
pub const TRIGGER_TASK_PREFIX: &str = "queryCoord/triggerTask";

/// Kv prefix for active (child) tasks.
pub const ACTIVE_TASK_PREFIX: &str = "queryCoord/activeTask";

/// Kv prefix for task lifecycle states, stored as decimal ASCII.
pub const TASK_INFO_PREFIX: &str = "queryCoord/taskInfo";

pub(crate) fn trigger_task_key(id: TaskId) -> String {
    format!("{TRIGGER_TASK_PREFIX}/{id}")
}

pub(crate) fn active_task_key(id: TaskId) -> String {
    format!("{ACTIVE_TASK_PREFIX}/{id}")
}

pub(crate) fn task_info_key(id: TaskId) -> String {
    format!("{TASK_INFO_PREFIX}/{id}")
}

pub(crate) fn state_value(state: TaskState) -> Vec<u8> {
    state.as_i32().to_string().into_bytes()
}

/// Removes the kv footprint of a trigger and all its children in one batch.
async fn remove_task_tree(ctx: &TaskContext, task: &Arc<dyn Task>) -> Result<()> {
    let id = task.id();
    let mut keys = vec![trigger_task_key(id), task_info_key(id)];
    for child in task.base().children() {
        let child_id = child.id();
        keys.push(active_task_key(child_id));
        keys.push(task_info_key(child_id));
        ctx.active_tasks.remove(&child_id);
    }
    ctx.kv.multi_remove(keys).await?;
    debug!(task_id = id, "task tree removed from kv");
    Ok(())
}

/// Durable task scheduler for the query coordinator.
pub struct TaskScheduler {
    pub(crate) ctx: Arc<TaskContext>,
    config: CoordConfig,
    pub(crate) trigger_queue: TaskQueue,
    activate_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn Task>>>>,
    pub(crate) cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    workers: TaskTracker,
    node_down_gate: tokio::sync::Mutex<()>,
}

impl TaskScheduler {
    /// Creates a scheduler over the given stores and views.
    ///
    /// Call [`reload_from_kv`](Self::reload_from_kv) and then
    /// [`start`](Self::start) before accepting requests.
    #[must_use]
    pub fn new(
        config: CoordConfig,
        kv: Arc<dyn MetaKv>,
        cluster: Arc<dyn Cluster>,
        meta: Arc<dyn MetaView>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (activate_tx, activate_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(TaskContext {
            kv,
            cluster,
            meta,
            retry: config.retry.clone(),
            cancel: cancel.clone(),
            next_id: AtomicI64::new(1),
            active_tasks: DashMap::new(),
            dispatches: DashMap::new(),
            activate_tx,
        });

        Arc::new(Self {
            trigger_queue: TaskQueue::new(config.queue.capacity, cancel.clone()),
            ctx,
            config,
            activate_rx: Mutex::new(Some(activate_rx)),
            cancel,
            loops: Mutex::new(Vec::new()),
            workers: TaskTracker::new(),
            node_down_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// The trigger queue, for snapshot inspection.
    #[must_use]
    pub fn trigger_queue(&self) -> &TaskQueue {
        &self.trigger_queue
    }

    /// The shared task context.
    #[must_use]
    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// The scheduler's cancellation scope, for constructing tasks.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of child tasks currently tracked as active.
    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.ctx.active_tasks.len()
    }

    /// Rebuilds a task from a persisted blob, assigning the given id.
    pub fn unmarshal_task(&self, id: TaskId, blob: &[u8]) -> Result<Arc<dyn Task>> {
        crate::task::codec::unmarshal_task(id, blob, self.cancel.clone())
    }

    /// Blocks until at least one worker is online, using the patient
    /// bring-up retry bound.
    pub async fn wait_for_workers(&self) -> Result<()> {
        let cluster = Arc::clone(&self.ctx.cluster);
        retry::retry_cancellable(
            self.config.retry.connect_attempts,
            self.config.retry.connect_interval,
            &self.cancel,
            || {
                let cluster = Arc::clone(&cluster);
                async move {
                    if cluster.online_nodes().is_empty() {
                        Err(CoordError::NoEligibleWorker)
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await
    }

    /// Persists a trigger and appends it to the queue.
    ///
    /// The trigger blob and its `Unissued` state are written before the
    /// submitter sees success. On a full queue the just-written keys are
    /// rolled back and [`CoordError::QueueFull`] is returned.
    pub async fn enqueue(&self, task: Arc<dyn Task>) -> Result<TaskId> {
        if self.cancel.is_cancelled() {
            return Err(CoordError::Cancelled);
        }

        let id = self.ctx.allocate_id();
        task.base().set_id(id);

        let blob = task.marshal()?;
        self.ctx
            .kv
            .multi_save(vec![
                (trigger_task_key(id), blob),
                (task_info_key(id), state_value(TaskState::Unissued)),
            ])
            .await?;
        task.base().set_state(TaskState::Unissued);

        if let Err(err) = self.trigger_queue.push(Arc::clone(&task)) {
            if let Err(rollback) = self
                .ctx
                .kv
                .multi_remove(vec![trigger_task_key(id), task_info_key(id)])
                .await
            {
                warn!(task_id = id, error = %rollback, "rollback of rejected trigger failed");
            }
            return Err(err);
        }

        info!(task_id = id, task_type = %task.task_type(), "trigger task enqueued");
        Ok(id)
    }

    /// Spawns the scheduler loops.
    pub fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock();

        let scheduler = Arc::clone(self);
        loops.push(tokio::spawn(async move {
            scheduler.process_trigger_loop().await;
        }));

        let scheduler = Arc::clone(self);
        loops.push(tokio::spawn(async move {
            scheduler.process_activate_loop().await;
        }));

        let scheduler = Arc::clone(self);
        loops.push(tokio::spawn(async move {
            scheduler.watch_node_events().await;
        }));

        info!("task scheduler started");
    }

    /// Cancels the scope, waits for every loop and in-flight dispatch, and
    /// writes nothing further. The kv store remains authoritative for a
    /// later restart.
    pub async fn close(&self) {
        info!("task scheduler closing");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.workers.close();
        self.workers.wait().await;
        info!("task scheduler closed");
    }

    /// Persists a state transition, then applies it in memory.
    pub(crate) async fn update_task_state(&self, task: &dyn Task, state: TaskState) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CoordError::Cancelled);
        }
        self.ctx
            .kv
            .save(&task_info_key(task.base().id()), state_value(state))
            .await?;
        task.base().set_state(state);
        debug!(task_id = task.base().id(), state = ?state, "task state persisted");
        Ok(())
    }

    async fn process_trigger_loop(&self) {
        loop {
            let task = match self.trigger_queue.pop().await {
                Ok(task) => task,
                Err(_) => break,
            };
            if let Err(err) = self.process_trigger(task).await {
                if matches!(err, CoordError::Cancelled) {
                    break;
                }
                error!(error = %err, "trigger processing aborted");
            }
        }
        debug!("trigger loop exited");
    }

    async fn process_trigger(&self, task: Arc<dyn Task>) -> Result<()> {
        let id = task.id();
        let task_type = task.task_type();
        info!(task_id = id, %task_type, "processing trigger task");

        // a recovered terminal trigger only needs its cleanup finished
        if task.base().state().is_terminal() {
            let outcome = if task.base().state() == TaskState::Failed {
                TaskOutcome::Failed(
                    task.base()
                        .result()
                        .unwrap_or_else(|| "failed before restart".to_owned()),
                )
            } else {
                TaskOutcome::Success
            };
            remove_task_tree(&self.ctx, &task).await?;
            task.base().condition().notify(outcome);
            return Ok(());
        }

        self.update_task_state(task.as_ref(), TaskState::Doing).await?;

        match self.run_trigger(&task).await {
            Ok(()) => {
                self.update_task_state(task.as_ref(), TaskState::Done).await?;
                remove_task_tree(&self.ctx, &task).await?;
                task.base().condition().notify(TaskOutcome::Success);
                info!(task_id = id, %task_type, "trigger task done");
                Ok(())
            }
            Err(CoordError::Cancelled) => Err(CoordError::Cancelled),
            Err(err) => {
                warn!(task_id = id, %task_type, error = %err, "trigger task failed");
                task.base().set_result(Some(err.to_string()));
                self.update_task_state(task.as_ref(), TaskState::Failed).await?;
                task.base()
                    .condition()
                    .notify(TaskOutcome::Failed(err.to_string()));
                self.schedule_failed_cleanup(task);
                Ok(())
            }
        }
    }

    async fn run_trigger(&self, task: &Arc<dyn Task>) -> Result<()> {
        // a recovered trigger with persisted children resumes waiting
        // instead of fanning out a second time
        let resumed = task.base().trigger_condition() == TriggerCondition::RecoveredFromKv
            && task.base().child_count() > 0;

        if !resumed {
            task.pre_execute(&self.ctx).await?;
            task.execute(&self.ctx).await?;
        }

        self.wait_children(task).await?;
        task.post_execute(&self.ctx).await?;
        Ok(())
    }

    /// Awaits every child of a trigger, re-issuing work whose worker
    /// vanished. Children appended during the wait (re-dispatches) are
    /// awaited too.
    async fn wait_children(&self, task: &Arc<dyn Task>) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();
        let mut index = 0usize;

        loop {
            let child = {
                let children = task.base().children();
                match children.get(index) {
                    Some(child) => Arc::clone(child),
                    None => break,
                }
            };
            index += 1;

            match child.base().condition().wait().await? {
                TaskOutcome::Success => {}
                TaskOutcome::Failed(reason) => failures.push(reason),
                TaskOutcome::WorkerLost(node) => {
                    self.redispatch_child(task, &child, node, &mut failures)
                        .await?;
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoordError::TaskFailed(failures.join("; ")))
        }
    }

    /// Re-issues a child whose worker vanished, under a fresh id and with
    /// the lost node excluded from placement.
    async fn redispatch_child(
        &self,
        parent: &Arc<dyn Task>,
        child: &Arc<dyn Task>,
        lost_node: NodeId,
        failures: &mut Vec<String>,
    ) -> Result<()> {
        let old_id = child.id();
        child.exclude_node(lost_node);

        let replacement = match child.reissue(self.cancel.clone()) {
            Some(replacement) => replacement,
            None => {
                // release work pinned to the lost node is moot once the
                // node is gone
                self.update_task_state(child.as_ref(), TaskState::Done).await?;
                debug!(
                    task_id = old_id,
                    node_id = lost_node,
                    "node-bound work settled with its lost node"
                );
                return Ok(());
            }
        };

        if self.ctx.cluster.select_node(&child.excluded_nodes()).is_none() {
            warn!(
                task_id = old_id,
                node_id = lost_node,
                "no eligible worker for re-dispatch"
            );
            child
                .base()
                .set_result(Some(CoordError::NoEligibleWorker.to_string()));
            self.update_task_state(child.as_ref(), TaskState::Failed).await?;
            failures.push(format!(
                "task {old_id}: no eligible worker after node {lost_node} was lost"
            ));
            return Ok(());
        }

        // retire the old child's keys; the replacement gets fresh ones
        self.ctx.active_tasks.remove(&old_id);
        self.ctx
            .kv
            .multi_remove(vec![active_task_key(old_id), task_info_key(old_id)])
            .await?;

        let new_id = self.ctx.add_child_task(parent.base(), replacement).await?;
        info!(
            old_task_id = old_id,
            new_task_id = new_id,
            node_id = lost_node,
            "child task re-dispatched after worker loss"
        );
        Ok(())
    }

    async fn process_activate_loop(self: Arc<Self>) {
        let mut rx = match self.activate_rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("activate loop started twice");
                return;
            }
        };

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(child) => {
                        let scheduler = Arc::clone(&self);
                        self.workers.spawn(async move {
                            scheduler.process_active_task(child).await;
                        });
                    }
                    None => break,
                },
            }
        }
        debug!("activate loop exited");
    }

    async fn process_active_task(&self, child: Arc<dyn Task>) {
        let id = child.id();
        let task_type = child.task_type();
        debug!(task_id = id, %task_type, "dispatching child task");

        if let Err(err) = self.update_task_state(child.as_ref(), TaskState::Doing).await {
            if !matches!(err, CoordError::Cancelled) {
                error!(task_id = id, error = %err, "failed to persist child state");
                child
                    .base()
                    .condition()
                    .notify(TaskOutcome::Failed(err.to_string()));
            }
            return;
        }

        let result = async {
            child.pre_execute(&self.ctx).await?;
            child.execute(&self.ctx).await?;
            child.post_execute(&self.ctx).await
        }
        .await;

        match result {
            Ok(()) => match self.update_task_state(child.as_ref(), TaskState::Done).await {
                Ok(()) => {
                    child.base().condition().notify(TaskOutcome::Success);
                    debug!(task_id = id, "child task done");
                }
                Err(CoordError::Cancelled) => {}
                Err(err) => {
                    error!(task_id = id, error = %err, "failed to persist child completion");
                    child
                        .base()
                        .condition()
                        .notify(TaskOutcome::Failed(err.to_string()));
                }
            },
            // shutdown mid-dispatch: no state writes, kv stays authoritative
            Err(CoordError::Cancelled) => {}
            Err(CoordError::WorkerUnavailable(node)) => {
                // doing -> unissued; the parent re-issues the work elsewhere
                let _ = self.update_task_state(child.as_ref(), TaskState::Unissued).await;
                child.base().condition().notify(TaskOutcome::WorkerLost(node));
            }
            Err(err) => {
                warn!(task_id = id, %task_type, error = %err, "child task failed");
                child.base().set_result(Some(err.to_string()));
                let _ = self.update_task_state(child.as_ref(), TaskState::Failed).await;
                child
                    .base()
                    .condition()
                    .notify(TaskOutcome::Failed(err.to_string()));
            }
        }
    }

    async fn watch_node_events(&self) {
        let mut events = self.ctx.cluster.subscribe();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(NodeEvent::NodeDown(node)) => self.handle_node_down(node).await,
                    Ok(NodeEvent::NodeUp(node)) => debug!(node_id = node, "worker node joined"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "node event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("node event loop exited");
    }

    /// Reacts to a worker leaving the session registry.
    ///
    /// In-flight dispatches to the node are cancelled so their tasks can be
    /// re-issued, and a balance trigger re-homes whatever the node served.
    /// Events are processed serially.
    async fn handle_node_down(&self, node: NodeId) {
        let _gate = self.node_down_gate.lock().await;
        warn!(node_id = node, "worker node went down");

        for entry in self.ctx.dispatches.iter() {
            if entry.node == node {
                entry.token.cancel();
            }
        }

        let located = match self.ctx.meta.segments_on_node(node).await {
            Ok(located) => located,
            Err(err) => {
                error!(node_id = node, error = %err, "failed to read segments of lost node");
                return;
            }
        };
        if located.is_empty() {
            return;
        }

        let request = LoadBalanceRequest::new(MsgBase::default(), vec![node])
            .with_sealed_segments(located.iter().map(|loc| loc.segment_id).collect());
        let task = Arc::new(LoadBalanceTask::new(
            request,
            TriggerCondition::NodeDown,
            self.cancel.clone(),
        ));
        match self.enqueue(task).await {
            Ok(task_id) => {
                info!(node_id = node, task_id, "balance trigger enqueued for lost node");
            }
            Err(err) => {
                error!(node_id = node, error = %err, "failed to enqueue balance trigger");
            }
        }
    }

    fn schedule_failed_cleanup(&self, task: Arc<dyn Task>) {
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();
        let grace = self.config.cleanup.failed_task_grace;

        self.workers.spawn(async move {
            tokio::select! {
                // shutdown keeps the failed state for the next recovery
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(grace) => {}
            }
            if let Err(err) = remove_task_tree(&ctx, &task).await {
                error!(task_id = task.id(), error = %err, "failed task cleanup did not complete");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::meta::MemoryMeta;
    use crate::task::load::LoadCollectionTask;
    use meridian_kv::MemoryKv;
    use meridian_proto::{LoadCollectionRequest, MsgBase};

    fn make_scheduler(capacity: usize) -> (Arc<TaskScheduler>, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let cluster = Arc::new(LocalCluster::new());
        let meta = Arc::new(MemoryMeta::new());
        let config = CoordConfig {
            queue: crate::config::QueueConfig { capacity },
            ..CoordConfig::default()
        };
        let scheduler = TaskScheduler::new(config, kv.clone(), cluster, meta);
        (scheduler, kv)
    }

    fn make_trigger(scheduler: &TaskScheduler, timestamp: u64) -> Arc<dyn Task> {
        Arc::new(LoadCollectionTask::new(
            LoadCollectionRequest::new(MsgBase::new(timestamp), 1),
            TriggerCondition::GrpcRequest,
            scheduler.cancellation_token(),
        ))
    }

    #[test]
    fn key_layout() {
        assert_eq!(trigger_task_key(7), "queryCoord/triggerTask/7");
        assert_eq!(active_task_key(7), "queryCoord/activeTask/7");
        assert_eq!(task_info_key(7), "queryCoord/taskInfo/7");
        assert_eq!(state_value(TaskState::Done), b"3".to_vec());
    }

    #[tokio::test]
    async fn enqueue_persists_before_returning() {
        let (scheduler, kv) = make_scheduler(8);
        let id = scheduler.enqueue(make_trigger(&scheduler, 1)).await.unwrap();

        let triggers = kv.load_with_prefix(TRIGGER_TASK_PREFIX).await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].0, trigger_task_key(id));

        let state = kv.load(&task_info_key(id)).await.unwrap().unwrap();
        assert_eq!(state, state_value(TaskState::Unissued));
    }

    #[tokio::test]
    async fn queue_full_rolls_back_kv() {
        let (scheduler, kv) = make_scheduler(1);
        scheduler.enqueue(make_trigger(&scheduler, 1)).await.unwrap();

        let result = scheduler.enqueue(make_trigger(&scheduler, 2)).await;
        assert!(matches!(result, Err(CoordError::QueueFull)));

        let triggers = kv.load_with_prefix(TRIGGER_TASK_PREFIX).await.unwrap();
        assert_eq!(triggers.len(), 1);
        let states = kv.load_with_prefix(TASK_INFO_PREFIX).await.unwrap();
        assert_eq!(states.len(), 1);
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let (scheduler, _kv) = make_scheduler(8);
        let first = scheduler.enqueue(make_trigger(&scheduler, 1)).await.unwrap();
        let second = scheduler.enqueue(make_trigger(&scheduler, 2)).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn enqueue_after_close_is_rejected() {
        let (scheduler, _kv) = make_scheduler(8);
        scheduler.close().await;

        let result = scheduler.enqueue(make_trigger(&scheduler, 1)).await;
        assert!(matches!(result, Err(CoordError::Cancelled)));
    }
}
