//! Task model: lifecycle states, the shared base record, and the task trait.
//!
//! Tasks come in two roles. A **trigger** is submitted by an external caller
//! and lives under the trigger prefix; its `execute` expands into per-node
//! **child** tasks persisted under the active prefix. A child holds a weak
//! back-reference to its parent by id only; the parent owns its children.

pub mod balance;
pub mod codec;
pub mod condition;
pub mod load;
pub mod release;
pub mod watch;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meridian_kv::MetaKv;
use meridian_proto::{NodeId, NodeRequest, TaskId, TaskType, Timestamp, TriggerCondition};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::Cluster;
use crate::config::RetryConfig;
use crate::error::{CoordError, Result};
use crate::meta::MetaView;
use crate::retry;
use crate::scheduler::{active_task_key, state_value, task_info_key};
use crate::task::condition::TaskCondition;

/// Lifecycle states of a task.
///
/// Persisted as decimal ASCII under the task-info prefix; the numeric values
/// are part of the storage format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TaskState {
    /// Constructed but not yet persisted.
    Undefined = 0,
    /// Persisted and queued, not yet running.
    Unissued = 1,
    /// Executing, or dispatched to a worker awaiting its response.
    Doing = 2,
    /// Completed successfully.
    Done = 3,
    /// Terminal failure after exhausting re-dispatch.
    Failed = 4,
}

impl TaskState {
    /// Returns true for `Done` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns the persisted numeric value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Creates a state from its persisted numeric value.
    #[must_use]
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::Unissued),
            2 => Some(Self::Doing),
            3 => Some(Self::Done),
            4 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Shared record embedded in every task variant.
#[derive(Debug)]
pub struct BaseTask {
    id: AtomicI64,
    trigger: Mutex<TriggerCondition>,
    state: Mutex<TaskState>,
    result: Mutex<Option<String>>,
    parent_id: Mutex<Option<TaskId>>,
    children: Mutex<Vec<Arc<dyn Task>>>,
    condition: TaskCondition,
}

impl BaseTask {
    /// Creates a base record in the `Undefined` state.
    #[must_use]
    pub fn new(trigger: TriggerCondition, cancel: CancellationToken) -> Self {
        Self {
            id: AtomicI64::new(0),
            trigger: Mutex::new(trigger),
            state: Mutex::new(TaskState::Undefined),
            result: Mutex::new(None),
            parent_id: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            condition: TaskCondition::new(cancel),
        }
    }

    /// Task id; zero until assigned.
    pub fn id(&self) -> TaskId {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: TaskId) {
        self.id.store(id, Ordering::Release);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }

    /// The origin of this task.
    pub fn trigger_condition(&self) -> TriggerCondition {
        *self.trigger.lock()
    }

    /// Parent task id; `None` for triggers.
    pub fn parent_id(&self) -> Option<TaskId> {
        *self.parent_id.lock()
    }

    pub(crate) fn set_parent_id(&self, parent: Option<TaskId>) {
        *self.parent_id.lock() = parent;
    }

    /// Terminal failure reason, if any.
    pub fn result(&self) -> Option<String> {
        self.result.lock().clone()
    }

    pub(crate) fn set_result(&self, result: Option<String>) {
        *self.result.lock() = result;
    }

    /// Snapshot of the child list.
    pub fn children(&self) -> Vec<Arc<dyn Task>> {
        self.children.lock().clone()
    }

    /// Number of children so far.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    pub(crate) fn push_child(&self, child: Arc<dyn Task>) {
        self.children.lock().push(child);
    }

    /// The completion latch for this task.
    pub fn condition(&self) -> &TaskCondition {
        &self.condition
    }
}

/// A unit of coordinator work, either a trigger or a per-node child.
#[async_trait]
pub trait Task: Send + Sync + std::fmt::Debug {
    /// Shared base record.
    fn base(&self) -> &BaseTask;

    /// Variant discriminant, also the codec frame tag.
    fn task_type(&self) -> TaskType;

    /// Submitter-assigned logical timestamp.
    fn timestamp(&self) -> Timestamp;

    /// Serialises the type tag and request payload for the kv store.
    fn marshal(&self) -> Result<Vec<u8>>;

    /// Target node for node-bound work, if any.
    fn target_node(&self) -> Option<NodeId> {
        None
    }

    /// Records a node to avoid on re-dispatch.
    fn exclude_node(&self, _node: NodeId) {}

    /// Nodes excluded from placement for this task.
    fn excluded_nodes(&self) -> Vec<NodeId> {
        Vec::new()
    }

    /// Builds a replacement for node-bound work whose worker vanished.
    ///
    /// The replacement carries the same payload and exclusions under a fresh
    /// base record; triggers return `None`.
    fn reissue(&self, _cancel: CancellationToken) -> Option<Arc<dyn Task>> {
        None
    }

    /// Task id shorthand.
    fn id(&self) -> TaskId {
        self.base().id()
    }

    /// True when this task has no parent.
    fn is_trigger(&self) -> bool {
        self.base().parent_id().is_none()
    }

    /// Validation before execution.
    async fn pre_execute(&self, ctx: &TaskContext) -> Result<()>;

    /// Expands a trigger into children, or dispatches node-bound work.
    async fn execute(&self, ctx: &TaskContext) -> Result<()>;

    /// Final bookkeeping after the work settles.
    async fn post_execute(&self, ctx: &TaskContext) -> Result<()>;
}

/// In-flight dispatch bookkeeping, used to cancel RPCs when a node dies.
#[derive(Debug)]
pub(crate) struct DispatchEntry {
    pub(crate) node: NodeId,
    pub(crate) token: CancellationToken,
}

/// Services available to executing tasks.
///
/// One context is shared by the scheduler and every task it runs; it owns the
/// id allocator, the active-task registry, and the channel feeding the child
/// dispatch loop.
pub struct TaskContext {
    pub(crate) kv: Arc<dyn MetaKv>,
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) meta: Arc<dyn MetaView>,
    pub(crate) retry: RetryConfig,
    pub(crate) cancel: CancellationToken,
    pub(crate) next_id: AtomicI64,
    pub(crate) active_tasks: DashMap<TaskId, Arc<dyn Task>>,
    pub(crate) dispatches: DashMap<TaskId, DispatchEntry>,
    pub(crate) activate_tx: mpsc::UnboundedSender<Arc<dyn Task>>,
}

impl TaskContext {
    /// The cluster view.
    #[must_use]
    pub fn cluster(&self) -> &dyn Cluster {
        self.cluster.as_ref()
    }

    /// The meta view.
    #[must_use]
    pub fn meta(&self) -> &dyn MetaView {
        self.meta.as_ref()
    }

    /// The kv store.
    #[must_use]
    pub fn kv(&self) -> &dyn MetaKv {
        self.kv.as_ref()
    }

    /// The scheduler's cancellation scope, for constructing child tasks.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Allocates a fresh process-wide task id.
    pub(crate) fn allocate_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Ensures future ids start past `floor`.
    pub(crate) fn bump_id_floor(&self, floor: TaskId) {
        self.next_id.fetch_max(floor, Ordering::AcqRel);
    }

    /// Persists a child under the active prefix and hands it to dispatch.
    ///
    /// Assigns a fresh id, records the parent link, writes the blob and the
    /// `Unissued` state in one batch, appends the child to the parent, and
    /// queues it for dispatch.
    pub async fn add_child_task(&self, parent: &BaseTask, child: Arc<dyn Task>) -> Result<TaskId> {
        let id = self.allocate_id();
        child.base().set_id(id);
        child.base().set_parent_id(Some(parent.id()));

        let blob = child.marshal()?;
        self.kv
            .multi_save(vec![
                (active_task_key(id), blob),
                (task_info_key(id), state_value(TaskState::Unissued)),
            ])
            .await?;
        child.base().set_state(TaskState::Unissued);

        parent.push_child(Arc::clone(&child));
        self.active_tasks.insert(id, Arc::clone(&child));
        self.activate_tx
            .send(child)
            .map_err(|_| CoordError::Cancelled)?;

        debug!(task_id = id, parent_id = parent.id(), "child task added");
        Ok(id)
    }

    /// Dispatches a node-bound request, returning the node that served it.
    ///
    /// The target is the payload node when it is online and not excluded,
    /// otherwise the cluster's deterministic choice. The call is retried up
    /// to the recall bound; a vanished worker surfaces as
    /// [`CoordError::WorkerUnavailable`] so the parent can re-issue the work.
    pub async fn dispatch(&self, task: &dyn Task, request: NodeRequest) -> Result<NodeId> {
        let excluded = task.excluded_nodes();
        let preferred = task
            .target_node()
            .filter(|n| self.cluster.is_online(*n) && !excluded.contains(n));
        let node = match preferred {
            Some(node) => node,
            None => self
                .cluster
                .select_node(&excluded)
                .ok_or(CoordError::NoEligibleWorker)?,
        };

        let task_id = task.base().id();
        let token = self.cancel.child_token();
        self.dispatches.insert(
            task_id,
            DispatchEntry {
                node,
                token: token.clone(),
            },
        );

        let cluster = Arc::clone(&self.cluster);
        let result = tokio::select! {
            () = token.cancelled() => Err(CoordError::WorkerUnavailable(node)),
            r = retry::retry(self.retry.recall_attempts, self.retry.recall_interval, || {
                let cluster = Arc::clone(&cluster);
                let request = request.clone();
                async move { cluster.dispatch(node, request).await }
            }) => r,
        };
        self.dispatches.remove(&task_id);

        if self.cancel.is_cancelled() {
            return Err(CoordError::Cancelled);
        }

        match result {
            Ok(status) if status.is_success() => Ok(node),
            Ok(status) => Err(CoordError::TaskFailed(status.reason)),
            Err(CoordError::WorkerUnavailable(lost)) => Err(CoordError::WorkerUnavailable(lost)),
            Err(err) if !self.cluster.is_online(node) => {
                debug!(node_id = node, error = %err, "dispatch target went offline");
                Err(CoordError::WorkerUnavailable(node))
            }
            Err(err) => Err(err),
        }
    }
}
