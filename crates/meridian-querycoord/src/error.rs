//! Error types for the query coordinator.

use meridian_proto::{CollectionId, NodeId};
use thiserror::Error;

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The trigger queue is at capacity; the submitter should retry.
    #[error("trigger task queue is full")]
    QueueFull,

    /// A persisted task carries a tag this build does not know.
    #[error("unknown task type tag: {0:#06x}")]
    UnknownTaskType(u16),

    /// A persisted task blob does not decode.
    #[error("corrupt task: {0}")]
    CorruptTask(String),

    /// The worker serving an active task vanished.
    #[error("worker node {0} unavailable")]
    WorkerUnavailable(NodeId),

    /// No online worker can take the work.
    #[error("no eligible worker node")]
    NoEligibleWorker,

    /// Startup recovery could not rebuild the task tree.
    #[error("recovery from kv store failed: {0}")]
    RecoveryFailed(String),

    /// The scheduler scope was cancelled; normal shutdown signal.
    #[error("operation cancelled")]
    Cancelled,

    /// The collection is not known to the meta view.
    #[error("collection {0} not found")]
    CollectionNotFound(CollectionId),

    /// Task logic failed; surfaces to the parent trigger.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Key-value store error.
    #[error("kv store error: {0}")]
    Kv(#[from] meridian_kv::KvError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordError>;
