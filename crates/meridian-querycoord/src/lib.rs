//! Meridian query coordinator - durable task scheduling for cluster control.
//!
//! The coordinator accepts collection-level control requests (load a
//! collection, release partitions, watch channels, rebalance segments),
//! expands each into per-node work items, dispatches them to worker nodes,
//! and persists every step so a restart resumes exactly where it left off.
//!
//! # Architecture
//!
//! - Trigger tasks enter a FIFO [`TaskQueue`] and are persisted before the
//!   submitter sees success.
//! - The [`TaskScheduler`] drives the lifecycle state machine, fanning each
//!   trigger out into child tasks that execute concurrently against distinct
//!   workers.
//! - Every state transition is written to the key-value store before any
//!   action that depends on it; recovery rebuilds the full task tree from the
//!   store alone.
//! - Worker loss re-issues affected children against the surviving roster.
//!
//! # Example
//!
//! ```ignore
//! use meridian_querycoord::{CoordConfig, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new(CoordConfig::default(), kv, cluster, meta);
//! scheduler.reload_from_kv().await?;
//! scheduler.start();
//! scheduler.enqueue(task).await?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod meta;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod task;

pub use cluster::{Cluster, LocalCluster, NodeEvent, NodeHandler};
pub use config::{CleanupConfig, CoordConfig, QueueConfig, RetryConfig};
pub use error::{CoordError, Result};
pub use meta::{MemoryMeta, MetaView};
pub use queue::TaskQueue;
pub use scheduler::{TaskScheduler, ACTIVE_TASK_PREFIX, TASK_INFO_PREFIX, TRIGGER_TASK_PREFIX};
pub use task::balance::LoadBalanceTask;
pub use task::codec::unmarshal_task;
pub use task::condition::{TaskCondition, TaskOutcome};
pub use task::load::{LoadCollectionTask, LoadPartitionsTask, LoadSegmentsTask};
pub use task::release::{ReleaseCollectionTask, ReleasePartitionsTask, ReleaseSegmentsTask};
pub use task::watch::{WatchDmChannelsTask, WatchQueryChannelsTask};
pub use task::{BaseTask, Task, TaskContext, TaskState};
