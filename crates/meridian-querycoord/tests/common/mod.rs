//! Common test utilities for coordinator integration tests.

pub mod fixtures;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meridian_kv::MemoryKv;
use meridian_querycoord::{
    CleanupConfig, CoordConfig, LocalCluster, MemoryMeta, QueueConfig, RetryConfig, TaskScheduler,
};

/// Complete test coordinator with all collaborators wired together.
pub struct TestCoord {
    pub kv: Arc<MemoryKv>,
    pub cluster: Arc<LocalCluster>,
    pub meta: Arc<MemoryMeta>,
    pub scheduler: Arc<TaskScheduler>,
}

impl TestCoord {
    /// Creates a coordinator with fast timings for time-sensitive tests.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Creates a coordinator with the given configuration.
    pub fn with_config(config: CoordConfig) -> Self {
        let kv = Arc::new(MemoryKv::new());
        let cluster = Arc::new(LocalCluster::new());
        let meta = Arc::new(MemoryMeta::new());
        let scheduler = TaskScheduler::new(config, kv.clone(), cluster.clone(), meta.clone());

        Self {
            kv,
            cluster,
            meta,
            scheduler,
        }
    }

    /// Creates a coordinator over an existing kv store, simulating a restart.
    pub fn with_kv(kv: Arc<MemoryKv>) -> Self {
        let cluster = Arc::new(LocalCluster::new());
        let meta = Arc::new(MemoryMeta::new());
        let scheduler = TaskScheduler::new(fast_config(), kv.clone(), cluster.clone(), meta.clone());

        Self {
            kv,
            cluster,
            meta,
            scheduler,
        }
    }

    /// Seeds one collection: partitions 10 and 11, three segments, two dm
    /// channels.
    pub fn seed_collection(&self) {
        self.meta.add_collection(1, vec![10, 11]);
        self.meta.add_segments(1, 10, vec![100, 101]);
        self.meta.add_segments(1, 11, vec![102]);
        self.meta
            .set_dm_channels(1, vec!["dm-0".to_owned(), "dm-1".to_owned()]);
    }
}

impl Default for TestCoord {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration with short retry intervals and grace periods.
pub fn fast_config() -> CoordConfig {
    CoordConfig {
        queue: QueueConfig { capacity: 64 },
        retry: RetryConfig {
            connect_attempts: 100,
            connect_interval: Duration::from_millis(10),
            recall_attempts: 3,
            recall_interval: Duration::from_millis(10),
        },
        cleanup: CleanupConfig {
            failed_task_grace: Duration::from_millis(50),
        },
    }
}

/// Polls an async predicate until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
