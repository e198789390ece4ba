//! Release tasks: collection, partitions, and per-node segment releases.

use std::sync::Arc;

use async_trait::async_trait;
use meridian_proto::{
    NodeId, NodeRequest, ReleaseCollectionRequest, ReleasePartitionsRequest,
    ReleaseSegmentsRequest, TaskType, Timestamp, TriggerCondition,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoordError, Result};
use crate::task::codec::marshal_request;
use crate::task::{BaseTask, Task, TaskContext};

/// Releases a collection from the cluster.
///
/// The trigger fans out one per-node copy to every online worker; a copy
/// carries the target in its payload and dispatches the release RPC. A worker
/// that died before its release is treated as released.
#[derive(Debug)]
pub struct ReleaseCollectionTask {
    base: BaseTask,
    request: ReleaseCollectionRequest,
}

impl ReleaseCollectionTask {
    /// Creates a new release-collection task.
    #[must_use]
    pub fn new(
        request: ReleaseCollectionRequest,
        trigger: TriggerCondition,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            base: BaseTask::new(trigger, cancel),
            request,
        }
    }

    /// The request payload.
    #[must_use]
    pub fn request(&self) -> &ReleaseCollectionRequest {
        &self.request
    }
}

#[async_trait]
impl Task for ReleaseCollectionTask {
    fn base(&self) -> &BaseTask {
        &self.base
    }

    fn task_type(&self) -> TaskType {
        TaskType::ReleaseCollection
    }

    fn timestamp(&self) -> Timestamp {
        self.request.base.timestamp
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        marshal_request(self.task_type(), &self.base, &self.request)
    }

    fn target_node(&self) -> Option<NodeId> {
        self.request.node_id
    }

    async fn pre_execute(&self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        if self.is_trigger() {
            for node in ctx.cluster().online_nodes() {
                let request = self.request.clone().with_node(node);
                let child = Arc::new(Self::new(
                    request,
                    self.base.trigger_condition(),
                    ctx.cancel_token(),
                ));
                ctx.add_child_task(&self.base, child).await?;
            }
            return Ok(());
        }

        ctx.dispatch(self, NodeRequest::ReleaseCollection(self.request.clone()))
            .await?;
        Ok(())
    }

    async fn post_execute(&self, ctx: &TaskContext) -> Result<()> {
        if self.is_trigger() {
            ctx.meta()
                .record_collection_release(self.request.collection_id)
                .await?;
            info!(
                task_id = self.base.id(),
                collection_id = self.request.collection_id,
                "collection released"
            );
        }
        Ok(())
    }
}

/// Releases specific partitions of a collection.
#[derive(Debug)]
pub struct ReleasePartitionsTask {
    base: BaseTask,
    request: ReleasePartitionsRequest,
}

impl ReleasePartitionsTask {
    /// Creates a new release-partitions task.
    #[must_use]
    pub fn new(
        request: ReleasePartitionsRequest,
        trigger: TriggerCondition,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            base: BaseTask::new(trigger, cancel),
            request,
        }
    }

    /// The request payload.
    #[must_use]
    pub fn request(&self) -> &ReleasePartitionsRequest {
        &self.request
    }
}

#[async_trait]
impl Task for ReleasePartitionsTask {
    fn base(&self) -> &BaseTask {
        &self.base
    }

    fn task_type(&self) -> TaskType {
        TaskType::ReleasePartitions
    }

    fn timestamp(&self) -> Timestamp {
        self.request.base.timestamp
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        marshal_request(self.task_type(), &self.base, &self.request)
    }

    fn target_node(&self) -> Option<NodeId> {
        self.request.node_id
    }

    async fn pre_execute(&self, _ctx: &TaskContext) -> Result<()> {
        if self.request.partition_ids.is_empty() {
            return Err(CoordError::TaskFailed(
                "release partitions request names no partitions".to_owned(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        if self.is_trigger() {
            for node in ctx.cluster().online_nodes() {
                let request = self.request.clone().with_node(node);
                let child = Arc::new(Self::new(
                    request,
                    self.base.trigger_condition(),
                    ctx.cancel_token(),
                ));
                ctx.add_child_task(&self.base, child).await?;
            }
            return Ok(());
        }

        ctx.dispatch(self, NodeRequest::ReleasePartitions(self.request.clone()))
            .await?;
        Ok(())
    }

    async fn post_execute(&self, ctx: &TaskContext) -> Result<()> {
        if self.is_trigger() {
            ctx.meta()
                .record_partition_release(self.request.collection_id, &self.request.partition_ids)
                .await?;
            info!(
                task_id = self.base.id(),
                collection_id = self.request.collection_id,
                partitions = self.request.partition_ids.len(),
                "partitions released"
            );
        }
        Ok(())
    }
}

/// Releases sealed segments from one worker node.
#[derive(Debug)]
pub struct ReleaseSegmentsTask {
    base: BaseTask,
    request: ReleaseSegmentsRequest,
}

impl ReleaseSegmentsTask {
    /// Creates a new release-segments task.
    #[must_use]
    pub fn new(
        request: ReleaseSegmentsRequest,
        trigger: TriggerCondition,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            base: BaseTask::new(trigger, cancel),
            request,
        }
    }

    /// The request payload.
    #[must_use]
    pub fn request(&self) -> &ReleaseSegmentsRequest {
        &self.request
    }
}

#[async_trait]
impl Task for ReleaseSegmentsTask {
    fn base(&self) -> &BaseTask {
        &self.base
    }

    fn task_type(&self) -> TaskType {
        TaskType::ReleaseSegments
    }

    fn timestamp(&self) -> Timestamp {
        self.request.base.timestamp
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        marshal_request(self.task_type(), &self.base, &self.request)
    }

    fn target_node(&self) -> Option<NodeId> {
        self.request.node_id
    }

    async fn pre_execute(&self, _ctx: &TaskContext) -> Result<()> {
        if self.request.segment_ids.is_empty() {
            return Err(CoordError::TaskFailed(
                "release segments request names no segments".to_owned(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        if self.is_trigger() {
            let child = Arc::new(Self::new(
                self.request.clone(),
                self.base.trigger_condition(),
                ctx.cancel_token(),
            ));
            ctx.add_child_task(&self.base, child).await?;
            return Ok(());
        }

        ctx.dispatch(self, NodeRequest::ReleaseSegments(self.request.clone()))
            .await?;
        ctx.meta()
            .record_segment_release(&self.request.segment_ids)
            .await?;
        Ok(())
    }

    async fn post_execute(&self, _ctx: &TaskContext) -> Result<()> {
        debug!(
            task_id = self.base.id(),
            segments = self.request.segment_ids.len(),
            "segments released"
        );
        Ok(())
    }
}
