//! Segment rebalancing across worker nodes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use meridian_proto::{
    CollectionId, LoadBalanceRequest, LoadSegmentsRequest, PartitionId, SegmentId, TaskType,
    Timestamp, TriggerCondition,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoordError, Result};
use crate::task::codec::marshal_request;
use crate::task::load::LoadSegmentsTask;
use crate::task::{BaseTask, Task, TaskContext};

/// Moves segments off a set of source nodes.
///
/// Spawned with trigger condition `NodeDown` when a worker leaves the session
/// registry, or submitted directly by the balance policy. The source nodes
/// are excluded from placement so every child lands elsewhere.
#[derive(Debug)]
pub struct LoadBalanceTask {
    base: BaseTask,
    request: LoadBalanceRequest,
}

impl LoadBalanceTask {
    /// Creates a new load-balance trigger.
    #[must_use]
    pub fn new(
        request: LoadBalanceRequest,
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
    pub fn request(&self) -> &LoadBalanceRequest {
        &self.request
    }
}

#[async_trait]
impl Task for LoadBalanceTask {
    fn base(&self) -> &BaseTask {
        &self.base
    }

    fn task_type(&self) -> TaskType {
        TaskType::LoadBalanceSegments
    }

    fn timestamp(&self) -> Timestamp {
        self.request.base.timestamp
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        marshal_request(self.task_type(), &self.base, &self.request)
    }

    async fn pre_execute(&self, _ctx: &TaskContext) -> Result<()> {
        if self.request.source_node_ids.is_empty() {
            return Err(CoordError::TaskFailed(
                "load balance request names no source nodes".to_owned(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let sources = &self.request.source_node_ids;
        let sealed = &self.request.sealed_segment_ids;
        let mut moved = 0usize;

        for &source in sources {
            let located = ctx.meta().segments_on_node(source).await?;

            let mut grouped: BTreeMap<(CollectionId, PartitionId), Vec<SegmentId>> =
                BTreeMap::new();
            for location in located {
                if !sealed.is_empty() && !sealed.contains(&location.segment_id) {
                    continue;
                }
                grouped
                    .entry((location.collection_id, location.partition_id))
                    .or_default()
                    .push(location.segment_id);
            }

            for ((collection, partition), segment_ids) in grouped {
                moved += segment_ids.len();
                let request = LoadSegmentsRequest::new(
                    self.request.base,
                    collection,
                    partition,
                    segment_ids,
                );
                let child = Arc::new(LoadSegmentsTask::with_exclusions(
                    request,
                    self.base.trigger_condition(),
                    ctx.cancel_token(),
                    sources.clone(),
                ));
                ctx.add_child_task(&self.base, child).await?;
            }
        }

        if moved == 0 {
            debug!(task_id = self.base.id(), "no segments to balance");
        }
        Ok(())
    }

    async fn post_execute(&self, _ctx: &TaskContext) -> Result<()> {
        info!(
            task_id = self.base.id(),
            sources = ?self.request.source_node_ids,
            children = self.base.child_count(),
            "load balance complete"
        );
        Ok(())
    }
}
