//! Load tasks: collection, partitions, and per-node segment loads.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use meridian_proto::{
    CollectionId, LoadCollectionRequest, LoadPartitionsRequest, LoadSegmentsRequest, MsgBase,
    NodeId, NodeRequest, PartitionId, SegmentId, TaskType, Timestamp, TriggerCondition,
    WatchDmChannelsRequest,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoordError, Result};
use crate::task::codec::marshal_request;
use crate::task::watch::{WatchDmChannelsTask, WatchQueryChannelsTask};
use crate::task::{BaseTask, Task, TaskContext};

/// Spawns the standard load fan-out: segments round-robin across the online
/// roster, dm channels likewise, and the query channel pair on every node
/// that received work.
async fn spawn_load_children(
    base: &BaseTask,
    ctx: &TaskContext,
    msg_base: MsgBase,
    collection: CollectionId,
    partitions: &[PartitionId],
) -> Result<()> {
    let nodes = ctx.cluster().online_nodes();
    if nodes.is_empty() {
        return Err(CoordError::NoEligibleWorker);
    }

    let trigger = base.trigger_condition();
    let mut involved: BTreeSet<NodeId> = BTreeSet::new();

    for &partition in partitions {
        let segments = ctx.meta().segments(collection, partition).await?;
        let mut per_node: BTreeMap<NodeId, Vec<SegmentId>> = BTreeMap::new();
        for (index, &segment) in segments.iter().enumerate() {
            per_node
                .entry(nodes[index % nodes.len()])
                .or_default()
                .push(segment);
        }

        for (node, segment_ids) in per_node {
            involved.insert(node);
            let request = LoadSegmentsRequest::new(msg_base, collection, partition, segment_ids)
                .with_node(node);
            let child = Arc::new(LoadSegmentsTask::new(request, trigger, ctx.cancel_token()));
            ctx.add_child_task(base, child).await?;
        }
    }

    let channels = ctx.meta().dm_channels(collection).await?;
    let mut per_node: BTreeMap<NodeId, Vec<String>> = BTreeMap::new();
    for (index, channel) in channels.into_iter().enumerate() {
        per_node
            .entry(nodes[index % nodes.len()])
            .or_default()
            .push(channel);
    }
    for (node, node_channels) in per_node {
        involved.insert(node);
        let request =
            WatchDmChannelsRequest::new(msg_base, collection, node_channels).with_node(node);
        let child = Arc::new(WatchDmChannelsTask::new(request, trigger, ctx.cancel_token()));
        ctx.add_child_task(base, child).await?;
    }

    if involved.is_empty() {
        involved.insert(nodes[0]);
    }
    let (request_channel, result_channel) = ctx.meta().query_channels(collection).await?;
    for node in involved {
        let request = meridian_proto::AddQueryChannelRequest::new(
            msg_base,
            collection,
            request_channel.clone(),
            result_channel.clone(),
        )
        .with_node(node);
        let child = Arc::new(WatchQueryChannelsTask::new(request, trigger, ctx.cancel_token()));
        ctx.add_child_task(base, child).await?;
    }

    Ok(())
}

/// Loads a whole collection onto the cluster.
#[derive(Debug)]
pub struct LoadCollectionTask {
    base: BaseTask,
    request: LoadCollectionRequest,
}

impl LoadCollectionTask {
    /// Creates a new load-collection trigger.
    #[must_use]
    pub fn new(
        request: LoadCollectionRequest,
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
    pub fn request(&self) -> &LoadCollectionRequest {
        &self.request
    }
}

#[async_trait]
impl Task for LoadCollectionTask {
    fn base(&self) -> &BaseTask {
        &self.base
    }

    fn task_type(&self) -> TaskType {
        TaskType::LoadCollection
    }

    fn timestamp(&self) -> Timestamp {
        self.request.base.timestamp
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        marshal_request(self.task_type(), &self.base, &self.request)
    }

    async fn pre_execute(&self, ctx: &TaskContext) -> Result<()> {
        ctx.meta().partitions(self.request.collection_id).await?;
        debug!(
            task_id = self.base.id(),
            collection_id = self.request.collection_id,
            "load collection validated"
        );
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let partitions = ctx.meta().partitions(self.request.collection_id).await?;
        spawn_load_children(
            &self.base,
            ctx,
            self.request.base,
            self.request.collection_id,
            &partitions,
        )
        .await
    }

    async fn post_execute(&self, _ctx: &TaskContext) -> Result<()> {
        info!(
            task_id = self.base.id(),
            collection_id = self.request.collection_id,
            children = self.base.child_count(),
            "collection loaded"
        );
        Ok(())
    }
}

/// Loads specific partitions of a collection.
#[derive(Debug)]
pub struct LoadPartitionsTask {
    base: BaseTask,
    request: LoadPartitionsRequest,
}

impl LoadPartitionsTask {
    /// Creates a new load-partitions trigger.
    #[must_use]
    pub fn new(
        request: LoadPartitionsRequest,
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
    pub fn request(&self) -> &LoadPartitionsRequest {
        &self.request
    }
}

#[async_trait]
impl Task for LoadPartitionsTask {
    fn base(&self) -> &BaseTask {
        &self.base
    }

    fn task_type(&self) -> TaskType {
        TaskType::LoadPartitions
    }

    fn timestamp(&self) -> Timestamp {
        self.request.base.timestamp
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        marshal_request(self.task_type(), &self.base, &self.request)
    }

    async fn pre_execute(&self, _ctx: &TaskContext) -> Result<()> {
        if self.request.partition_ids.is_empty() {
            return Err(CoordError::TaskFailed(
                "load partitions request names no partitions".to_owned(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        spawn_load_children(
            &self.base,
            ctx,
            self.request.base,
            self.request.collection_id,
            &self.request.partition_ids,
        )
        .await
    }

    async fn post_execute(&self, _ctx: &TaskContext) -> Result<()> {
        info!(
            task_id = self.base.id(),
            collection_id = self.request.collection_id,
            partitions = self.request.partition_ids.len(),
            "partitions loaded"
        );
        Ok(())
    }
}

/// Loads sealed segments onto one worker node.
///
/// Acts as a trigger when submitted directly; per-node copies produced during
/// a load fan-out carry a parent id and dispatch the worker RPC.
#[derive(Debug)]
pub struct LoadSegmentsTask {
    base: BaseTask,
    request: LoadSegmentsRequest,
    exclude_nodes: Mutex<Vec<NodeId>>,
}

impl LoadSegmentsTask {
    /// Creates a new load-segments task.
    #[must_use]
    pub fn new(
        request: LoadSegmentsRequest,
        trigger: TriggerCondition,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_exclusions(request, trigger, cancel, Vec::new())
    }

    pub(crate) fn with_exclusions(
        request: LoadSegmentsRequest,
        trigger: TriggerCondition,
        cancel: CancellationToken,
        exclude_nodes: Vec<NodeId>,
    ) -> Self {
        Self {
            base: BaseTask::new(trigger, cancel),
            request,
            exclude_nodes: Mutex::new(exclude_nodes),
        }
    }

    /// The request payload.
    #[must_use]
    pub fn request(&self) -> &LoadSegmentsRequest {
        &self.request
    }
}

#[async_trait]
impl Task for LoadSegmentsTask {
    fn base(&self) -> &BaseTask {
        &self.base
    }

    fn task_type(&self) -> TaskType {
        TaskType::LoadSegments
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

    fn exclude_node(&self, node: NodeId) {
        let mut excluded = self.exclude_nodes.lock();
        if !excluded.contains(&node) {
            excluded.push(node);
        }
    }

    fn excluded_nodes(&self) -> Vec<NodeId> {
        self.exclude_nodes.lock().clone()
    }

    fn reissue(&self, cancel: CancellationToken) -> Option<Arc<dyn Task>> {
        Some(Arc::new(Self::with_exclusions(
            self.request.clone(),
            self.base.trigger_condition(),
            cancel,
            self.excluded_nodes(),
        )))
    }

    async fn pre_execute(&self, _ctx: &TaskContext) -> Result<()> {
        if self.request.segment_ids.is_empty() {
            return Err(CoordError::TaskFailed(
                "load segments request names no segments".to_owned(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        if self.is_trigger() {
            let child = Arc::new(Self::with_exclusions(
                self.request.clone(),
                self.base.trigger_condition(),
                ctx.cancel_token(),
                self.excluded_nodes(),
            ));
            ctx.add_child_task(&self.base, child).await?;
            return Ok(());
        }

        let node = ctx
            .dispatch(self, NodeRequest::LoadSegments(self.request.clone()))
            .await?;
        ctx.meta()
            .record_segment_load(
                node,
                self.request.collection_id,
                self.request.partition_id,
                &self.request.segment_ids,
            )
            .await?;
        Ok(())
    }

    async fn post_execute(&self, _ctx: &TaskContext) -> Result<()> {
        debug!(
            task_id = self.base.id(),
            segments = self.request.segment_ids.len(),
            "segments loaded"
        );
        Ok(())
    }
}
