//! Channel watch tasks: dm channels and the query channel pair.

use std::sync::Arc;

use async_trait::async_trait;
use meridian_proto::{
    AddQueryChannelRequest, NodeId, NodeRequest, TaskType, Timestamp, TriggerCondition,
    WatchDmChannelsRequest,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoordError, Result};
use crate::task::codec::marshal_request;
use crate::task::{BaseTask, Task, TaskContext};

/// Subscribes one worker node to data-manipulation channels.
///
/// Acts as a trigger when submitted directly; the per-node copy carries a
/// parent id and dispatches the worker RPC.
#[derive(Debug)]
pub struct WatchDmChannelsTask {
    base: BaseTask,
    request: WatchDmChannelsRequest,
    exclude_nodes: Mutex<Vec<NodeId>>,
}

impl WatchDmChannelsTask {
    /// Creates a new watch-dm-channels task.
    #[must_use]
    pub fn new(
        request: WatchDmChannelsRequest,
        trigger: TriggerCondition,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_exclusions(request, trigger, cancel, Vec::new())
    }

    pub(crate) fn with_exclusions(
        request: WatchDmChannelsRequest,
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
    pub fn request(&self) -> &WatchDmChannelsRequest {
        &self.request
    }
}

#[async_trait]
impl Task for WatchDmChannelsTask {
    fn base(&self) -> &BaseTask {
        &self.base
    }

    fn task_type(&self) -> TaskType {
        TaskType::WatchDmChannels
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
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        if self.is_trigger() {
            let mut request = self.request.clone();
            if request.channels.is_empty() {
                request.channels = ctx.meta().dm_channels(request.collection_id).await?;
            }
            if request.channels.is_empty() {
                return Err(CoordError::TaskFailed(
                    "collection has no dm channels to watch".to_owned(),
                ));
            }
            let child = Arc::new(Self::with_exclusions(
                request,
                self.base.trigger_condition(),
                ctx.cancel_token(),
                self.excluded_nodes(),
            ));
            ctx.add_child_task(&self.base, child).await?;
            return Ok(());
        }

        let node = ctx
            .dispatch(self, NodeRequest::WatchDmChannels(self.request.clone()))
            .await?;
        ctx.meta()
            .record_channel_watch(node, self.request.collection_id, &self.request.channels)
            .await?;
        Ok(())
    }

    async fn post_execute(&self, _ctx: &TaskContext) -> Result<()> {
        debug!(
            task_id = self.base.id(),
            channels = self.request.channels.len(),
            "dm channels watched"
        );
        Ok(())
    }
}

/// Attaches the query channel pair on one worker node.
#[derive(Debug)]
pub struct WatchQueryChannelsTask {
    base: BaseTask,
    request: AddQueryChannelRequest,
    exclude_nodes: Mutex<Vec<NodeId>>,
}

impl WatchQueryChannelsTask {
    /// Creates a new watch-query-channels task.
    #[must_use]
    pub fn new(
        request: AddQueryChannelRequest,
        trigger: TriggerCondition,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_exclusions(request, trigger, cancel, Vec::new())
    }

    pub(crate) fn with_exclusions(
        request: AddQueryChannelRequest,
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
    pub fn request(&self) -> &AddQueryChannelRequest {
        &self.request
    }
}

#[async_trait]
impl Task for WatchQueryChannelsTask {
    fn base(&self) -> &BaseTask {
        &self.base
    }

    fn task_type(&self) -> TaskType {
        TaskType::WatchQueryChannels
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
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        if self.is_trigger() {
            let mut request = self.request.clone();
            if request.request_channel.is_empty() {
                let (request_channel, result_channel) =
                    ctx.meta().query_channels(request.collection_id).await?;
                request.request_channel = request_channel;
                request.result_channel = result_channel;
            }
            let child = Arc::new(Self::with_exclusions(
                request,
                self.base.trigger_condition(),
                ctx.cancel_token(),
                self.excluded_nodes(),
            ));
            ctx.add_child_task(&self.base, child).await?;
            return Ok(());
        }

        ctx.dispatch(self, NodeRequest::AddQueryChannel(self.request.clone()))
            .await?;
        Ok(())
    }

    async fn post_execute(&self, _ctx: &TaskContext) -> Result<()> {
        debug!(
            task_id = self.base.id(),
            collection_id = self.request.collection_id,
            "query channels attached"
        );
        Ok(())
    }
}
