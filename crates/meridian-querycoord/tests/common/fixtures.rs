//! Node handlers and task builders for integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use meridian_proto::{
    AddQueryChannelRequest, LoadCollectionRequest, LoadSegmentsRequest, MsgBase, NodeRequest,
    Status, TriggerCondition,
};
use meridian_querycoord::{
    CoordError, LoadCollectionTask, LoadSegmentsTask, NodeHandler, Result, Task,
    WatchQueryChannelsTask,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Acknowledges every request and records it in arrival order.
#[derive(Default)]
pub struct AckNode {
    requests: Mutex<Vec<NodeRequest>>,
}

impl AckNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<NodeRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }
}

#[async_trait]
impl NodeHandler for AckNode {
    async fn handle(&self, request: NodeRequest) -> Result<Status> {
        self.requests
            .lock()
            .expect("request log poisoned")
            .push(request);
        Ok(Status::success())
    }
}

/// Fails every request with a transport error.
pub struct FailingNode;

#[async_trait]
impl NodeHandler for FailingNode {
    async fn handle(&self, _request: NodeRequest) -> Result<Status> {
        Err(CoordError::Internal("connection refused".to_owned()))
    }
}

/// Never responds; requests hang until the dispatch is cancelled.
pub struct BlackholeNode;

#[async_trait]
impl NodeHandler for BlackholeNode {
    async fn handle(&self, _request: NodeRequest) -> Result<Status> {
        std::future::pending().await
    }
}

/// Holds every request until the gate opens.
#[derive(Default)]
pub struct GatedNode {
    open: AtomicBool,
    notify: Notify,
}

impl GatedNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Releases all pending and future requests.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl NodeHandler for GatedNode {
    async fn handle(&self, _request: NodeRequest) -> Result<Status> {
        loop {
            if self.open.load(Ordering::SeqCst) {
                return Ok(Status::success());
            }
            let notified = self.notify.notified();
            if self.open.load(Ordering::SeqCst) {
                return Ok(Status::success());
            }
            notified.await;
        }
    }
}

/// A load-collection trigger for collection 1.
pub fn load_collection_trigger(cancel: CancellationToken, timestamp: u64) -> Arc<dyn Task> {
    Arc::new(LoadCollectionTask::new(
        LoadCollectionRequest::new(MsgBase::new(timestamp), 1),
        TriggerCondition::GrpcRequest,
        cancel,
    ))
}

/// A load-segments trigger carrying one segment, optionally pinned to a node.
pub fn load_segments_trigger(
    cancel: CancellationToken,
    timestamp: u64,
    segment: i64,
    node: Option<i64>,
) -> Arc<dyn Task> {
    let mut request = LoadSegmentsRequest::new(MsgBase::new(timestamp), 1, 10, vec![segment]);
    if let Some(node) = node {
        request = request.with_node(node);
    }
    Arc::new(LoadSegmentsTask::new(
        request,
        TriggerCondition::GrpcRequest,
        cancel,
    ))
}

/// A watch-query-channels trigger pinned to a node.
pub fn watch_query_channels_trigger(
    cancel: CancellationToken,
    timestamp: u64,
    node: i64,
) -> Arc<dyn Task> {
    let request = AddQueryChannelRequest::new(
        MsgBase::new(timestamp),
        1,
        "query-1-req".to_owned(),
        "query-1-res".to_owned(),
    )
    .with_node(node);
    Arc::new(WatchQueryChannelsTask::new(
        request,
        TriggerCondition::GrpcRequest,
        cancel,
    ))
}
