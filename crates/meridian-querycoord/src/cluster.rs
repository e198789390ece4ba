//! Cluster view: the worker roster the scheduler dispatches against.
//!
//! The coordinator never talks to workers directly; it goes through this
//! trait. The production implementation wraps the grpc client pool and the
//! session registry. [`LocalCluster`] hosts in-process [`NodeHandler`]s and
//! serves embedding and tests, where removing a node stands in for a session
//! expiring from the registry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meridian_proto::{NodeId, NodeRequest, Status};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{CoordError, Result};

/// Events emitted by the session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// A worker joined the cluster.
    NodeUp(NodeId),
    /// A worker left the session registry.
    NodeDown(NodeId),
}

/// The worker roster and dispatch path.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Ids of the live workers, in ascending order.
    fn online_nodes(&self) -> Vec<NodeId>;

    /// Returns true if the node is currently live.
    fn is_online(&self, node: NodeId) -> bool;

    /// Deterministic placement: the lowest online node id not excluded.
    ///
    /// Given the same roster and exclusions, every call returns the same
    /// node.
    fn select_node(&self, exclude: &[NodeId]) -> Option<NodeId> {
        self.online_nodes()
            .into_iter()
            .find(|node| !exclude.contains(node))
    }

    /// Issues a worker RPC.
    ///
    /// An `Err` is a transport failure (retried by the caller); an `Ok`
    /// carrying an error status is a worker-side failure (not retried).
    async fn dispatch(&self, node: NodeId, request: NodeRequest) -> Result<Status>;

    /// Subscribes to roster changes.
    fn subscribe(&self) -> broadcast::Receiver<NodeEvent>;
}

/// Handles worker RPCs for one in-process node.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Handles one request, returning the worker's status record.
    async fn handle(&self, request: NodeRequest) -> Result<Status>;
}

/// In-process cluster over registered node handlers.
pub struct LocalCluster {
    nodes: DashMap<NodeId, Arc<dyn NodeHandler>>,
    events: broadcast::Sender<NodeEvent>,
}

impl LocalCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            nodes: DashMap::new(),
            events,
        }
    }

    /// Registers a worker node, announcing it to subscribers.
    pub fn register_node(&self, node: NodeId, handler: Arc<dyn NodeHandler>) {
        self.nodes.insert(node, handler);
        info!(node_id = node, "worker node registered");
        let _ = self.events.send(NodeEvent::NodeUp(node));
    }

    /// Removes a worker node, announcing the loss to subscribers.
    ///
    /// Returns false if the node was not registered.
    pub fn remove_node(&self, node: NodeId) -> bool {
        let removed = self.nodes.remove(&node).is_some();
        if removed {
            info!(node_id = node, "worker node removed");
            let _ = self.events.send(NodeEvent::NodeDown(node));
        }
        removed
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no nodes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    fn online_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.nodes.iter().map(|entry| *entry.key()).collect();
        nodes.sort_unstable();
        nodes
    }

    fn is_online(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    async fn dispatch(&self, node: NodeId, request: NodeRequest) -> Result<Status> {
        let handler = match self.nodes.get(&node) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Err(CoordError::WorkerUnavailable(node)),
        };
        handler.handle(request).await
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_proto::{LoadSegmentsRequest, MsgBase};

    struct AckHandler;

    #[async_trait]
    impl NodeHandler for AckHandler {
        async fn handle(&self, _request: NodeRequest) -> Result<Status> {
            Ok(Status::success())
        }
    }

    fn load_request() -> NodeRequest {
        NodeRequest::LoadSegments(LoadSegmentsRequest::new(MsgBase::new(1), 1, 10, vec![100]))
    }

    #[tokio::test]
    async fn dispatch_to_registered_node() {
        let cluster = LocalCluster::new();
        cluster.register_node(3, Arc::new(AckHandler));

        let status = cluster.dispatch(3, load_request()).await.unwrap();
        assert!(status.is_success());
    }

    #[tokio::test]
    async fn dispatch_to_missing_node_fails() {
        let cluster = LocalCluster::new();
        assert!(matches!(
            cluster.dispatch(9, load_request()).await,
            Err(CoordError::WorkerUnavailable(9))
        ));
    }

    #[test]
    fn select_node_is_deterministic() {
        let cluster = LocalCluster::new();
        cluster.register_node(5, Arc::new(AckHandler));
        cluster.register_node(2, Arc::new(AckHandler));
        cluster.register_node(8, Arc::new(AckHandler));

        assert_eq!(cluster.select_node(&[]), Some(2));
        assert_eq!(cluster.select_node(&[2]), Some(5));
        assert_eq!(cluster.select_node(&[2, 5, 8]), None);
    }

    #[test]
    fn remove_node_broadcasts() {
        let cluster = LocalCluster::new();
        cluster.register_node(1, Arc::new(AckHandler));
        let mut events = cluster.subscribe();

        assert!(cluster.remove_node(1));
        assert!(!cluster.remove_node(1));
        assert!(!cluster.is_online(1));

        assert_eq!(events.try_recv().unwrap(), NodeEvent::NodeDown(1));
    }
}
