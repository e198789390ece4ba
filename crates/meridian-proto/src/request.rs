//! Task request payloads.
//!
//! One request type per task variant. Collection-level requests are submitted
//! by external callers; node-targeted requests additionally carry an optional
//! `node_id` filled in when a trigger fans out per-node work.

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::{CollectionId, MsgBase, NodeId, PartitionId, SegmentId};

/// Task type discriminant, also the codec frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TaskType {
    /// Load a whole collection onto the cluster.
    LoadCollection = 0x01,
    /// Load specific partitions of a collection.
    LoadPartitions = 0x02,
    /// Release a collection from the cluster.
    ReleaseCollection = 0x03,
    /// Release specific partitions.
    ReleasePartitions = 0x04,
    /// Load sealed segments onto one node.
    LoadSegments = 0x05,
    /// Release sealed segments from one node.
    ReleaseSegments = 0x06,
    /// Watch data-manipulation channels on one node.
    WatchDmChannels = 0x07,
    /// Attach the query channel pair on one node.
    WatchQueryChannels = 0x08,
    /// Move segments between nodes.
    LoadBalanceSegments = 0x09,
}

impl TaskType {
    /// Creates a task type from its numeric tag.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Self::LoadCollection),
            0x02 => Some(Self::LoadPartitions),
            0x03 => Some(Self::ReleaseCollection),
            0x04 => Some(Self::ReleasePartitions),
            0x05 => Some(Self::LoadSegments),
            0x06 => Some(Self::ReleaseSegments),
            0x07 => Some(Self::WatchDmChannels),
            0x08 => Some(Self::WatchQueryChannels),
            0x09 => Some(Self::LoadBalanceSegments),
            _ => None,
        }
    }

    /// Returns the numeric tag of this task type.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LoadCollection => "load-collection",
            Self::LoadPartitions => "load-partitions",
            Self::ReleaseCollection => "release-collection",
            Self::ReleasePartitions => "release-partitions",
            Self::LoadSegments => "load-segments",
            Self::ReleaseSegments => "release-segments",
            Self::WatchDmChannels => "watch-dm-channels",
            Self::WatchQueryChannels => "watch-query-channels",
            Self::LoadBalanceSegments => "load-balance-segments",
        };
        write!(f, "{name}")
    }
}

/// Origin of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCondition {
    /// Submitted by an external RPC caller.
    GrpcRequest,
    /// Created while recovering from a lost worker node.
    NodeDown,
    /// Created by the load-balance policy.
    LoadBalance,
    /// Rebuilt from the key-value store at startup.
    RecoveredFromKv,
}

/// Request to load a whole collection.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoadCollectionRequest {
    /// Common base fields.
    pub base: MsgBase,
    /// Collection to load.
    pub collection_id: CollectionId,
}

impl LoadCollectionRequest {
    /// Creates a new load-collection request.
    #[must_use]
    pub const fn new(base: MsgBase, collection_id: CollectionId) -> Self {
        Self {
            base,
            collection_id,
        }
    }
}

/// Request to load specific partitions of a collection.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoadPartitionsRequest {
    /// Common base fields.
    pub base: MsgBase,
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Partitions to load.
    pub partition_ids: Vec<PartitionId>,
}

impl LoadPartitionsRequest {
    /// Creates a new load-partitions request.
    #[must_use]
    pub const fn new(
        base: MsgBase,
        collection_id: CollectionId,
        partition_ids: Vec<PartitionId>,
    ) -> Self {
        Self {
            base,
            collection_id,
            partition_ids,
        }
    }
}

/// Request to release a collection.
///
/// With no `node_id` this is a trigger that fans out to every online node;
/// with one it releases that node only.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReleaseCollectionRequest {
    /// Common base fields.
    pub base: MsgBase,
    /// Collection to release.
    pub collection_id: CollectionId,
    /// Target node for per-node copies.
    pub node_id: Option<NodeId>,
}

impl ReleaseCollectionRequest {
    /// Creates a new release-collection request.
    #[must_use]
    pub const fn new(base: MsgBase, collection_id: CollectionId) -> Self {
        Self {
            base,
            collection_id,
            node_id: None,
        }
    }

    /// Targets a specific node.
    #[must_use]
    pub const fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Request to release specific partitions.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReleasePartitionsRequest {
    /// Common base fields.
    pub base: MsgBase,
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Partitions to release.
    pub partition_ids: Vec<PartitionId>,
    /// Target node for per-node copies.
    pub node_id: Option<NodeId>,
}

impl ReleasePartitionsRequest {
    /// Creates a new release-partitions request.
    #[must_use]
    pub const fn new(
        base: MsgBase,
        collection_id: CollectionId,
        partition_ids: Vec<PartitionId>,
    ) -> Self {
        Self {
            base,
            collection_id,
            partition_ids,
            node_id: None,
        }
    }

    /// Targets a specific node.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Request to load sealed segments onto one node.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoadSegmentsRequest {
    /// Common base fields.
    pub base: MsgBase,
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Owning partition.
    pub partition_id: PartitionId,
    /// Segments to load.
    pub segment_ids: Vec<SegmentId>,
    /// Target node; resolved by placement when absent.
    pub node_id: Option<NodeId>,
}

impl LoadSegmentsRequest {
    /// Creates a new load-segments request.
    #[must_use]
    pub const fn new(
        base: MsgBase,
        collection_id: CollectionId,
        partition_id: PartitionId,
        segment_ids: Vec<SegmentId>,
    ) -> Self {
        Self {
            base,
            collection_id,
            partition_id,
            segment_ids,
            node_id: None,
        }
    }

    /// Targets a specific node.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Request to release sealed segments from one node.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSegmentsRequest {
    /// Common base fields.
    pub base: MsgBase,
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Segments to release.
    pub segment_ids: Vec<SegmentId>,
    /// Target node; resolved by placement when absent.
    pub node_id: Option<NodeId>,
}

impl ReleaseSegmentsRequest {
    /// Creates a new release-segments request.
    #[must_use]
    pub const fn new(
        base: MsgBase,
        collection_id: CollectionId,
        segment_ids: Vec<SegmentId>,
    ) -> Self {
        Self {
            base,
            collection_id,
            segment_ids,
            node_id: None,
        }
    }

    /// Targets a specific node.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Request to watch data-manipulation channels on one node.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WatchDmChannelsRequest {
    /// Common base fields.
    pub base: MsgBase,
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Channel names to watch.
    pub channels: Vec<String>,
    /// Target node; resolved by placement when absent.
    pub node_id: Option<NodeId>,
}

impl WatchDmChannelsRequest {
    /// Creates a new watch-dm-channels request.
    #[must_use]
    pub const fn new(base: MsgBase, collection_id: CollectionId, channels: Vec<String>) -> Self {
        Self {
            base,
            collection_id,
            channels,
            node_id: None,
        }
    }

    /// Targets a specific node.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Request to attach the query channel pair on one node.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddQueryChannelRequest {
    /// Common base fields.
    pub base: MsgBase,
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Channel carrying search requests.
    pub request_channel: String,
    /// Channel carrying search results.
    pub result_channel: String,
    /// Target node; resolved by placement when absent.
    pub node_id: Option<NodeId>,
}

impl AddQueryChannelRequest {
    /// Creates a new add-query-channel request.
    #[must_use]
    pub const fn new(
        base: MsgBase,
        collection_id: CollectionId,
        request_channel: String,
        result_channel: String,
    ) -> Self {
        Self {
            base,
            collection_id,
            request_channel,
            result_channel,
            node_id: None,
        }
    }

    /// Targets a specific node.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Request to move segments off a set of source nodes.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoadBalanceRequest {
    /// Common base fields.
    pub base: MsgBase,
    /// Nodes whose segments are being moved away.
    pub source_node_ids: Vec<NodeId>,
    /// Specific segments to move; empty means everything on the sources.
    pub sealed_segment_ids: Vec<SegmentId>,
}

impl LoadBalanceRequest {
    /// Creates a new load-balance request.
    #[must_use]
    pub const fn new(base: MsgBase, source_node_ids: Vec<NodeId>) -> Self {
        Self {
            base,
            source_node_ids,
            sealed_segment_ids: Vec::new(),
        }
    }

    /// Restricts the balance to specific segments.
    #[must_use]
    pub fn with_sealed_segments(mut self, sealed_segment_ids: Vec<SegmentId>) -> Self {
        self.sealed_segment_ids = sealed_segment_ids;
        self
    }
}

/// Request dispatched to a single worker node.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum NodeRequest {
    /// Load sealed segments.
    LoadSegments(LoadSegmentsRequest),
    /// Release sealed segments.
    ReleaseSegments(ReleaseSegmentsRequest),
    /// Watch data-manipulation channels.
    WatchDmChannels(WatchDmChannelsRequest),
    /// Attach the query channel pair.
    AddQueryChannel(AddQueryChannelRequest),
    /// Release partitions.
    ReleasePartitions(ReleasePartitionsRequest),
    /// Release a collection.
    ReleaseCollection(ReleaseCollectionRequest),
}

impl NodeRequest {
    /// Returns the task type this request belongs to.
    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        match self {
            Self::LoadSegments(_) => TaskType::LoadSegments,
            Self::ReleaseSegments(_) => TaskType::ReleaseSegments,
            Self::WatchDmChannels(_) => TaskType::WatchDmChannels,
            Self::AddQueryChannel(_) => TaskType::WatchQueryChannels,
            Self::ReleasePartitions(_) => TaskType::ReleasePartitions,
            Self::ReleaseCollection(_) => TaskType::ReleaseCollection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_tag_roundtrip() {
        for tag in 0x01..=0x09u16 {
            let task_type = TaskType::from_u16(tag).unwrap();
            assert_eq!(task_type.as_u16(), tag);
        }
        assert!(TaskType::from_u16(0x0a).is_none());
        assert!(TaskType::from_u16(0).is_none());
    }

    #[test]
    fn node_request_task_type() {
        let request = LoadSegmentsRequest::new(MsgBase::new(1), 1, 10, vec![100]).with_node(7);
        assert_eq!(
            NodeRequest::LoadSegments(request).task_type(),
            TaskType::LoadSegments
        );
    }
}
