//! Meta view: collection, partition, segment, and channel membership.
//!
//! The scheduler reads this view to decide which children a trigger spawns,
//! and writes load-state changes back after children complete. The production
//! implementation fronts the external meta store; [`MemoryMeta`] serves tests
//! and embedded use.

use async_trait::async_trait;
use dashmap::DashMap;
use meridian_proto::{CollectionId, NodeId, PartitionId, SegmentId};
use tracing::debug;

use crate::error::{CoordError, Result};

/// Where a loaded segment currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLocation {
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Owning partition.
    pub partition_id: PartitionId,
    /// The segment.
    pub segment_id: SegmentId,
    /// Node currently serving it.
    pub node_id: NodeId,
}

/// Read and update access to cluster metadata.
#[async_trait]
pub trait MetaView: Send + Sync {
    /// Partitions of a collection.
    async fn partitions(&self, collection: CollectionId) -> Result<Vec<PartitionId>>;

    /// Sealed segments of a partition.
    async fn segments(
        &self,
        collection: CollectionId,
        partition: PartitionId,
    ) -> Result<Vec<SegmentId>>;

    /// Data-manipulation channels of a collection.
    async fn dm_channels(&self, collection: CollectionId) -> Result<Vec<String>>;

    /// The (request, result) query channel pair of a collection.
    async fn query_channels(&self, collection: CollectionId) -> Result<(String, String)>;

    /// Segments currently served by a node.
    async fn segments_on_node(&self, node: NodeId) -> Result<Vec<SegmentLocation>>;

    /// Records that segments finished loading on a node.
    async fn record_segment_load(
        &self,
        node: NodeId,
        collection: CollectionId,
        partition: PartitionId,
        segments: &[SegmentId],
    ) -> Result<()>;

    /// Records that a node started watching channels.
    async fn record_channel_watch(
        &self,
        node: NodeId,
        collection: CollectionId,
        channels: &[String],
    ) -> Result<()>;

    /// Clears load state for a whole collection.
    async fn record_collection_release(&self, collection: CollectionId) -> Result<()>;

    /// Clears load state for specific partitions.
    async fn record_partition_release(
        &self,
        collection: CollectionId,
        partitions: &[PartitionId],
    ) -> Result<()>;

    /// Clears load state for specific segments.
    async fn record_segment_release(&self, segments: &[SegmentId]) -> Result<()>;
}

/// In-memory meta view.
#[derive(Debug, Default)]
pub struct MemoryMeta {
    partitions: DashMap<CollectionId, Vec<PartitionId>>,
    segments: DashMap<(CollectionId, PartitionId), Vec<SegmentId>>,
    channels: DashMap<CollectionId, Vec<String>>,
    locations: DashMap<SegmentId, SegmentLocation>,
    watches: DashMap<NodeId, Vec<(CollectionId, String)>>,
}

impl MemoryMeta {
    /// Creates an empty meta view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a collection and its partitions.
    pub fn add_collection(&self, collection: CollectionId, partitions: Vec<PartitionId>) {
        self.partitions.insert(collection, partitions);
    }

    /// Registers sealed segments under a partition.
    pub fn add_segments(
        &self,
        collection: CollectionId,
        partition: PartitionId,
        segments: Vec<SegmentId>,
    ) {
        self.segments.insert((collection, partition), segments);
    }

    /// Registers the dm channels of a collection.
    pub fn set_dm_channels(&self, collection: CollectionId, channels: Vec<String>) {
        self.channels.insert(collection, channels);
    }

    /// Node currently serving a segment, if loaded.
    #[must_use]
    pub fn segment_node(&self, segment: SegmentId) -> Option<NodeId> {
        self.locations.get(&segment).map(|loc| loc.node_id)
    }

    /// Number of loaded segments across the cluster.
    #[must_use]
    pub fn loaded_segment_count(&self) -> usize {
        self.locations.len()
    }
}

#[async_trait]
impl MetaView for MemoryMeta {
    async fn partitions(&self, collection: CollectionId) -> Result<Vec<PartitionId>> {
        self.partitions
            .get(&collection)
            .map(|entry| entry.clone())
            .ok_or(CoordError::CollectionNotFound(collection))
    }

    async fn segments(
        &self,
        collection: CollectionId,
        partition: PartitionId,
    ) -> Result<Vec<SegmentId>> {
        Ok(self
            .segments
            .get(&(collection, partition))
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn dm_channels(&self, collection: CollectionId) -> Result<Vec<String>> {
        Ok(self
            .channels
            .get(&collection)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn query_channels(&self, collection: CollectionId) -> Result<(String, String)> {
        Ok((
            format!("query-{collection}-req"),
            format!("query-{collection}-res"),
        ))
    }

    async fn segments_on_node(&self, node: NodeId) -> Result<Vec<SegmentLocation>> {
        let mut located: Vec<SegmentLocation> = self
            .locations
            .iter()
            .filter(|entry| entry.node_id == node)
            .map(|entry| *entry.value())
            .collect();
        located.sort_unstable_by_key(|loc| loc.segment_id);
        Ok(located)
    }

    async fn record_segment_load(
        &self,
        node: NodeId,
        collection: CollectionId,
        partition: PartitionId,
        segments: &[SegmentId],
    ) -> Result<()> {
        for &segment_id in segments {
            self.locations.insert(
                segment_id,
                SegmentLocation {
                    collection_id: collection,
                    partition_id: partition,
                    segment_id,
                    node_id: node,
                },
            );
        }
        debug!(node_id = node, count = segments.len(), "segments recorded as loaded");
        Ok(())
    }

    async fn record_channel_watch(
        &self,
        node: NodeId,
        collection: CollectionId,
        channels: &[String],
    ) -> Result<()> {
        let mut entry = self.watches.entry(node).or_default();
        for channel in channels {
            entry.push((collection, channel.clone()));
        }
        Ok(())
    }

    async fn record_collection_release(&self, collection: CollectionId) -> Result<()> {
        self.locations
            .retain(|_, loc| loc.collection_id != collection);
        for mut entry in self.watches.iter_mut() {
            entry.value_mut().retain(|(c, _)| *c != collection);
        }
        Ok(())
    }

    async fn record_partition_release(
        &self,
        collection: CollectionId,
        partitions: &[PartitionId],
    ) -> Result<()> {
        self.locations.retain(|_, loc| {
            loc.collection_id != collection || !partitions.contains(&loc.partition_id)
        });
        Ok(())
    }

    async fn record_segment_release(&self, segments: &[SegmentId]) -> Result<()> {
        for segment in segments {
            self.locations.remove(segment);
        }
        Ok(())
    }
}
