//! Protocol messages for the Meridian query coordinator.
//!
//! These messages flow between the coordinator and worker nodes:
//!
//! - **Coordinator → Worker**: load/release segments, watch channels
//! - **Submitter → Coordinator**: collection-level control requests
//!
//! The crate also provides the binary task codec used to persist tasks in the
//! coordinator's key-value store. Marshalled tasks are self-describing: a
//! fixed frame header carries the codec version and the task-type tag, so a
//! restarted coordinator can rebuild every task variant from its blob alone.

pub mod codec;
pub mod request;
pub mod types;

pub use codec::{decode_frame, decode_payload, encode_task, CodecError, TaskFrame};
pub use request::{
    AddQueryChannelRequest, LoadBalanceRequest, LoadCollectionRequest, LoadPartitionsRequest,
    LoadSegmentsRequest, NodeRequest, ReleaseCollectionRequest, ReleasePartitionsRequest,
    ReleaseSegmentsRequest, TaskType, TriggerCondition, WatchDmChannelsRequest,
};
pub use types::{
    CollectionId, ErrorCode, MsgBase, NodeId, PartitionId, SegmentId, Status, TaskId, Timestamp,
};

/// Codec version constants.
pub mod version {
    /// Current codec version.
    pub const CURRENT: u16 = 1;
    /// Oldest codec version this build can still decode.
    pub const MIN_SUPPORTED: u16 = 1;
}
