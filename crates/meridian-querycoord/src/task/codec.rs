//! Marshalling and unmarshalling of task variants.
//!
//! Dispatches on the frame tag to rebuild the right variant. The blob format
//! itself lives in `meridian-proto`; this module binds it to the task types.

use std::sync::Arc;

use meridian_proto::codec::{self as frame, CodecError};
use meridian_proto::{
    AddQueryChannelRequest, LoadBalanceRequest, LoadCollectionRequest, LoadPartitionsRequest,
    LoadSegmentsRequest, ReleaseCollectionRequest, ReleasePartitionsRequest,
    ReleaseSegmentsRequest, TaskId, TaskType, TriggerCondition, WatchDmChannelsRequest,
};
use rkyv::api::high::HighSerializer;
use rkyv::rancor::Error as RkyvError;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};
use crate::task::balance::LoadBalanceTask;
use crate::task::load::{LoadCollectionTask, LoadPartitionsTask, LoadSegmentsTask};
use crate::task::release::{ReleaseCollectionTask, ReleasePartitionsTask, ReleaseSegmentsTask};
use crate::task::watch::{WatchDmChannelsTask, WatchQueryChannelsTask};
use crate::task::{BaseTask, Task};

/// Encodes a task's tag, parent link, and request payload as a kv value.
pub(crate) fn marshal_request<T>(
    task_type: TaskType,
    base: &BaseTask,
    request: &T,
) -> Result<Vec<u8>>
where
    T: for<'a> rkyv::Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    frame::encode_task(task_type, base.parent_id(), request).map_err(into_coord_error)
}

fn into_coord_error(err: CodecError) -> CoordError {
    match err {
        CodecError::UnknownTaskType(tag) => CoordError::UnknownTaskType(tag),
        CodecError::Serialisation(msg) => CoordError::Internal(msg),
        other => CoordError::CorruptTask(other.to_string()),
    }
}

/// Rebuilds a task from its marshalled blob.
///
/// The caller supplies the id (the kv key suffix). The rebuilt task carries a
/// fresh condition, state `Undefined`, and origin `RecoveredFromKv`; the
/// recovery loader applies the persisted state afterwards.
pub fn unmarshal_task(id: TaskId, blob: &[u8], cancel: CancellationToken) -> Result<Arc<dyn Task>> {
    let (header, payload) = frame::decode_frame(blob).map_err(into_coord_error)?;
    let trigger = TriggerCondition::RecoveredFromKv;

    let task: Arc<dyn Task> = match header.task_type {
        TaskType::LoadCollection => {
            let request: LoadCollectionRequest =
                frame::decode_payload(payload).map_err(into_coord_error)?;
            Arc::new(LoadCollectionTask::new(request, trigger, cancel))
        }
        TaskType::LoadPartitions => {
            let request: LoadPartitionsRequest =
                frame::decode_payload(payload).map_err(into_coord_error)?;
            Arc::new(LoadPartitionsTask::new(request, trigger, cancel))
        }
        TaskType::ReleaseCollection => {
            let request: ReleaseCollectionRequest =
                frame::decode_payload(payload).map_err(into_coord_error)?;
            Arc::new(ReleaseCollectionTask::new(request, trigger, cancel))
        }
        TaskType::ReleasePartitions => {
            let request: ReleasePartitionsRequest =
                frame::decode_payload(payload).map_err(into_coord_error)?;
            Arc::new(ReleasePartitionsTask::new(request, trigger, cancel))
        }
        TaskType::LoadSegments => {
            let request: LoadSegmentsRequest =
                frame::decode_payload(payload).map_err(into_coord_error)?;
            Arc::new(LoadSegmentsTask::new(request, trigger, cancel))
        }
        TaskType::ReleaseSegments => {
            let request: ReleaseSegmentsRequest =
                frame::decode_payload(payload).map_err(into_coord_error)?;
            Arc::new(ReleaseSegmentsTask::new(request, trigger, cancel))
        }
        TaskType::WatchDmChannels => {
            let request: WatchDmChannelsRequest =
                frame::decode_payload(payload).map_err(into_coord_error)?;
            Arc::new(WatchDmChannelsTask::new(request, trigger, cancel))
        }
        TaskType::WatchQueryChannels => {
            let request: AddQueryChannelRequest =
                frame::decode_payload(payload).map_err(into_coord_error)?;
            Arc::new(WatchQueryChannelsTask::new(request, trigger, cancel))
        }
        TaskType::LoadBalanceSegments => {
            let request: LoadBalanceRequest =
                frame::decode_payload(payload).map_err(into_coord_error)?;
            Arc::new(LoadBalanceTask::new(request, trigger, cancel))
        }
    };

    task.base().set_id(id);
    task.base().set_parent_id(header.parent_id);
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use meridian_proto::MsgBase;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn roundtrip_preserves_type_and_parent() {
        let task = LoadSegmentsTask::new(
            LoadSegmentsRequest::new(MsgBase::new(5), 1, 10, vec![100, 101]).with_node(3),
            TriggerCondition::GrpcRequest,
            cancel(),
        );
        task.base().set_parent_id(Some(77));

        let blob = task.marshal().unwrap();
        let rebuilt = unmarshal_task(200, &blob, cancel()).unwrap();

        assert_eq!(rebuilt.task_type(), TaskType::LoadSegments);
        assert_eq!(rebuilt.id(), 200);
        assert_eq!(rebuilt.base().parent_id(), Some(77));
        assert_eq!(rebuilt.base().state(), TaskState::Undefined);
        assert_eq!(rebuilt.timestamp(), 5);
        assert_eq!(rebuilt.target_node(), Some(3));
    }

    #[test]
    fn unknown_tag_surfaces_as_unknown_task_type() {
        let task = LoadCollectionTask::new(
            LoadCollectionRequest::new(MsgBase::new(1), 1),
            TriggerCondition::GrpcRequest,
            cancel(),
        );
        let mut blob = task.marshal().unwrap();
        blob[2..4].copy_from_slice(&0x7fffu16.to_be_bytes());

        assert!(matches!(
            unmarshal_task(1, &blob, cancel()),
            Err(CoordError::UnknownTaskType(0x7fff))
        ));
    }

    #[test]
    fn truncated_blob_surfaces_as_corrupt() {
        let task = LoadCollectionTask::new(
            LoadCollectionRequest::new(MsgBase::new(1), 1),
            TriggerCondition::GrpcRequest,
            cancel(),
        );
        let mut blob = task.marshal().unwrap();
        blob.truncate(blob.len() - 2);

        assert!(matches!(
            unmarshal_task(1, &blob, cancel()),
            Err(CoordError::CorruptTask(_))
        ));
    }

    #[test]
    fn garbage_payload_surfaces_as_corrupt() {
        assert!(matches!(
            unmarshal_task(1, &[0u8; 3], cancel()),
            Err(CoordError::CorruptTask(_))
        ));
    }
}
