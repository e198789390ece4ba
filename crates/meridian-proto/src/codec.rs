//! Task frame encoding and decoding.
//!
//! A marshalled task is a fixed-size big-endian header followed by the
//! rkyv-serialised request payload. The header makes the blob self-describing
//! so recovery can rebuild any task variant without out-of-band context.

use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor::Error as RkyvError;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

use crate::request::TaskType;
use crate::types::TaskId;

/// Task frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Maximum marshalled task size (4 MB).
pub const MAX_TASK_SIZE: usize = 4 * 1024 * 1024;

/// Errors raised by the task codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame carries a tag this build does not know.
    #[error("unknown task type tag: {0:#06x}")]
    UnknownTaskType(u16),

    /// The frame was written by an incompatible codec version.
    #[error("unsupported codec version: {0}")]
    UnsupportedVersion(u16),

    /// The frame is truncated or its payload does not decode.
    #[error("corrupt task frame: {0}")]
    Corrupt(String),

    /// Serialisation failed.
    #[error("serialisation failed: {0}")]
    Serialisation(String),

    /// The payload exceeds the size limit.
    #[error("task frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual payload size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },
}

/// Frame header for marshalled tasks.
///
/// Wire format (16 bytes, big-endian):
/// - Bytes 0-1: codec version (u16)
/// - Bytes 2-3: task type tag (u16)
/// - Bytes 4-7: payload length (u32)
/// - Bytes 8-15: parent task id (i64, zero for trigger tasks)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskFrame {
    /// Codec version the frame was written with.
    pub version: u16,
    /// Task type tag.
    pub task_type: TaskType,
    /// Length of the payload in bytes.
    pub payload_len: u32,
    /// Parent task id, `None` for trigger tasks.
    pub parent_id: Option<TaskId>,
}

impl TaskFrame {
    /// Creates a new frame header at the current codec version.
    #[must_use]
    pub const fn new(task_type: TaskType, payload_len: u32, parent_id: Option<TaskId>) -> Self {
        Self {
            version: crate::version::CURRENT,
            task_type,
            payload_len,
            parent_id,
        }
    }

    /// Encodes the frame header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.task_type.as_u16().to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[8..16].copy_from_slice(&self.parent_id.unwrap_or(0).to_be_bytes());
        buf
    }

    /// Decodes a frame header from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(CodecError::Corrupt("truncated frame header".to_owned()));
        }

        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if !(crate::version::MIN_SUPPORTED..=crate::version::CURRENT).contains(&version) {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let tag = u16::from_be_bytes([bytes[2], bytes[3]]);
        let task_type = TaskType::from_u16(tag).ok_or(CodecError::UnknownTaskType(tag))?;

        let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let mut parent_bytes = [0u8; 8];
        parent_bytes.copy_from_slice(&bytes[8..16]);
        let parent_raw = i64::from_be_bytes(parent_bytes);
        let parent_id = (parent_raw != 0).then_some(parent_raw);

        Ok(Self {
            version,
            task_type,
            payload_len,
            parent_id,
        })
    }
}

/// Encodes a task as a complete frame (header + payload).
pub fn encode_task<T>(
    task_type: TaskType,
    parent_id: Option<TaskId>,
    payload: &T,
) -> Result<Vec<u8>, CodecError>
where
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    let payload =
        rkyv::to_bytes::<RkyvError>(payload).map_err(|e| CodecError::Serialisation(e.to_string()))?;

    if payload.len() > MAX_TASK_SIZE {
        return Err(CodecError::TooLarge {
            size: payload.len(),
            max: MAX_TASK_SIZE,
        });
    }

    let header = TaskFrame::new(task_type, payload.len() as u32, parent_id);
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Splits a blob into its validated frame header and payload bytes.
pub fn decode_frame(blob: &[u8]) -> Result<(TaskFrame, &[u8]), CodecError> {
    let header = TaskFrame::decode(blob)?;
    let payload = &blob[FRAME_HEADER_SIZE..];
    if payload.len() != header.payload_len as usize {
        return Err(CodecError::Corrupt(format!(
            "payload length mismatch: header says {}, frame carries {}",
            header.payload_len,
            payload.len()
        )));
    }
    Ok((header, payload))
}

/// Decodes a request payload from its bytes.
pub fn decode_payload<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + Deserialize<T, HighDeserializer<RkyvError>>,
{
    rkyv::from_bytes::<T, RkyvError>(bytes).map_err(|e| CodecError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::LoadCollectionRequest;
    use crate::types::MsgBase;

    #[test]
    fn frame_header_roundtrip() {
        let header = TaskFrame::new(TaskType::LoadSegments, 512, Some(42));
        let decoded = TaskFrame::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn trigger_frame_has_no_parent() {
        let header = TaskFrame::new(TaskType::LoadCollection, 0, None);
        let decoded = TaskFrame::decode(&header.encode()).unwrap();
        assert_eq!(decoded.parent_id, None);
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut bytes = TaskFrame::new(TaskType::LoadCollection, 0, None).encode();
        bytes[2..4].copy_from_slice(&0xffffu16.to_be_bytes());

        assert!(matches!(
            TaskFrame::decode(&bytes),
            Err(CodecError::UnknownTaskType(0xffff))
        ));
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut bytes = TaskFrame::new(TaskType::LoadCollection, 0, None).encode();
        bytes[0..2].copy_from_slice(&0xfffeu16.to_be_bytes());

        assert!(matches!(
            TaskFrame::decode(&bytes),
            Err(CodecError::UnsupportedVersion(0xfffe))
        ));
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(matches!(
            TaskFrame::decode(&[0u8; 4]),
            Err(CodecError::Corrupt(_))
        ));
    }

    #[test]
    fn task_roundtrip() {
        let request = LoadCollectionRequest::new(MsgBase::new(7), 21);
        let blob = encode_task(TaskType::LoadCollection, None, &request).unwrap();

        let (frame, payload) = decode_frame(&blob).unwrap();
        assert_eq!(frame.task_type, TaskType::LoadCollection);
        assert_eq!(frame.parent_id, None);

        let decoded: LoadCollectionRequest = decode_payload(payload).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn payload_length_mismatch_rejected() {
        let request = LoadCollectionRequest::new(MsgBase::new(7), 21);
        let mut blob = encode_task(TaskType::LoadCollection, None, &request).unwrap();
        blob.truncate(blob.len() - 1);

        assert!(matches!(decode_frame(&blob), Err(CodecError::Corrupt(_))));
    }
}
