//! Core identifier and status types.

use rkyv::{Archive, Deserialize, Serialize};

/// Unique collection identifier.
pub type CollectionId = i64;

/// Unique partition identifier.
pub type PartitionId = i64;

/// Unique sealed-segment identifier.
pub type SegmentId = i64;

/// Worker node identifier, assigned by the session registry.
pub type NodeId = i64;

/// Task identifier assigned by the coordinator, unique process-wide.
pub type TaskId = i64;

/// Logical timestamp assigned by the submitter.
pub type Timestamp = u64;

/// Base fields carried by every coordinator request.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgBase {
    /// Logical timestamp assigned by the submitter; recovery sort key.
    pub timestamp: Timestamp,
}

impl MsgBase {
    /// Creates a base with the given timestamp.
    #[must_use]
    pub const fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }
}

/// Status codes returned by worker RPCs.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The operation completed.
    Success,
    /// The operation failed; the reason string carries detail.
    UnexpectedError,
    /// The worker is up but not yet serving.
    NotReady,
}

/// Status record returned by every worker RPC.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Outcome code.
    pub error_code: ErrorCode,
    /// Failure detail, empty on success.
    pub reason: String,
}

impl Status {
    /// Creates a success status.
    #[must_use]
    pub fn success() -> Self {
        Self {
            error_code: ErrorCode::Success,
            reason: String::new(),
        }
    }

    /// Creates an error status with the given reason.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error_code: ErrorCode::UnexpectedError,
            reason: reason.into(),
        }
    }

    /// Returns true if the status reports success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error_code == ErrorCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_constructors() {
        assert!(Status::success().is_success());

        let failed = Status::error("node not serving");
        assert!(!failed.is_success());
        assert_eq!(failed.reason, "node not serving");
    }
}
