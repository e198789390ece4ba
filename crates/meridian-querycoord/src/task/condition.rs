//! Completion signalling between a task and its awaiter.

use meridian_proto::NodeId;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};

/// Outcome recorded when a task settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task reached `Done`.
    Success,
    /// The task reached `Failed` with the given reason.
    Failed(String),
    /// The assigned worker vanished; the work must be re-issued.
    WorkerLost(NodeId),
}

/// Latch a parent blocks on until the task settles.
///
/// One awaiter, one signaller. The first recorded outcome wins; later calls
/// to [`notify`](Self::notify) are ignored. Cancelling the owning scope
/// unblocks the awaiter with [`CoordError::Cancelled`].
#[derive(Debug)]
pub struct TaskCondition {
    tx: watch::Sender<Option<TaskOutcome>>,
    cancel: CancellationToken,
}

impl TaskCondition {
    /// Creates a condition tied to the given cancellation scope.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx, cancel }
    }

    /// Records the outcome and wakes the awaiter.
    pub fn notify(&self, outcome: TaskOutcome) {
        self.tx.send_modify(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
            }
        });
    }

    /// Blocks until the task settles or the scope is cancelled.
    pub async fn wait(&self) -> Result<TaskOutcome> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return Ok(outcome);
            }
            tokio::select! {
                () = self.cancel.cancelled() => return Err(CoordError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(CoordError::Cancelled);
                    }
                }
            }
        }
    }

    /// Returns the outcome if the task has already settled.
    #[must_use]
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_then_wait() {
        let condition = TaskCondition::new(CancellationToken::new());
        condition.notify(TaskOutcome::Success);

        assert_eq!(condition.wait().await.unwrap(), TaskOutcome::Success);
    }

    #[tokio::test]
    async fn wait_then_notify() {
        let condition = Arc::new(TaskCondition::new(CancellationToken::new()));
        let waiter = {
            let condition = Arc::clone(&condition);
            tokio::spawn(async move { condition.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        condition.notify(TaskOutcome::Failed("boom".to_owned()));

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Failed("boom".to_owned()));
    }

    #[tokio::test]
    async fn first_outcome_wins() {
        let condition = TaskCondition::new(CancellationToken::new());
        condition.notify(TaskOutcome::WorkerLost(3));
        condition.notify(TaskOutcome::Success);

        assert_eq!(condition.outcome(), Some(TaskOutcome::WorkerLost(3)));
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiter() {
        let cancel = CancellationToken::new();
        let condition = Arc::new(TaskCondition::new(cancel.clone()));
        let waiter = {
            let condition = Arc::clone(&condition);
            tokio::spawn(async move { condition.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(CoordError::Cancelled)
        ));
    }
}
