//! FIFO queue of trigger tasks.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};
use crate::task::Task;

/// Bounded FIFO of trigger tasks.
///
/// Many producers, one consumer. Tasks leave strictly in enqueue order.
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Arc<dyn Task>>>,
    capacity: usize,
    notify: Notify,
    cancel: CancellationToken,
}

impl TaskQueue {
    /// Creates a queue with the given capacity, tied to a cancellation scope.
    #[must_use]
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            cancel,
        }
    }

    /// Appends a task. Never blocks.
    ///
    /// Returns [`CoordError::QueueFull`] when the queue is at capacity.
    pub fn push(&self, task: Arc<dyn Task>) -> Result<()> {
        {
            let mut tasks = self.tasks.lock();
            if tasks.len() >= self.capacity {
                return Err(CoordError::QueueFull);
            }
            tasks.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Removes and returns the oldest task, waiting for one if necessary.
    ///
    /// Returns [`CoordError::Cancelled`] when the owning scope closes.
    pub async fn pop(&self) -> Result<Arc<dyn Task>> {
        loop {
            {
                let mut tasks = self.tasks.lock();
                if let Some(task) = tasks.pop_front() {
                    return Ok(task);
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return Err(CoordError::Cancelled),
                () = self.notify.notified() => {}
            }
        }
    }

    /// Returns the current contents in order, without removing them.
    ///
    /// Used by the recovery loader and administrative inspection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Task>> {
        self.tasks.lock().iter().cloned().collect()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
