//! Task result routing - correlates remote task results back to the waiting
//! node execution by task id.

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};

use pipewright_core::dispatch::{TaskId, TaskResult};

/// One-shot mailbox per in-flight task. A node that dispatched a task parks
/// a receiver here; the ingress side delivers the result when the external
/// executor reports back.
#[derive(Default)]
pub struct TaskResultRouter {
    pending: Mutex<HashMap<TaskId, oneshot::Sender<TaskResult>>>,
}

impl TaskResultRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a mailbox for `task_id`. A second reservation for the same id
    /// replaces the first; the orphaned receiver resolves to an error.
    pub async fn expect(&self, task_id: impl Into<TaskId>) -> oneshot::Receiver<TaskResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(task_id.into(), tx);
        rx
    }

    /// Deliver a task result. Returns whether anything was waiting for it;
    /// a late or unknown result is dropped, not an error.
    pub async fn deliver(&self, result: TaskResult) -> bool {
        let sender = self.pending.lock().await.remove(&result.task_id);
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                tracing::warn!(task_id = %result.task_id, "no waiter for task result; dropped");
                false
            }
        }
    }

    /// Drop the mailbox for `task_id`, for when the waiter gives up first
    /// (abort, expiry).
    pub async fn forget(&self, task_id: &str) {
        self.pending.lock().await.remove(task_id);
    }

    /// How many tasks are currently awaited.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
