//! Remote task dispatch seam.
//!
//! The core emits an opaque task descriptor and later receives a correlated
//! result; how the task is physically executed is someone else's problem.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Correlation identifier for a dispatched task.
pub type TaskId = String;

/// Opaque description of work handed to the remote execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Task type understood by the remote executor.
    pub task_type: String,
    /// Serialized task parameters.
    pub parameters: Value,
    /// Target selection criteria (worker pools, labels).
    #[serde(default)]
    pub selectors: Vec<String>,
}

impl TaskDescriptor {
    pub fn new(task_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            task_type: task_type.into(),
            parameters,
            selectors: Vec::new(),
        }
    }

    pub fn with_selectors(mut self, selectors: Vec<String>) -> Self {
        self.selectors = selectors;
        self
    }
}

/// Correlated result of a dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    /// Whether the remote execution succeeded.
    pub success: bool,
    /// Serialized output, or failure detail when `success` is false.
    pub data: Value,
}

impl TaskResult {
    pub fn succeeded(task_id: impl Into<TaskId>, data: Value) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            data,
        }
    }

    pub fn failed(task_id: impl Into<TaskId>, data: Value) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            data,
        }
    }
}

/// Errors from the dispatch collaborator.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no executor available for task type '{0}'")]
    NoExecutor(String),
    #[error("dispatch rejected: {0}")]
    Rejected(String),
    #[error("dispatch transport error: {0}")]
    Transport(String),
}

/// Remote task execution collaborator.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Hand a task to the remote executor; returns the correlation id.
    async fn dispatch(&self, descriptor: TaskDescriptor) -> Result<TaskId, DispatchError>;

    /// Ask the remote executor to cancel. Cooperative: the executor may or
    /// may not honor it; the engine stops waiting regardless.
    async fn cancel(&self, task_id: &TaskId) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_round_trip() {
        let descriptor = TaskDescriptor::new("shell", json!({"cmd": "make"}))
            .with_selectors(vec!["linux".into()]);
        let raw = serde_json::to_string(&descriptor).unwrap();
        let back: TaskDescriptor = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, descriptor);
    }
}
