//! Task-chain protocol - a step driving several remote task dispatches
//! within a single node.
//!
//! A non-final chain response must carry a task descriptor, enforced at
//! construction, so the engine can never end up waiting on nothing.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::ambiance::Ambiance;
use crate::dispatch::{TaskDescriptor, TaskResult};
use crate::step::StepOutcome;

/// Opaque state carried between successive chain invocations.
pub type PassThroughData = Value;

/// Errors in the chain protocol itself.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("non-final chain response must carry a task descriptor")]
    MissingTask,
    #[error("chain step failed: {0}")]
    Step(String),
}

/// One link's outcome: either a next task to dispatch, or the end of the
/// chain.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskChainResponse {
    chain_end: bool,
    task: Option<TaskDescriptor>,
    pass_through: PassThroughData,
}

impl TaskChainResponse {
    /// A non-final link: the engine dispatches `task` and waits.
    pub fn next(task: TaskDescriptor, pass_through: PassThroughData) -> Self {
        Self {
            chain_end: false,
            task: Some(task),
            pass_through,
        }
    }

    /// The final link: nothing left to dispatch.
    pub fn end(pass_through: PassThroughData) -> Self {
        Self {
            chain_end: true,
            task: None,
            pass_through,
        }
    }

    /// Construct from raw parts, enforcing the non-final-needs-task
    /// invariant. Fails fast instead of letting the engine wait on nothing.
    pub fn from_parts(
        chain_end: bool,
        task: Option<TaskDescriptor>,
        pass_through: PassThroughData,
    ) -> Result<Self, ChainError> {
        if !chain_end && task.is_none() {
            return Err(ChainError::MissingTask);
        }
        Ok(Self {
            chain_end,
            task,
            pass_through,
        })
    }

    pub fn is_chain_end(&self) -> bool {
        self.chain_end
    }

    pub fn task(&self) -> Option<&TaskDescriptor> {
        self.task.as_ref()
    }

    pub fn pass_through(&self) -> &PassThroughData {
        &self.pass_through
    }

    /// Consume into (chain_end, task, pass_through).
    pub fn into_parts(self) -> (bool, Option<TaskDescriptor>, PassThroughData) {
        (self.chain_end, self.task, self.pass_through)
    }
}

/// Contract for steps that issue a sequence of remote task dispatches
/// without the node completing between them.
#[async_trait]
pub trait TaskChainExecutable: Send + Sync {
    /// Open the chain: produce the first link.
    async fn start_chain_link(
        &self,
        ambiance: &Ambiance,
        step_parameters: &Value,
    ) -> Result<TaskChainResponse, ChainError>;

    /// A dispatched task's result arrived; produce the next link.
    async fn execute_next_link(
        &self,
        ambiance: &Ambiance,
        step_parameters: &Value,
        pass_through: PassThroughData,
        task_result: TaskResult,
    ) -> Result<TaskChainResponse, ChainError>;

    /// The chain has ended; produce the step's final outcome.
    async fn finalize_execution(
        &self,
        ambiance: &Ambiance,
        step_parameters: &Value,
        pass_through: PassThroughData,
        last_result: Option<TaskResult>,
    ) -> Result<StepOutcome, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_final_without_task_fails_construction() {
        let err = TaskChainResponse::from_parts(false, None, Value::Null).unwrap_err();
        assert!(matches!(err, ChainError::MissingTask));
    }

    #[test]
    fn test_final_without_task_is_fine() {
        let response = TaskChainResponse::from_parts(true, None, json!({"links": 3})).unwrap();
        assert!(response.is_chain_end());
        assert!(response.task().is_none());
        assert_eq!(response.pass_through(), &json!({"links": 3}));
    }

    #[test]
    fn test_next_always_carries_task() {
        let descriptor = TaskDescriptor::new("shell", json!({"cmd": "true"}));
        let response = TaskChainResponse::next(descriptor.clone(), Value::Null);
        assert!(!response.is_chain_end());
        assert_eq!(response.task(), Some(&descriptor));
    }
}
