//! Step execution contracts and the step registry.
//!
//! Steps are black boxes to the engine. A step type registers exactly one
//! handler matching the execution mode its facilitator selects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::ambiance::Ambiance;
use crate::chain::TaskChainExecutable;
use crate::dispatch::{TaskDescriptor, TaskResult};
use crate::node::FailureInfo;

/// The outcome a step hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success { output: Value },
    Failure { failure: FailureInfo },
}

impl StepOutcome {
    pub fn success(output: Value) -> Self {
        Self::Success { output }
    }

    pub fn failure(failure: FailureInfo) -> Self {
        Self::Failure { failure }
    }

    pub fn failure_info(&self) -> Option<&FailureInfo> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { failure } => Some(failure),
        }
    }
}

/// A step that runs to completion in-process (Sync and Async modes).
#[async_trait]
pub trait SyncExecutable: Send + Sync {
    async fn execute(&self, ambiance: &Ambiance, step_parameters: &Value) -> StepOutcome;
}

/// A step that dispatches exactly one remote task and interprets its result
/// (Task mode).
#[async_trait]
pub trait TaskExecutable: Send + Sync {
    /// Produce the task to dispatch.
    async fn obtain_task(
        &self,
        ambiance: &Ambiance,
        step_parameters: &Value,
    ) -> Result<TaskDescriptor, FailureInfo>;

    /// Interpret the correlated result into a step outcome.
    async fn handle_task_result(
        &self,
        ambiance: &Ambiance,
        step_parameters: &Value,
        result: TaskResult,
    ) -> StepOutcome;
}

/// The handler registered for a step type.
#[derive(Clone)]
pub enum StepHandler {
    Unit(Arc<dyn SyncExecutable>),
    Task(Arc<dyn TaskExecutable>),
    Chain(Arc<dyn TaskChainExecutable>),
}

/// Registry mapping step types to handlers. Built once at process start.
#[derive(Default)]
pub struct StepRegistry {
    handlers: HashMap<String, StepHandler>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_unit(
        &mut self,
        step_type: impl Into<String>,
        step: Arc<dyn SyncExecutable>,
    ) {
        self.handlers.insert(step_type.into(), StepHandler::Unit(step));
    }

    pub fn register_task(
        &mut self,
        step_type: impl Into<String>,
        step: Arc<dyn TaskExecutable>,
    ) {
        self.handlers.insert(step_type.into(), StepHandler::Task(step));
    }

    pub fn register_chain(
        &mut self,
        step_type: impl Into<String>,
        step: Arc<dyn TaskChainExecutable>,
    ) {
        self.handlers.insert(step_type.into(), StepHandler::Chain(step));
    }

    pub fn get(&self, step_type: &str) -> Option<StepHandler> {
        self.handlers.get(step_type).cloned()
    }

    pub fn knows(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoStep;

    #[async_trait]
    impl SyncExecutable for EchoStep {
        async fn execute(&self, _ambiance: &Ambiance, step_parameters: &Value) -> StepOutcome {
            StepOutcome::success(step_parameters.clone())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = StepRegistry::new();
        registry.register_unit("echo", Arc::new(EchoStep));

        assert!(registry.knows("echo"));
        assert!(matches!(registry.get("echo"), Some(StepHandler::Unit(_))));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_echo_step_outcome() {
        tokio_test::block_on(async {
            let step = EchoStep;
            let ambiance = Ambiance::new("exec-1", "plan-1");
            let outcome = step.execute(&ambiance, &json!({"msg": "hi"})).await;
            assert_eq!(outcome, StepOutcome::success(json!({"msg": "hi"})));
        });
    }
}
