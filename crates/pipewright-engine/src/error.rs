//! Engine error types.

use thiserror::Error;

use pipewright_core::chain::ChainError;
use pipewright_core::dispatch::DispatchError;
use pipewright_core::facilitator::ExecutionMode;
use pipewright_core::node::NodeStatus;
use pipewright_core::plan::PlanError;
use pipewright_core::store::StoreError;

/// Errors raised by the orchestration engine. Failures are scoped to the
/// node or interrupt in question; one malformed input never aborts unrelated
/// nodes.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("failed to update node execution '{node_execution_id}' to {target} after {attempts} attempts")]
    UpdateFailed {
        node_execution_id: String,
        target: NodeStatus,
        attempts: u32,
    },

    #[error("node execution '{0}' not found")]
    NodeNotFound(String),

    #[error("plan node '{0}' not found in plan")]
    PlanNodeNotFound(String),

    #[error("engine not configured: {0}")]
    NotConfigured(&'static str),

    #[error("no step handler registered for step type '{step_type}' in mode {mode:?}")]
    MissingHandler {
        step_type: String,
        mode: ExecutionMode,
    },

    #[error("interrupt error: {0}")]
    Interrupt(#[from] crate::interrupts::InterruptError),
}
