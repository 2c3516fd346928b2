//! Store contracts.
//!
//! The core reads and writes whole documents keyed by identifier and relies
//! on exactly one atomic primitive: the conditional status update
//! (match-on-expected-status, replace-with-new-status). Implementations live
//! in pipewright-stores.

use async_trait::async_trait;
use thiserror::Error;

use crate::interrupt::{Interrupt, InterruptId, InterruptState, InterruptTarget, InterruptType};
use crate::node::{FailureInfo, InterruptEffect, NodeExecution, NodeExecutionId, NodeStatus};
use crate::timeout::TimeoutInstance;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("status update lost the race: expected {expected}, found {actual}")]
    CasConflict {
        expected: NodeStatus,
        actual: NodeStatus,
    },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: NodeStatus, to: NodeStatus },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// NodeExecution persistence.
#[async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Upsert the whole document.
    async fn save(&self, node: &NodeExecution) -> Result<(), StoreError>;

    /// Load by id.
    async fn get(&self, id: &NodeExecutionId) -> Result<Option<NodeExecution>, StoreError>;

    /// Atomic conditional status update. Validates the transition table,
    /// then replaces the status only if it still matches `expected`.
    /// `CasConflict` means a concurrent update won; `IllegalTransition`
    /// means the request itself was never valid.
    async fn update_status(
        &self,
        id: &NodeExecutionId,
        expected: NodeStatus,
        next: NodeStatus,
    ) -> Result<NodeExecution, StoreError>;

    /// Append an interrupt audit entry. Allowed even on terminal documents.
    async fn append_interrupt_effect(
        &self,
        id: &NodeExecutionId,
        effect: InterruptEffect,
    ) -> Result<(), StoreError>;

    /// Set the failure detail. Field-scoped: status and interrupt audit are
    /// never touched, so a concurrent conditional update cannot be undone.
    async fn record_failure_info(
        &self,
        id: &NodeExecutionId,
        failure: FailureInfo,
    ) -> Result<(), StoreError>;

    /// Set the serialized adviser decision. Same field-scoped contract as
    /// [NodeExecutionStore::record_failure_info].
    async fn record_resolved_advice(
        &self,
        id: &NodeExecutionId,
        advice: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Register a timeout instance id against the document.
    async fn append_timeout_id(
        &self,
        id: &NodeExecutionId,
        timeout_id: String,
    ) -> Result<(), StoreError>;

    /// All live (non-terminal) executions of a plan execution.
    async fn live_for_plan(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<NodeExecution>, StoreError>;
}

/// Interrupt persistence.
#[async_trait]
pub trait InterruptStore: Send + Sync {
    async fn save(&self, interrupt: &Interrupt) -> Result<(), StoreError>;

    async fn get(&self, id: &InterruptId) -> Result<Option<Interrupt>, StoreError>;

    /// Move the interrupt's processing state.
    async fn update_state(
        &self,
        id: &InterruptId,
        state: InterruptState,
    ) -> Result<(), StoreError>;

    /// An equivalent interrupt (same target and type) still in flight, if
    /// any. Backs duplicate rejection.
    async fn find_in_flight(
        &self,
        target: &InterruptTarget,
        interrupt_type: &InterruptType,
    ) -> Result<Option<Interrupt>, StoreError>;
}

/// Active timeout-instance registry.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    async fn add(&self, instance: &TimeoutInstance) -> Result<(), StoreError>;

    /// Replace an instance (tracker pause/resume).
    async fn update(&self, instance: &TimeoutInstance) -> Result<(), StoreError>;

    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Delete every instance owned by a node. Returns how many went away.
    async fn remove_for_node(&self, node_execution_id: &str) -> Result<usize, StoreError>;

    /// Instances owned by a node.
    async fn for_node(&self, node_execution_id: &str) -> Result<Vec<TimeoutInstance>, StoreError>;

    /// Every active instance, for the monitor's scan.
    async fn active(&self) -> Result<Vec<TimeoutInstance>, StoreError>;
}
