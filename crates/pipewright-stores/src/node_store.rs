//! In-memory NodeExecutionStore.
//!
//! The conditional status update holds the write lock across the
//! compare-and-swap, which is exactly the atomicity the core requires.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use pipewright_core::node::{FailureInfo, InterruptEffect, NodeExecution, NodeExecutionId, NodeStatus};
use pipewright_core::store::{NodeExecutionStore, StoreError};

/// In-memory NodeExecution store.
#[derive(Default)]
pub struct InMemoryNodeExecutionStore {
    nodes: RwLock<HashMap<NodeExecutionId, NodeExecution>>,
}

impl InMemoryNodeExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeExecutionStore for InMemoryNodeExecutionStore {
    async fn save(&self, node: &NodeExecution) -> Result<(), StoreError> {
        self.nodes
            .write()
            .await
            .insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get(&self, id: &NodeExecutionId) -> Result<Option<NodeExecution>, StoreError> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &NodeExecutionId,
        expected: NodeStatus,
        next: NodeStatus,
    ) -> Result<NodeExecution, StoreError> {
        if !NodeStatus::can_transition(expected, next) {
            return Err(StoreError::IllegalTransition {
                from: expected,
                to: next,
            });
        }
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if node.status != expected {
            return Err(StoreError::CasConflict {
                expected,
                actual: node.status,
            });
        }
        node.status = next;
        if next.is_terminal() {
            node.ended_at = Some(Utc::now());
        }
        Ok(node.clone())
    }

    async fn append_interrupt_effect(
        &self,
        id: &NodeExecutionId,
        effect: InterruptEffect,
    ) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        node.interrupt_effects.push(effect);
        Ok(())
    }

    async fn record_failure_info(
        &self,
        id: &NodeExecutionId,
        failure: FailureInfo,
    ) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        node.failure_info = Some(failure);
        Ok(())
    }

    async fn record_resolved_advice(
        &self,
        id: &NodeExecutionId,
        advice: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        node.resolved_advice = Some(advice);
        Ok(())
    }

    async fn append_timeout_id(
        &self,
        id: &NodeExecutionId,
        timeout_id: String,
    ) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        node.timeout_ids.push(timeout_id);
        Ok(())
    }

    async fn live_for_plan(
        &self,
        plan_execution_id: &str,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        Ok(self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| {
                n.ambiance.plan_execution_id == plan_execution_id && !n.status.is_terminal()
            })
            .cloned()
            .collect())
    }
}
