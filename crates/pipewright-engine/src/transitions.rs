//! Transition discipline - the single path every status change takes.
//!
//! A transition is one atomic compare-and-swap against the stored status. A
//! lost race is a harmless no-op retried up to a small budget; after that it
//! is reported as "failed to update node execution" for operator visibility.

use std::sync::Arc;

use pipewright_core::node::{NodeExecution, NodeExecutionId, NodeStatus};
use pipewright_core::store::{NodeExecutionStore, StoreError};
use pipewright_stores::{EngineEvent, EventBus};

use crate::error::EngineError;

/// Result of a transition request.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The CAS won; the node moved.
    Applied { node: NodeExecution, from: NodeStatus },
    /// The node was already terminal; nothing to do.
    AlreadyTerminal(NodeStatus),
    /// The request does not apply to the node's current status.
    NotApplicable(NodeStatus),
}

/// Applies status transitions through the store's conditional-update
/// primitive and announces every applied transition on the event bus.
#[derive(Clone)]
pub struct Transitioner {
    nodes: Arc<dyn NodeExecutionStore>,
    events: Arc<dyn EventBus>,
    retry_budget: u32,
}

impl Transitioner {
    pub fn new(
        nodes: Arc<dyn NodeExecutionStore>,
        events: Arc<dyn EventBus>,
        retry_budget: u32,
    ) -> Self {
        Self {
            nodes,
            events,
            retry_budget,
        }
    }

    pub fn store(&self) -> Arc<dyn NodeExecutionStore> {
        self.nodes.clone()
    }

    /// Move a node to `target`, re-reading the current status on each lost
    /// race. `applicable` filters which source statuses the caller accepts;
    /// statuses outside the filter report [TransitionOutcome::NotApplicable]
    /// without touching the node.
    pub async fn transition<F>(
        &self,
        id: &NodeExecutionId,
        target: NodeStatus,
        applicable: F,
    ) -> Result<TransitionOutcome, EngineError>
    where
        F: Fn(NodeStatus) -> bool,
    {
        let mut attempts = 0;
        loop {
            let node = self
                .nodes
                .get(id)
                .await?
                .ok_or_else(|| EngineError::NodeNotFound(id.clone()))?;
            let current = node.status;

            if current == target {
                return Ok(TransitionOutcome::NotApplicable(current));
            }
            if current.is_terminal() {
                return Ok(TransitionOutcome::AlreadyTerminal(current));
            }
            if !applicable(current) || !NodeStatus::can_transition(current, target) {
                return Ok(TransitionOutcome::NotApplicable(current));
            }

            match self.nodes.update_status(id, current, target).await {
                Ok(updated) => {
                    self.announce(&updated, current, target).await;
                    return Ok(TransitionOutcome::Applied {
                        node: updated,
                        from: current,
                    });
                }
                Err(StoreError::CasConflict { actual, .. }) => {
                    attempts += 1;
                    if attempts > self.retry_budget {
                        tracing::error!(
                            node_execution_id = %id,
                            %target,
                            %actual,
                            attempts,
                            "failed to update node execution"
                        );
                        return Err(EngineError::UpdateFailed {
                            node_execution_id: id.clone(),
                            target,
                            attempts,
                        });
                    }
                    tracing::debug!(
                        node_execution_id = %id,
                        %target,
                        %actual,
                        attempt = attempts,
                        "lost status race; retrying"
                    );
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Transitions a node out of Failed/Expired on an adviser's decision.
    /// Same CAS path, but accepts the adviser-edge source statuses the
    /// normal terminal check would refuse.
    pub async fn adviser_transition(
        &self,
        id: &NodeExecutionId,
        from: NodeStatus,
        target: NodeStatus,
    ) -> Result<TransitionOutcome, EngineError> {
        match self.nodes.update_status(id, from, target).await {
            Ok(updated) => {
                self.announce(&updated, from, target).await;
                Ok(TransitionOutcome::Applied {
                    node: updated,
                    from,
                })
            }
            Err(StoreError::CasConflict { actual, .. }) => {
                Ok(TransitionOutcome::NotApplicable(actual))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Fire-and-forget announcement; delivery failure is logged, never
    /// blocks the transition.
    async fn announce(&self, node: &NodeExecution, from: NodeStatus, to: NodeStatus) {
        tracing::info!(
            node_execution_id = %node.id,
            setup_id = %node.setup_id(),
            %from,
            %to,
            "node transitioned"
        );
        if let Err(err) = self
            .events
            .publish(EngineEvent::status_changed(
                node.ambiance.clone(),
                node.id.clone(),
                from,
                to,
            ))
            .await
        {
            tracing::warn!(error = %err, "event delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::ambiance::{Ambiance, Level, NodeGroup};
    use pipewright_stores::{BroadcastEventBus, InMemoryNodeExecutionStore};
    use serde_json::Value;

    fn transitioner() -> (Transitioner, Arc<dyn NodeExecutionStore>) {
        let nodes: Arc<dyn NodeExecutionStore> = Arc::new(InMemoryNodeExecutionStore::new());
        let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        (Transitioner::new(nodes.clone(), events, 3), nodes)
    }

    fn node() -> NodeExecution {
        NodeExecution::new(
            Ambiance::new("exec-1", "plan-1").extend(Level::new("step-1", NodeGroup::Step)),
            Value::Null,
        )
    }

    #[test]
    fn test_applied_transition_reports_prior_status() {
        tokio_test::block_on(async {
            let (transitioner, nodes) = transitioner();
            let node = node();
            nodes.save(&node).await.unwrap();

            let outcome = transitioner
                .transition(&node.id, NodeStatus::Running, |s| s == NodeStatus::Queued)
                .await
                .unwrap();
            match outcome {
                TransitionOutcome::Applied { from, node } => {
                    assert_eq!(from, NodeStatus::Queued);
                    assert_eq!(node.status, NodeStatus::Running);
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        });
    }

    #[test]
    fn test_terminal_node_is_reported_not_retried() {
        tokio_test::block_on(async {
            let (transitioner, nodes) = transitioner();
            let node = node();
            nodes.save(&node).await.unwrap();
            nodes
                .update_status(&node.id, NodeStatus::Queued, NodeStatus::Aborted)
                .await
                .unwrap();

            let outcome = transitioner
                .transition(&node.id, NodeStatus::Running, |_| true)
                .await
                .unwrap();
            assert!(matches!(
                outcome,
                TransitionOutcome::AlreadyTerminal(NodeStatus::Aborted)
            ));
        });
    }

    #[test]
    fn test_applicability_filter_blocks_without_touching_node() {
        tokio_test::block_on(async {
            let (transitioner, nodes) = transitioner();
            let node = node();
            nodes.save(&node).await.unwrap();

            let outcome = transitioner
                .transition(&node.id, NodeStatus::Running, |s| s == NodeStatus::Paused)
                .await
                .unwrap();
            assert!(matches!(outcome, TransitionOutcome::NotApplicable(NodeStatus::Queued)));

            let current = nodes.get(&node.id).await.unwrap().unwrap();
            assert_eq!(current.status, NodeStatus::Queued);
        });
    }

    #[test]
    fn test_transition_announces_on_bus() {
        tokio_test::block_on(async {
            let nodes: Arc<dyn NodeExecutionStore> = Arc::new(InMemoryNodeExecutionStore::new());
            let bus = Arc::new(BroadcastEventBus::new(8));
            let mut rx = bus.subscribe();
            let transitioner = Transitioner::new(nodes.clone(), bus, 3);

            let node = node();
            nodes.save(&node).await.unwrap();
            transitioner
                .transition(&node.id, NodeStatus::Running, |s| s == NodeStatus::Queued)
                .await
                .unwrap();

            match rx.recv().await.unwrap() {
                EngineEvent::NodeStatusChanged { from, to, .. } => {
                    assert_eq!((from, to), (NodeStatus::Queued, NodeStatus::Running));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        });
    }
}
