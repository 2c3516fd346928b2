//! Interrupt subsystem - the only mutation entry point exposed outside the
//! engine.
//!
//! Registration rejects duplicates (at most one in-flight interrupt of a
//! given type per target). Processing appends an audit effect, requests the
//! state transition through the compare-and-swap entry point, and always
//! leaves the interrupt record in a terminal processing state.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use pipewright_core::interrupt::{
    Interrupt, InterruptConfig, InterruptState, InterruptTarget, InterruptType,
};
use pipewright_core::node::{InterruptEffect, NodeExecution, NodeExecutionId, NodeStatus};
use pipewright_core::store::{InterruptStore, StoreError, TimeoutStore};
use pipewright_stores::{EngineEvent, EventBus};

use crate::error::EngineError;
use crate::timeouts;
use crate::transitions::{TransitionOutcome, Transitioner};

/// Interrupt subsystem errors.
#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("an equivalent {interrupt_type:?} interrupt is already in flight for this target")]
    Duplicate { interrupt_type: InterruptType },

    #[error("interrupt '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("interrupt processing failed: {0}")]
    Processing(String),
}

/// What processing an interrupt did.
#[derive(Debug)]
pub enum InterruptOutcome {
    /// The target(s) transitioned.
    Applied {
        /// Nodes that actually moved.
        transitioned: Vec<NodeExecution>,
        /// Retry instances created, for Retry interrupts.
        retries: Vec<NodeExecution>,
    },
    /// Every target was already terminal; reported, not an error.
    AlreadyTerminal,
    /// The interrupt had already been processed; nothing happened.
    AlreadyProcessed,
}

/// Applies external control requests safely against concurrently running
/// node executions.
pub struct InterruptService {
    interrupts: Arc<dyn InterruptStore>,
    timeouts: Arc<dyn TimeoutStore>,
    transitioner: Transitioner,
    events: Arc<dyn EventBus>,
    cleanup_retries: u32,
    cleanup_backoff: std::time::Duration,
}

impl InterruptService {
    pub fn new(
        interrupts: Arc<dyn InterruptStore>,
        timeouts: Arc<dyn TimeoutStore>,
        transitioner: Transitioner,
        events: Arc<dyn EventBus>,
        cleanup_retries: u32,
        cleanup_backoff: std::time::Duration,
    ) -> Self {
        Self {
            interrupts,
            timeouts,
            transitioner,
            events,
            cleanup_retries,
            cleanup_backoff,
        }
    }

    /// Register a new interrupt. Fails when an equivalent interrupt (same
    /// target and type) is already registered or processing.
    pub async fn register(
        &self,
        interrupt_type: InterruptType,
        target: InterruptTarget,
        config: InterruptConfig,
    ) -> Result<Interrupt, InterruptError> {
        if let Some(existing) = self
            .interrupts
            .find_in_flight(&target, &interrupt_type)
            .await?
        {
            tracing::debug!(
                interrupt_id = %existing.id,
                interrupt_type = ?interrupt_type,
                "duplicate interrupt rejected"
            );
            return Err(InterruptError::Duplicate { interrupt_type });
        }
        let interrupt = Interrupt::new(interrupt_type, target, config);
        self.interrupts.save(&interrupt).await?;
        Ok(interrupt)
    }

    /// Register and immediately process.
    pub async fn register_and_process(
        &self,
        interrupt_type: InterruptType,
        target: InterruptTarget,
        config: InterruptConfig,
    ) -> Result<(Interrupt, InterruptOutcome), InterruptError> {
        let interrupt = self.register(interrupt_type, target, config).await?;
        let outcome = self.process(&interrupt).await?;
        Ok((interrupt, outcome))
    }

    /// Process a registered interrupt. Idempotent: an already-processed
    /// interrupt is a no-op. The record always ends processed, one way or
    /// the other.
    pub async fn process(&self, interrupt: &Interrupt) -> Result<InterruptOutcome, InterruptError> {
        let stored = self
            .interrupts
            .get(&interrupt.id)
            .await?
            .ok_or_else(|| InterruptError::NotFound(interrupt.id.clone()))?;
        if stored.state.is_processed() {
            tracing::debug!(interrupt_id = %interrupt.id, "interrupt already processed; no-op");
            return Ok(InterruptOutcome::AlreadyProcessed);
        }

        self.interrupts
            .update_state(&interrupt.id, InterruptState::Processing)
            .await?;

        match self.apply(&stored).await {
            Ok(outcome) => {
                self.conclude(&stored, true).await;
                Ok(outcome)
            }
            Err(err) => {
                self.conclude(&stored, false).await;
                Err(err)
            }
        }
    }

    async fn conclude(&self, interrupt: &Interrupt, success: bool) {
        let state = if success {
            InterruptState::ProcessedSuccessfully
        } else {
            InterruptState::ProcessedUnsuccessfully
        };
        if let Err(err) = self.interrupts.update_state(&interrupt.id, state).await {
            tracing::error!(
                interrupt_id = %interrupt.id,
                error = %err,
                "failed to finalize interrupt state"
            );
        }
        if let Err(err) = self
            .events
            .publish(EngineEvent::InterruptProcessed {
                interrupt_id: interrupt.id.clone(),
                interrupt_type: interrupt.interrupt_type.clone(),
                success,
                at: Utc::now(),
            })
            .await
        {
            tracing::warn!(error = %err, "interrupt event delivery failed");
        }
    }

    async fn apply(&self, interrupt: &Interrupt) -> Result<InterruptOutcome, InterruptError> {
        let node_ids = self.resolve_targets(&interrupt.target).await?;
        if node_ids.is_empty() {
            tracing::info!(interrupt_id = %interrupt.id, "no live targets; already terminal");
            return Ok(InterruptOutcome::AlreadyTerminal);
        }

        let mut transitioned = Vec::new();
        let mut retries = Vec::new();
        let mut any_live = false;

        for node_id in node_ids {
            match self.apply_to_node(interrupt, &node_id).await? {
                NodeApplication::Moved { node, retry } => {
                    any_live = true;
                    transitioned.push(node);
                    retries.extend(retry);
                }
                NodeApplication::AlreadyTerminal => {
                    tracing::info!(
                        interrupt_id = %interrupt.id,
                        node_execution_id = %node_id,
                        "target already terminal; no-op"
                    );
                }
                NodeApplication::NotApplicable(status) => {
                    any_live = true;
                    tracing::info!(
                        interrupt_id = %interrupt.id,
                        node_execution_id = %node_id,
                        %status,
                        "interrupt not applicable to current status"
                    );
                }
            }
        }

        if transitioned.is_empty() && !any_live {
            return Ok(InterruptOutcome::AlreadyTerminal);
        }
        Ok(InterruptOutcome::Applied {
            transitioned,
            retries,
        })
    }

    async fn apply_to_node(
        &self,
        interrupt: &Interrupt,
        node_id: &NodeExecutionId,
    ) -> Result<NodeApplication, InterruptError> {
        let nodes = self.transitioner.store();
        let node = nodes
            .get(node_id)
            .await?
            .ok_or_else(|| InterruptError::NotFound(node_id.clone()))?;

        // Audit first, even when the transition turns out to be a no-op.
        nodes
            .append_interrupt_effect(
                node_id,
                InterruptEffect {
                    interrupt_id: interrupt.id.clone(),
                    interrupt_type: interrupt.interrupt_type.clone(),
                    config: interrupt.config.clone(),
                    applied_at: Utc::now(),
                },
            )
            .await?;

        let current = node.status;
        let interrupt_type = &interrupt.interrupt_type;

        // Custom interrupts carry no fixed transition; the audit entry is
        // the whole effect.
        let Some(target_status) = interrupt_type.target_status(current) else {
            return Ok(NodeApplication::Moved {
                node,
                retry: None,
            });
        };

        if current.is_terminal() && !matches!(interrupt_type, InterruptType::Retry) {
            return Ok(NodeApplication::AlreadyTerminal);
        }
        if !interrupt_type.allowed_from(current) {
            return Ok(NodeApplication::NotApplicable(current));
        }
        // A retry successor is only created when a driver is parked on the
        // node (intervention wait) and will adopt it; against a concluded
        // instance nothing would ever drive the new document.
        if matches!(interrupt_type, InterruptType::Retry)
            && current != NodeStatus::InterventionWaiting
        {
            tracing::info!(
                interrupt_id = %interrupt.id,
                node_execution_id = %node_id,
                %current,
                "no driver waiting on this node; retry not applied"
            );
            return Ok(NodeApplication::NotApplicable(current));
        }

        let outcome = if matches!(interrupt_type, InterruptType::Retry) {
            // Single CAS against the observed source; a lost race means the
            // waiting driver (or another interrupt) moved the node first.
            self.transitioner
                .adviser_transition(node_id, current, target_status)
                .await
        } else {
            let allowed = |status: NodeStatus| interrupt_type.allowed_from(status);
            self.transitioner
                .transition(node_id, target_status, allowed)
                .await
        }
        .map_err(|err| InterruptError::Processing(err.to_string()))?;

        match outcome {
            TransitionOutcome::Applied { node, .. } => {
                self.side_effects(interrupt_type, &node).await;
                let retry = if matches!(interrupt_type, InterruptType::Retry) {
                    let next = node.instantiate_retry();
                    nodes.save(&next).await?;
                    Some(next)
                } else {
                    None
                };
                Ok(NodeApplication::Moved { node, retry })
            }
            TransitionOutcome::AlreadyTerminal(_) => Ok(NodeApplication::AlreadyTerminal),
            TransitionOutcome::NotApplicable(status) => {
                Ok(NodeApplication::NotApplicable(status))
            }
        }
    }

    /// Tracker bookkeeping that follows an applied transition.
    async fn side_effects(&self, interrupt_type: &InterruptType, node: &NodeExecution) {
        match interrupt_type {
            InterruptType::Abort | InterruptType::MarkExpired => {
                timeouts::cleanup_for_node(
                    self.timeouts.as_ref(),
                    &node.id,
                    self.cleanup_retries,
                    self.cleanup_backoff,
                )
                .await;
            }
            InterruptType::Pause => {
                self.shift_trackers(&node.id, true).await;
            }
            InterruptType::Resume => {
                self.shift_trackers(&node.id, false).await;
            }
            _ => {}
        }
    }

    async fn shift_trackers(&self, node_id: &str, pause: bool) {
        let instances = match self.timeouts.for_node(node_id).await {
            Ok(instances) => instances,
            Err(err) => {
                tracing::warn!(node_execution_id = %node_id, error = %err, "tracker lookup failed");
                return;
            }
        };
        let now = Utc::now();
        for mut instance in instances {
            let changed = if pause {
                instance.tracker.pause(now)
            } else {
                instance.tracker.resume(now)
            };
            if changed {
                if let Err(err) = self.timeouts.update(&instance).await {
                    tracing::warn!(
                        timeout_id = %instance.id,
                        error = %err,
                        "tracker update failed"
                    );
                }
            }
        }
    }

    async fn resolve_targets(
        &self,
        target: &InterruptTarget,
    ) -> Result<Vec<NodeExecutionId>, InterruptError> {
        match target {
            InterruptTarget::Node { node_execution_id } => Ok(vec![node_execution_id.clone()]),
            InterruptTarget::Plan { plan_execution_id } => Ok(self
                .transitioner
                .store()
                .live_for_plan(plan_execution_id)
                .await?
                .into_iter()
                .map(|n| n.id)
                .collect()),
        }
    }
}

enum NodeApplication {
    Moved {
        node: NodeExecution,
        retry: Option<NodeExecution>,
    },
    AlreadyTerminal,
    NotApplicable(NodeStatus),
}

impl From<EngineError> for InterruptError {
    fn from(err: EngineError) -> Self {
        InterruptError::Processing(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::ambiance::{Ambiance, Level, NodeGroup};
    use pipewright_core::store::NodeExecutionStore;
    use pipewright_stores::{
        BroadcastEventBus, InMemoryInterruptStore, InMemoryNodeExecutionStore,
        InMemoryTimeoutStore,
    };
    use serde_json::Value;
    use std::time::Duration;

    struct Fixture {
        service: InterruptService,
        nodes: Arc<dyn NodeExecutionStore>,
        interrupts: Arc<dyn InterruptStore>,
    }

    fn fixture() -> Fixture {
        let nodes: Arc<dyn NodeExecutionStore> = Arc::new(InMemoryNodeExecutionStore::new());
        let interrupts: Arc<dyn InterruptStore> = Arc::new(InMemoryInterruptStore::new());
        let timeouts: Arc<dyn TimeoutStore> = Arc::new(InMemoryTimeoutStore::new());
        let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let transitioner = Transitioner::new(nodes.clone(), events.clone(), 3);
        let service = InterruptService::new(
            interrupts.clone(),
            timeouts,
            transitioner,
            events,
            2,
            Duration::from_millis(1),
        );
        Fixture {
            service,
            nodes,
            interrupts,
        }
    }

    async fn running_node(nodes: &Arc<dyn NodeExecutionStore>) -> NodeExecution {
        let node = NodeExecution::new(
            Ambiance::new("exec-1", "plan-1").extend(Level::new("step-1", NodeGroup::Step)),
            Value::Null,
        );
        nodes.save(&node).await.unwrap();
        nodes
            .update_status(&node.id, NodeStatus::Queued, NodeStatus::Running)
            .await
            .unwrap()
    }

    #[test]
    fn test_abort_running_node_end_to_end() {
        tokio_test::block_on(async {
            let fx = fixture();
            let node = running_node(&fx.nodes).await;

            let (interrupt, outcome) = fx
                .service
                .register_and_process(
                    InterruptType::Abort,
                    InterruptTarget::node(node.id.clone()),
                    InterruptConfig::with_reason("operator abort"),
                )
                .await
                .unwrap();

            assert!(matches!(outcome, InterruptOutcome::Applied { .. }));
            let stored = fx.nodes.get(&node.id).await.unwrap().unwrap();
            assert_eq!(stored.status, NodeStatus::Aborted);
            assert_eq!(stored.interrupt_effects.len(), 1);

            let record = fx.interrupts.get(&interrupt.id).await.unwrap().unwrap();
            assert_eq!(record.state, InterruptState::ProcessedSuccessfully);
        });
    }

    #[test]
    fn test_second_abort_on_terminal_node_is_noop_but_successful() {
        tokio_test::block_on(async {
            let fx = fixture();
            let node = running_node(&fx.nodes).await;

            fx.service
                .register_and_process(
                    InterruptType::Abort,
                    InterruptTarget::node(node.id.clone()),
                    InterruptConfig::default(),
                )
                .await
                .unwrap();

            // First abort is processed, so the second is not a duplicate.
            let (interrupt, outcome) = fx
                .service
                .register_and_process(
                    InterruptType::Abort,
                    InterruptTarget::node(node.id.clone()),
                    InterruptConfig::default(),
                )
                .await
                .unwrap();

            assert!(matches!(outcome, InterruptOutcome::AlreadyTerminal));
            let record = fx.interrupts.get(&interrupt.id).await.unwrap().unwrap();
            assert_eq!(record.state, InterruptState::ProcessedSuccessfully);
            let stored = fx.nodes.get(&node.id).await.unwrap().unwrap();
            assert_eq!(stored.status, NodeStatus::Aborted);
            // Both interrupts left audit entries.
            assert_eq!(stored.interrupt_effects.len(), 2);
        });
    }

    #[test]
    fn test_duplicate_in_flight_interrupt_rejected() {
        tokio_test::block_on(async {
            let fx = fixture();
            let node = running_node(&fx.nodes).await;
            let target = InterruptTarget::node(node.id.clone());

            fx.service
                .register(InterruptType::Pause, target.clone(), InterruptConfig::default())
                .await
                .unwrap();

            let err = fx
                .service
                .register(InterruptType::Pause, target.clone(), InterruptConfig::default())
                .await
                .unwrap_err();
            assert!(matches!(err, InterruptError::Duplicate { .. }));

            // A different type against the same target is fine.
            fx.service
                .register(InterruptType::Abort, target, InterruptConfig::default())
                .await
                .unwrap();
        });
    }

    #[test]
    fn test_processing_twice_is_noop() {
        tokio_test::block_on(async {
            let fx = fixture();
            let node = running_node(&fx.nodes).await;

            let (interrupt, _) = fx
                .service
                .register_and_process(
                    InterruptType::Abort,
                    InterruptTarget::node(node.id.clone()),
                    InterruptConfig::default(),
                )
                .await
                .unwrap();

            let outcome = fx.service.process(&interrupt).await.unwrap();
            assert!(matches!(outcome, InterruptOutcome::AlreadyProcessed));

            let stored = fx.nodes.get(&node.id).await.unwrap().unwrap();
            // No second audit entry from the replay.
            assert_eq!(stored.interrupt_effects.len(), 1);
        });
    }

    #[test]
    fn test_retry_interrupt_creates_linked_instance() {
        tokio_test::block_on(async {
            let fx = fixture();
            let node = running_node(&fx.nodes).await;
            fx.nodes
                .update_status(&node.id, NodeStatus::Running, NodeStatus::Failed)
                .await
                .unwrap();
            // A driver is parked here waiting for exactly this kind of
            // operator request.
            fx.nodes
                .update_status(&node.id, NodeStatus::Failed, NodeStatus::InterventionWaiting)
                .await
                .unwrap();

            let (_, outcome) = fx
                .service
                .register_and_process(
                    InterruptType::Retry,
                    InterruptTarget::node(node.id.clone()),
                    InterruptConfig::default(),
                )
                .await
                .unwrap();

            match outcome {
                InterruptOutcome::Applied { retries, .. } => {
                    assert_eq!(retries.len(), 1);
                    let retry = &retries[0];
                    assert_eq!(retry.previous_execution_id.as_deref(), Some(node.id.as_str()));
                    assert_eq!(retry.retry_index(), 1);
                }
                other => panic!("unexpected outcome: {other:?}"),
            }

            let stored = fx.nodes.get(&node.id).await.unwrap().unwrap();
            assert_eq!(stored.status, NodeStatus::Retried);
        });
    }

    #[test]
    fn test_retry_against_concluded_node_creates_no_successor() {
        tokio_test::block_on(async {
            let fx = fixture();
            let node = running_node(&fx.nodes).await;
            fx.nodes
                .update_status(&node.id, NodeStatus::Running, NodeStatus::Failed)
                .await
                .unwrap();

            // No driver is waiting on a concluded instance; a successor
            // would just sit in the store undriven.
            let (_, outcome) = fx
                .service
                .register_and_process(
                    InterruptType::Retry,
                    InterruptTarget::node(node.id.clone()),
                    InterruptConfig::default(),
                )
                .await
                .unwrap();

            match outcome {
                InterruptOutcome::Applied {
                    transitioned,
                    retries,
                } => {
                    assert!(transitioned.is_empty());
                    assert!(retries.is_empty());
                }
                other => panic!("unexpected outcome: {other:?}"),
            }

            let stored = fx.nodes.get(&node.id).await.unwrap().unwrap();
            assert_eq!(stored.status, NodeStatus::Failed);
            assert!(fx.nodes.live_for_plan("exec-1").await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_plan_scoped_abort_hits_all_live_nodes() {
        tokio_test::block_on(async {
            let fx = fixture();
            let a = running_node(&fx.nodes).await;
            let b = running_node(&fx.nodes).await;

            let (_, outcome) = fx
                .service
                .register_and_process(
                    InterruptType::Abort,
                    InterruptTarget::plan("exec-1"),
                    InterruptConfig::default(),
                )
                .await
                .unwrap();

            match outcome {
                InterruptOutcome::Applied { transitioned, .. } => {
                    assert_eq!(transitioned.len(), 2);
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
            for id in [&a.id, &b.id] {
                let stored = fx.nodes.get(id).await.unwrap().unwrap();
                assert_eq!(stored.status, NodeStatus::Aborted);
            }
        });
    }
}
