//! EventBus - fire-and-forget fan-out of engine events.
//!
//! Every status transition is announced here for observers (notification
//! formatting, graph updates, audit). Delivery failure is logged, never
//! blocks a transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use pipewright_core::ambiance::Ambiance;
use pipewright_core::interrupt::InterruptType;
use pipewright_core::node::NodeStatus;
use pipewright_core::store::StoreError;

/// Events emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A node execution moved through the state machine.
    NodeStatusChanged {
        ambiance: Ambiance,
        node_execution_id: String,
        from: NodeStatus,
        to: NodeStatus,
        at: DateTime<Utc>,
    },
    /// An interrupt finished processing.
    InterruptProcessed {
        interrupt_id: String,
        interrupt_type: InterruptType,
        success: bool,
        at: DateTime<Utc>,
    },
    /// The whole plan execution concluded.
    PlanConcluded {
        plan_execution_id: String,
        status: NodeStatus,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn status_changed(
        ambiance: Ambiance,
        node_execution_id: impl Into<String>,
        from: NodeStatus,
        to: NodeStatus,
    ) -> Self {
        Self::NodeStatusChanged {
            ambiance,
            node_execution_id: node_execution_id.into(),
            from,
            to,
            at: Utc::now(),
        }
    }
}

/// EventBus trait - async interface for realtime event publish/subscribe.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to all active subscribers.
    async fn publish(&self, event: EngineEvent) -> Result<(), StoreError>;

    /// Subscribe to realtime events.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// In-process EventBus based on tokio broadcast channels.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl BroadcastEventBus {
    /// Create a new broadcast bus with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Return the configured channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        // Default capacity for local realtime consumers.
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: EngineEvent) -> Result<(), StoreError> {
        // "No receiver" is not an error; the store remains source-of-truth.
        match self.tx.send(event) {
            Ok(_) => Ok(()),
            Err(broadcast::error::SendError(_)) => Ok(()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::ambiance::{Level, NodeGroup};

    fn ambiance() -> Ambiance {
        Ambiance::new("exec-1", "plan-1").extend(Level::new("step-1", NodeGroup::Step))
    }

    #[test]
    fn test_broadcast_bus_delivers_event() {
        tokio_test::block_on(async {
            let bus = BroadcastEventBus::new(16);
            let mut rx = bus.subscribe();

            bus.publish(EngineEvent::status_changed(
                ambiance(),
                "node-1",
                NodeStatus::Queued,
                NodeStatus::Running,
            ))
            .await
            .unwrap();

            let event = rx.recv().await.expect("event");
            match event {
                EngineEvent::NodeStatusChanged { from, to, .. } => {
                    assert_eq!(from, NodeStatus::Queued);
                    assert_eq!(to, NodeStatus::Running);
                }
                _ => panic!("expected status change event"),
            }
        });
    }

    #[test]
    fn test_broadcast_bus_publish_without_subscribers_is_ok() {
        tokio_test::block_on(async {
            let bus = BroadcastEventBus::new(4);
            bus.publish(EngineEvent::PlanConcluded {
                plan_execution_id: "exec-1".into(),
                status: NodeStatus::Succeeded,
                at: Utc::now(),
            })
            .await
            .unwrap();
        });
    }
}
