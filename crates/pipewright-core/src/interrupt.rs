//! Interrupt - asynchronously delivered external control requests.
//!
//! An interrupt is registered by an external caller, consumed exactly once,
//! and always ends in a terminal processing state after processing has been
//! attempted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::{NodeExecutionId, NodeStatus};

/// Unique identifier for an interrupt.
pub type InterruptId = String;

/// Kind of interrupt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptType {
    /// Force the target out of any live status.
    Abort,
    /// Request a pause at the next safe point.
    Pause,
    /// Resume a paused or intervention-waiting target.
    Resume,
    /// Re-instantiate a failed target.
    Retry,
    /// Force expiry, raised by the timeout monitor.
    MarkExpired,
    /// Operator-defined interrupt kind.
    Custom(String),
}

impl InterruptType {
    /// Statuses this interrupt may be applied from. A target outside this
    /// set (and not terminal) rejects the interrupt; a terminal target is a
    /// reported no-op.
    pub fn allowed_from(&self, status: NodeStatus) -> bool {
        use NodeStatus::*;
        match self {
            InterruptType::Abort | InterruptType::MarkExpired => !status.is_terminal(),
            InterruptType::Pause => {
                matches!(status, Queued | Running | AsyncWaiting | TaskWaiting)
            }
            InterruptType::Resume => {
                matches!(status, Paused | Pausing | InterventionWaiting)
            }
            InterruptType::Retry => {
                matches!(status, Failed | Expired | InterventionWaiting)
            }
            InterruptType::Custom(_) => !status.is_terminal(),
        }
    }

    /// The status this interrupt drives its target to, where the mapping is
    /// fixed. Custom interrupts have no fixed target status.
    pub fn target_status(&self, current: NodeStatus) -> Option<NodeStatus> {
        use NodeStatus::*;
        match self {
            InterruptType::Abort => Some(Aborted),
            InterruptType::MarkExpired => Some(Expired),
            InterruptType::Pause => Some(if current == Queued { Paused } else { Pausing }),
            InterruptType::Resume => Some(if current == Paused { Queued } else { Running }),
            InterruptType::Retry => Some(Retried),
            InterruptType::Custom(_) => None,
        }
    }
}

/// What an interrupt applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InterruptTarget {
    /// A single node execution.
    Node { node_execution_id: NodeExecutionId },
    /// Every live node of a plan execution.
    Plan { plan_execution_id: String },
}

impl InterruptTarget {
    pub fn node(id: impl Into<NodeExecutionId>) -> Self {
        Self::Node {
            node_execution_id: id.into(),
        }
    }

    pub fn plan(id: impl Into<String>) -> Self {
        Self::Plan {
            plan_execution_id: id.into(),
        }
    }
}

/// Processing lifecycle of an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

impl InterruptState {
    /// Whether processing has finished, one way or the other.
    pub fn is_processed(&self) -> bool {
        matches!(
            self,
            InterruptState::ProcessedSuccessfully | InterruptState::ProcessedUnsuccessfully
        )
    }

    /// Whether this interrupt still counts as in flight for duplicate
    /// detection.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            InterruptState::Registered | InterruptState::Processing
        )
    }
}

/// Optional payload carried by an interrupt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterruptConfig {
    /// Who or what raised the interrupt.
    pub issued_by: Option<String>,
    /// Free-form reason shown to operators.
    pub reason: Option<String>,
    /// Opaque extra payload.
    #[serde(default)]
    pub payload: Value,
}

impl InterruptConfig {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            issued_by: None,
            reason: Some(reason.into()),
            payload: Value::Null,
        }
    }
}

/// A registered control request against one or more node executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interrupt {
    /// Unique interrupt identifier.
    pub id: InterruptId,
    /// Kind of interrupt.
    pub interrupt_type: InterruptType,
    /// What it applies to.
    pub target: InterruptTarget,
    /// Optional payload.
    pub config: InterruptConfig,
    /// Processing lifecycle state.
    pub state: InterruptState,
    /// When the interrupt was registered.
    pub created_at: DateTime<Utc>,
    /// When the interrupt reached a processed state.
    pub processed_at: Option<DateTime<Utc>>,
}

impl Interrupt {
    /// Create a newly registered interrupt.
    pub fn new(interrupt_type: InterruptType, target: InterruptTarget, config: InterruptConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            interrupt_type,
            target,
            config,
            state: InterruptState::Registered,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_allowed_from_any_live_status() {
        for status in NodeStatus::all() {
            assert_eq!(
                InterruptType::Abort.allowed_from(status),
                !status.is_terminal(),
                "{status}"
            );
        }
    }

    #[test]
    fn test_pause_and_resume_source_sets() {
        assert!(InterruptType::Pause.allowed_from(NodeStatus::Running));
        assert!(!InterruptType::Pause.allowed_from(NodeStatus::Paused));
        assert!(InterruptType::Resume.allowed_from(NodeStatus::Paused));
        assert!(InterruptType::Resume.allowed_from(NodeStatus::InterventionWaiting));
        assert!(!InterruptType::Resume.allowed_from(NodeStatus::Running));
    }

    #[test]
    fn test_target_status_mapping() {
        assert_eq!(
            InterruptType::Pause.target_status(NodeStatus::Queued),
            Some(NodeStatus::Paused)
        );
        assert_eq!(
            InterruptType::Pause.target_status(NodeStatus::Running),
            Some(NodeStatus::Pausing)
        );
        assert_eq!(
            InterruptType::Resume.target_status(NodeStatus::Paused),
            Some(NodeStatus::Queued)
        );
        assert_eq!(
            InterruptType::Custom("drain".into()).target_status(NodeStatus::Running),
            None
        );
    }

    #[test]
    fn test_in_flight_states() {
        assert!(InterruptState::Registered.is_in_flight());
        assert!(InterruptState::Processing.is_in_flight());
        assert!(!InterruptState::ProcessedSuccessfully.is_in_flight());
        assert!(InterruptState::ProcessedUnsuccessfully.is_processed());
    }
}
