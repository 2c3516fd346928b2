//! NodeExecution - the state-machine record for one run of one plan node.
//!
//! Status transitions follow an explicit directed table; every update goes
//! through the store's conditional compare-and-swap primitive so a racing
//! interrupt and adviser decision cannot both win against the same prior
//! status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ambiance::Ambiance;
use crate::interrupt::{InterruptConfig, InterruptType};

/// Type alias for NodeExecution ID
pub type NodeExecutionId = String;

/// Node execution state machine - production states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Instantiated, not yet picked up
    Queued,
    /// Currently executing
    Running,
    /// Waiting for spawned async work to report back
    AsyncWaiting,
    /// Waiting for a dispatched remote task result
    TaskWaiting,
    /// Pause requested, draining in-flight work
    Pausing,
    /// Paused
    Paused,
    /// Waiting for a human to resolve a failure
    InterventionWaiting,
    /// Superseded by a fresh retry instantiation
    Retried,
    /// Completed successfully
    Succeeded,
    /// Completed with failure
    Failed,
    /// Forced out by a timeout
    Expired,
    /// Forced out by an abort signal
    Aborted,
    /// Skipped without executing
    Skipped,
    /// Plan execution suspended around this node
    Suspended,
}

impl NodeStatus {
    /// Whether this status ends the node's execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded
                | NodeStatus::Failed
                | NodeStatus::Expired
                | NodeStatus::Aborted
                | NodeStatus::Skipped
                | NodeStatus::Suspended
        )
    }

    /// Whether this status represents a breakage an adviser may act on.
    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            NodeStatus::Failed | NodeStatus::Expired | NodeStatus::Aborted
        )
    }

    /// All statuses, for exhaustive table checks.
    pub fn all() -> [NodeStatus; 14] {
        [
            NodeStatus::Queued,
            NodeStatus::Running,
            NodeStatus::AsyncWaiting,
            NodeStatus::TaskWaiting,
            NodeStatus::Pausing,
            NodeStatus::Paused,
            NodeStatus::InterventionWaiting,
            NodeStatus::Retried,
            NodeStatus::Succeeded,
            NodeStatus::Failed,
            NodeStatus::Expired,
            NodeStatus::Aborted,
            NodeStatus::Skipped,
            NodeStatus::Suspended,
        ]
    }

    /// Directed transition table.
    ///
    /// Abort and expiry pre-empt any non-terminal status. Adviser-driven
    /// edges lead out of Failed/Expired even though both end execution of
    /// the instance itself.
    pub fn can_transition(from: NodeStatus, to: NodeStatus) -> bool {
        use NodeStatus::*;
        if from == to {
            return false;
        }
        // Pre-emption: interrupt or timeout may force out any live node.
        if !from.is_terminal() && from != Retried && matches!(to, Aborted | Expired) {
            return true;
        }
        match from {
            Queued => matches!(to, Running | Skipped | Paused | Suspended),
            Running => matches!(
                to,
                AsyncWaiting | TaskWaiting | Succeeded | Failed | Pausing | Suspended
            ),
            AsyncWaiting => matches!(to, Succeeded | Failed | Pausing),
            TaskWaiting => matches!(to, Running | Succeeded | Failed | Pausing),
            Pausing => matches!(to, Paused | Running),
            Paused => matches!(to, Queued | Running),
            InterventionWaiting => matches!(to, Retried | Running | Succeeded | Failed),
            Failed => matches!(to, InterventionWaiting | Retried),
            Expired => matches!(to, InterventionWaiting | Retried),
            Retried | Succeeded | Aborted | Skipped | Suspended => false,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Queued => "queued",
            NodeStatus::Running => "running",
            NodeStatus::AsyncWaiting => "async_waiting",
            NodeStatus::TaskWaiting => "task_waiting",
            NodeStatus::Pausing => "pausing",
            NodeStatus::Paused => "paused",
            NodeStatus::InterventionWaiting => "intervention_waiting",
            NodeStatus::Retried => "retried",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Expired => "expired",
            NodeStatus::Aborted => "aborted",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Classification tags attached to a failure, used by advisers to decide
/// whether they apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Connectivity,
    Authentication,
    Authorization,
    Timeout,
    Verification,
    Application,
    Unknown,
}

/// Failure detail carried by a broken NodeExecution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Human-readable reason, always present for operators.
    pub message: String,
    /// Classification tags.
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
        }
    }

    /// Untagged failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(message, vec![FailureType::Application])
    }

    pub fn has_any(&self, types: &[FailureType]) -> bool {
        self.failure_types.iter().any(|t| types.contains(t))
    }
}

/// Audit entry for one interrupt applied to a NodeExecution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptEffect {
    /// Identifier of the applied interrupt.
    pub interrupt_id: String,
    /// Kind of interrupt.
    pub interrupt_type: InterruptType,
    /// Configuration the interrupt carried.
    pub config: InterruptConfig,
    /// When the effect took hold.
    pub applied_at: DateTime<Utc>,
}

/// One run of one plan node. Re-instantiated on retry; retry chains are
/// linked by id, never by owning pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Unique identifier.
    pub id: NodeExecutionId,
    /// Position in the plan tree.
    pub ambiance: Ambiance,
    /// Current state-machine status.
    pub status: NodeStatus,
    /// Step parameters this instance was created with.
    pub step_parameters: Value,
    /// Audit trail of every interrupt applied, appendable even after a
    /// terminal status.
    pub interrupt_effects: Vec<InterruptEffect>,
    /// Ids of timeout instances currently owned by this node.
    pub timeout_ids: Vec<String>,
    /// Failure detail, set when the node breaks.
    pub failure_info: Option<FailureInfo>,
    /// Adviser-chosen next action, serialized once decided.
    pub resolved_advice: Option<Value>,
    /// Parent node execution, if any.
    pub parent_id: Option<NodeExecutionId>,
    /// Previous attempt this instance retries, if any.
    pub previous_execution_id: Option<NodeExecutionId>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// Create a fresh queued instance.
    pub fn new(ambiance: Ambiance, step_parameters: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ambiance,
            status: NodeStatus::Queued,
            step_parameters,
            interrupt_effects: Vec::new(),
            timeout_ids: Vec::new(),
            failure_info: None,
            resolved_advice: None,
            parent_id: None,
            previous_execution_id: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Set the parent back-reference.
    pub fn with_parent(mut self, parent_id: impl Into<NodeExecutionId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Create the retry successor of this instance: ambiance cloned with a
    /// bumped retry index, back-reference to this instance.
    pub fn instantiate_retry(&self) -> NodeExecution {
        let mut next = NodeExecution::new(
            self.ambiance.clone_for_retry(),
            self.step_parameters.clone(),
        );
        next.parent_id = self.parent_id.clone();
        next.previous_execution_id = Some(self.id.clone());
        next
    }

    /// The plan-node setup id this instance was created from.
    pub fn setup_id(&self) -> &str {
        self.ambiance
            .current_level()
            .map(|l| l.setup_id.as_str())
            .unwrap_or("")
    }

    /// Current retry index.
    pub fn retry_index(&self) -> u32 {
        self.ambiance
            .current_level()
            .map(|l| l.retry_index)
            .unwrap_or(0)
    }
}
