//! Standard adviser implementations.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Adviser, AdviserResponse, AdvisingEvent, RepairAction};
use crate::node::{FailureType, NodeStatus};

/// Default wait before a manual intervention auto-resolves: 24 hours.
pub const DEFAULT_INTERVENTION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Parameters for [ManualInterventionAdviser].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualInterventionParameters {
    /// Failure types this adviser applies to. Empty means the status check
    /// alone decides.
    pub applicable_failure_types: Vec<FailureType>,
    /// Wait before auto-resolving, in seconds. Zero means the adviser's
    /// configured default.
    pub timeout_secs: u64,
    /// Action taken when the wait expires; `None` means the adviser's
    /// configured default.
    pub on_timeout: Option<RepairAction>,
}

/// Routes a broken node to a human.
///
/// Never triggers when the node was already waiting for intervention, so an
/// intervention outcome cannot re-enter the adviser.
#[derive(Debug)]
pub struct ManualInterventionAdviser {
    default_timeout: Duration,
    default_action: RepairAction,
}

impl Default for ManualInterventionAdviser {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_INTERVENTION_TIMEOUT,
            default_action: RepairAction::Abort,
        }
    }
}

impl ManualInterventionAdviser {
    /// Adviser with operator-configured fallback timeout and repair action,
    /// used when a node's parameters leave them unset.
    pub fn with_defaults(default_timeout: Duration, default_action: RepairAction) -> Self {
        Self {
            default_timeout,
            default_action,
        }
    }
}

impl Adviser for ManualInterventionAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        if !event.to_status.is_broken() {
            return false;
        }
        if event.from_status == NodeStatus::InterventionWaiting {
            return false;
        }
        let params: ManualInterventionParameters = event.parameters_or_default();
        if params.applicable_failure_types.is_empty() {
            return true;
        }
        event
            .failure_info
            .as_ref()
            .map(|info| info.has_any(&params.applicable_failure_types))
            .unwrap_or(false)
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> AdviserResponse {
        let params: ManualInterventionParameters = event.parameters_or_default();
        let timeout = if params.timeout_secs == 0 {
            self.default_timeout
        } else {
            Duration::from_secs(params.timeout_secs)
        };
        AdviserResponse::ManualIntervention {
            timeout,
            on_timeout: params.on_timeout.unwrap_or(self.default_action),
        }
    }
}

/// Parameters for [RetryAdviser].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryParameters {
    /// Total retry attempts allowed beyond the first run.
    pub max_attempts: u32,
    /// Wait before each new attempt, in milliseconds.
    pub wait_ms: u64,
    /// Failure types this adviser applies to. Empty means any failure.
    pub applicable_failure_types: Vec<FailureType>,
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            wait_ms: 0,
            applicable_failure_types: Vec::new(),
        }
    }
}

/// Re-runs a broken node until its attempt budget is spent, then falls
/// through to whatever adviser is declared next.
#[derive(Debug, Default)]
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        if !event.to_status.is_broken() || event.from_status == NodeStatus::InterventionWaiting {
            return false;
        }
        let params: RetryParameters = event.parameters_or_default();
        if event.retry_index >= params.max_attempts {
            // Exhausted: not applicable, the scan falls through.
            return false;
        }
        if params.applicable_failure_types.is_empty() {
            return true;
        }
        event
            .failure_info
            .as_ref()
            .map(|info| info.has_any(&params.applicable_failure_types))
            .unwrap_or(false)
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> AdviserResponse {
        let params: RetryParameters = event.parameters_or_default();
        let wait = (params.wait_ms > 0).then(|| Duration::from_millis(params.wait_ms));
        AdviserResponse::Retry { wait }
    }
}

/// Parameters for [ProceedWithDefaultAdviser].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProceedWithDefaultParameters {
    /// Declared default supplied in place of the unresolved input.
    pub default_value: serde_json::Value,
}

/// Unblocks a node parked for unresolved runtime input with its declared
/// default value. Only applicable when the node is leaving an intervention
/// wait.
#[derive(Debug, Default)]
pub struct ProceedWithDefaultAdviser;

impl Adviser for ProceedWithDefaultAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        event.from_status == NodeStatus::InterventionWaiting
    }

    fn on_advise_event(&self, event: &AdvisingEvent) -> AdviserResponse {
        let params: ProceedWithDefaultParameters = event.parameters_or_default();
        AdviserResponse::ProceedWithDefault {
            default_value: params.default_value,
        }
    }
}

/// Unconditional fallback once a node is broken: conclude with failure.
/// Typically declared last.
#[derive(Debug, Default)]
pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn can_advise(&self, event: &AdvisingEvent) -> bool {
        event.to_status.is_broken()
    }

    fn on_advise_event(&self, _event: &AdvisingEvent) -> AdviserResponse {
        AdviserResponse::ProceedWithFailure
    }
}
