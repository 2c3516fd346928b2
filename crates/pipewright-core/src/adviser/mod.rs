//! Adviser engine - the post-transition decision layer.
//!
//! After a node transition, the advisers attached to that node are evaluated
//! in declared order; the first whose `can_advise` accepts the event produces
//! the response, and later advisers are not consulted. A malformed adviser
//! configuration degrades to defaults and never blocks plan progression.

mod standard;

pub use standard::{
    ManualInterventionAdviser, ManualInterventionParameters, OnFailAdviser,
    ProceedWithDefaultAdviser, ProceedWithDefaultParameters, RetryAdviser, RetryParameters,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ambiance::Ambiance;
use crate::node::{FailureInfo, NodeStatus};

/// Keys identifying adviser implementations in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviserType {
    ManualIntervention,
    Retry,
    ProceedWithDefault,
    OnFail,
    Custom(String),
}

/// One adviser attachment on a plan node: which adviser, with what
/// serialized parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviserSpec {
    pub adviser_type: AdviserType,
    #[serde(default)]
    pub parameters: Value,
}

impl AdviserSpec {
    pub fn new(adviser_type: AdviserType, parameters: Value) -> Self {
        Self {
            adviser_type,
            parameters,
        }
    }
}

/// What the engine should do when a manual-intervention wait expires, and on
/// operator request. Configuration, never hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    Abort,
    MarkFailed,
    MarkSuccess,
    Retry,
    Ignore,
}

impl Default for RepairAction {
    fn default() -> Self {
        RepairAction::Abort
    }
}

/// The event an adviser is consulted about.
#[derive(Debug, Clone)]
pub struct AdvisingEvent {
    /// Context of the node that transitioned.
    pub ambiance: Ambiance,
    /// Status before the transition.
    pub from_status: NodeStatus,
    /// Status after the transition.
    pub to_status: NodeStatus,
    /// Failure detail, when the node broke.
    pub failure_info: Option<FailureInfo>,
    /// Serialized parameters of the adviser being consulted.
    pub adviser_parameters: Value,
    /// Retry index of the node instance.
    pub retry_index: u32,
}

impl AdvisingEvent {
    /// Deserialize the adviser parameters, falling back to defaults when the
    /// payload is missing or malformed.
    pub fn parameters_or_default<P>(&self) -> P
    where
        P: serde::de::DeserializeOwned + Default,
    {
        serde_json::from_value(self.adviser_parameters.clone()).unwrap_or_default()
    }
}

/// Outcome of an adviser evaluation, consumed exactly once by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdviserResponse {
    /// Conclude the node as succeeded and continue the plan.
    ProceedWithSuccess,
    /// Conclude the node as failed and continue the plan.
    ProceedWithFailure,
    /// Instantiate a fresh attempt of the node.
    Retry {
        /// Optional wait before the new attempt starts.
        wait: Option<Duration>,
    },
    /// Park the node for a human, auto-resolving after the timeout.
    ManualIntervention {
        timeout: Duration,
        on_timeout: RepairAction,
    },
    /// Unblock a node waiting on input with a declared default value.
    ProceedWithDefault { default_value: Value },
    /// Leave the transition as it stands.
    Ignore,
    /// Overwrite a failure with success.
    MarkSuccess,
    /// Stop the whole plan execution.
    EndPlan,
    /// Skip ahead to the named sibling step.
    NextStep { next_node_id: String },
}

/// Pluggable decision unit consulted after a node transition.
pub trait Adviser: Send + Sync {
    /// Side-effect-free predicate: does this adviser apply to the event?
    fn can_advise(&self, event: &AdvisingEvent) -> bool;

    /// Produce the next control action. Only called when `can_advise`
    /// accepted the event.
    fn on_advise_event(&self, event: &AdvisingEvent) -> AdviserResponse;
}

/// Registry mapping adviser types to implementations.
///
/// Built once at process start and passed in, never ambient global state.
#[derive(Default)]
pub struct AdviserRegistry {
    advisers: HashMap<AdviserType, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the standard advisers.
    pub fn with_standard_advisers() -> Self {
        let mut registry = Self::new();
        registry.register(AdviserType::Retry, Arc::new(RetryAdviser));
        registry.register(
            AdviserType::ManualIntervention,
            Arc::new(ManualInterventionAdviser::default()),
        );
        registry.register(
            AdviserType::ProceedWithDefault,
            Arc::new(ProceedWithDefaultAdviser),
        );
        registry.register(AdviserType::OnFail, Arc::new(OnFailAdviser));
        registry
    }

    /// Register (or replace) an adviser implementation.
    pub fn register(&mut self, adviser_type: AdviserType, adviser: Arc<dyn Adviser>) {
        self.advisers.insert(adviser_type, adviser);
    }

    pub fn get(&self, adviser_type: &AdviserType) -> Option<Arc<dyn Adviser>> {
        self.advisers.get(adviser_type).cloned()
    }

    /// Evaluate the node's declared advisers in order and return the first
    /// matching response. Unknown adviser types are skipped with a warning
    /// so one bad attachment never blocks the scan.
    pub fn advise(&self, event: &AdvisingEvent, specs: &[AdviserSpec]) -> Option<AdviserResponse> {
        for spec in specs {
            let Some(adviser) = self.advisers.get(&spec.adviser_type) else {
                tracing::warn!(adviser_type = ?spec.adviser_type, "unknown adviser type; skipping");
                continue;
            };
            let scoped = AdvisingEvent {
                adviser_parameters: spec.parameters.clone(),
                ..event.clone()
            };
            if adviser.can_advise(&scoped) {
                return Some(adviser.on_advise_event(&scoped));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Level, NodeGroup};
    use serde_json::json;

    fn event(from: NodeStatus, to: NodeStatus) -> AdvisingEvent {
        AdvisingEvent {
            ambiance: Ambiance::new("exec-1", "plan-1")
                .extend(Level::new("step-1", NodeGroup::Step)),
            from_status: from,
            to_status: to,
            failure_info: Some(FailureInfo::application("boom")),
            adviser_parameters: Value::Null,
            retry_index: 0,
        }
    }

    struct FixedAdviser(AdviserResponse);

    impl Adviser for FixedAdviser {
        fn can_advise(&self, _event: &AdvisingEvent) -> bool {
            true
        }
        fn on_advise_event(&self, _event: &AdvisingEvent) -> AdviserResponse {
            self.0.clone()
        }
    }

    struct NeverAdviser;

    impl Adviser for NeverAdviser {
        fn can_advise(&self, _event: &AdvisingEvent) -> bool {
            false
        }
        fn on_advise_event(&self, _event: &AdvisingEvent) -> AdviserResponse {
            unreachable!("can_advise is false")
        }
    }

    #[test]
    fn test_first_match_wins_in_declared_order() {
        let mut registry = AdviserRegistry::new();
        registry.register(
            AdviserType::Custom("never".into()),
            Arc::new(NeverAdviser),
        );
        registry.register(
            AdviserType::Custom("end".into()),
            Arc::new(FixedAdviser(AdviserResponse::EndPlan)),
        );
        registry.register(
            AdviserType::Custom("ignore".into()),
            Arc::new(FixedAdviser(AdviserResponse::Ignore)),
        );

        let specs = vec![
            AdviserSpec::new(AdviserType::Custom("never".into()), Value::Null),
            AdviserSpec::new(AdviserType::Custom("end".into()), Value::Null),
            AdviserSpec::new(AdviserType::Custom("ignore".into()), Value::Null),
        ];
        let response = registry.advise(&event(NodeStatus::Running, NodeStatus::Failed), &specs);
        assert_eq!(response, Some(AdviserResponse::EndPlan));
    }

    #[test]
    fn test_unknown_adviser_type_is_skipped() {
        let mut registry = AdviserRegistry::new();
        registry.register(
            AdviserType::OnFail,
            Arc::new(FixedAdviser(AdviserResponse::ProceedWithFailure)),
        );

        let specs = vec![
            AdviserSpec::new(AdviserType::Custom("missing".into()), json!({"a": 1})),
            AdviserSpec::new(AdviserType::OnFail, Value::Null),
        ];
        let response = registry.advise(&event(NodeStatus::Running, NodeStatus::Failed), &specs);
        assert_eq!(response, Some(AdviserResponse::ProceedWithFailure));
    }

    #[test]
    fn test_no_match_returns_none() {
        let registry = AdviserRegistry::new();
        let response = registry.advise(&event(NodeStatus::Running, NodeStatus::Succeeded), &[]);
        assert_eq!(response, None);
    }

    #[test]
    fn test_malformed_parameters_degrade_to_default() {
        let mut raw = event(NodeStatus::Running, NodeStatus::Failed);
        raw.adviser_parameters = json!({"max_attempts": "not-a-number"});
        let params: RetryParameters = raw.parameters_or_default();
        assert_eq!(params, RetryParameters::default());
    }
}
