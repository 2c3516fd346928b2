//! Facilitator registry - chooses a node's execution mode before it runs.
//!
//! Multiple facilitators may be registered per step type; they are evaluated
//! in registration order and the first decisive response wins. A step type
//! with no decisive facilitator is a configuration error surfaced at
//! plan-validation time, never at run time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ambiance::Ambiance;

/// How a node executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run inline on the driving thread.
    Sync,
    /// Spawn and wait for completion.
    Async,
    /// Dispatch one remote task and wait for its result.
    Task,
    /// Drive a sequence of remote task dispatches within the node.
    TaskChain,
    /// Execute child nodes one after another.
    Child,
    /// Execute child nodes in parallel.
    Children,
}

/// A decisive facilitator outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilitatorResponse {
    pub mode: ExecutionMode,
    /// Wait applied before the node starts executing.
    pub initial_wait: Option<Duration>,
}

impl FacilitatorResponse {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            initial_wait: None,
        }
    }

    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = Some(wait);
        self
    }
}

/// Pluggable selector of a node's execution mode. Pure: no side effects
/// beyond selection.
pub trait Facilitator: Send + Sync {
    /// `None` means "not decisive for this node"; the scan moves on.
    fn facilitate(&self, ambiance: &Ambiance, step_parameters: &Value)
        -> Option<FacilitatorResponse>;
}

/// Facilitator that always selects a fixed mode. The common case: most step
/// types declare their mode statically.
pub struct FixedModeFacilitator {
    response: FacilitatorResponse,
}

impl FixedModeFacilitator {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            response: FacilitatorResponse::new(mode),
        }
    }

    pub fn with_initial_wait(mode: ExecutionMode, wait: Duration) -> Self {
        Self {
            response: FacilitatorResponse::new(mode).with_initial_wait(wait),
        }
    }
}

impl Facilitator for FixedModeFacilitator {
    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        _step_parameters: &Value,
    ) -> Option<FacilitatorResponse> {
        Some(self.response.clone())
    }
}

/// Registry mapping step types to their facilitators, preserving
/// registration order per step type.
#[derive(Default)]
pub struct FacilitatorRegistry {
    facilitators: HashMap<String, Vec<Arc<dyn Facilitator>>>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a facilitator for a step type.
    pub fn register(&mut self, step_type: impl Into<String>, facilitator: Arc<dyn Facilitator>) {
        self.facilitators
            .entry(step_type.into())
            .or_default()
            .push(facilitator);
    }

    /// Whether any facilitator is registered for the step type.
    pub fn knows(&self, step_type: &str) -> bool {
        self.facilitators
            .get(step_type)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Evaluate the step type's facilitators in registration order; first
    /// decisive response wins. `None` when nothing is decisive, which plan
    /// validation treats as fatal.
    pub fn facilitate(
        &self,
        step_type: &str,
        ambiance: &Ambiance,
        step_parameters: &Value,
    ) -> Option<FacilitatorResponse> {
        self.facilitators
            .get(step_type)?
            .iter()
            .find_map(|f| f.facilitate(ambiance, step_parameters))
    }
}
