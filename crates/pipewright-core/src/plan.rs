//! Plan - the directed execution tree the engine walks.
//!
//! A plan arrives already built (authoring and YAML parsing live elsewhere).
//! Validation catches configuration errors - dangling children, step types
//! with no decisive facilitator - before anything executes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::adviser::AdviserSpec;
use crate::ambiance::{Ambiance, Level, NodeGroup};
use crate::facilitator::FacilitatorRegistry;

/// Type alias for plan node identifiers (setup ids).
pub type PlanNodeId = String;

/// Deadline configuration declared on a plan node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSpec {
    /// Budget for the node's execution.
    pub duration: Duration,
    /// Whether the budget clock stops while the node waits on a human.
    #[serde(default)]
    pub pausable: bool,
}

impl TimeoutSpec {
    pub fn absolute(duration: Duration) -> Self {
        Self {
            duration,
            pausable: false,
        }
    }

    pub fn pausable(duration: Duration) -> Self {
        Self {
            duration,
            pausable: true,
        }
    }
}

/// One node of the execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    /// Setup identifier, unique within the plan.
    pub id: PlanNodeId,
    /// Display name for operators.
    pub name: String,
    /// Layer of the plan tree.
    pub group: NodeGroup,
    /// Step type resolved through the facilitator and step registries.
    pub step_type: String,
    /// Serialized step parameters.
    #[serde(default)]
    pub step_parameters: Value,
    /// Advisers consulted after this node's transitions, in declared order.
    #[serde(default)]
    pub advisers: Vec<AdviserSpec>,
    /// Optional execution deadline.
    #[serde(default)]
    pub timeout: Option<TimeoutSpec>,
    /// Child node ids, in declared order.
    #[serde(default)]
    pub children: Vec<PlanNodeId>,
}

impl PlanNode {
    pub fn new(
        id: impl Into<PlanNodeId>,
        name: impl Into<String>,
        group: NodeGroup,
        step_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            group,
            step_type: step_type.into(),
            step_parameters: Value::Null,
            advisers: Vec::new(),
            timeout: None,
            children: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_advisers(mut self, advisers: Vec<AdviserSpec>) -> Self {
        self.advisers = advisers;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutSpec) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_children(mut self, children: Vec<PlanNodeId>) -> Self {
        self.children = children;
        self
    }
}

/// Plan configuration errors. Fatal at validation time, never discovered
/// mid-execution.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("duplicate plan node id '{0}'")]
    DuplicateNode(PlanNodeId),
    #[error("root node '{0}' not found in plan")]
    MissingRoot(PlanNodeId),
    #[error("node '{parent}' references unknown child '{child}'")]
    UnknownChild { parent: PlanNodeId, child: PlanNodeId },
    #[error("no decisive facilitator for step type '{step_type}' (node '{node}')")]
    NoDecisiveFacilitator { node: PlanNodeId, step_type: String },
}

/// The directed execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Plan definition identifier.
    pub id: String,
    /// Root node id, normally the pipeline node.
    pub root: PlanNodeId,
    nodes: HashMap<PlanNodeId, PlanNode>,
}

impl Plan {
    /// Assemble a plan from nodes. Rejects duplicate ids and dangling
    /// references.
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PlanNodeId>,
        nodes: Vec<PlanNode>,
    ) -> Result<Self, PlanError> {
        let root = root.into();
        let mut map = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let id = node.id.clone();
            if map.insert(id.clone(), node).is_some() {
                return Err(PlanError::DuplicateNode(id));
            }
        }
        let plan = Self {
            id: id.into(),
            root,
            nodes: map,
        };
        if !plan.nodes.contains_key(&plan.root) {
            return Err(PlanError::MissingRoot(plan.root.clone()));
        }
        for node in plan.nodes.values() {
            for child in &node.children {
                if !plan.nodes.contains_key(child) {
                    return Err(PlanError::UnknownChild {
                        parent: node.id.clone(),
                        child: child.clone(),
                    });
                }
            }
        }
        Ok(plan)
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.values()
    }

    /// Plan-validation-time facilitator check: every node's step type must
    /// resolve to a decisive facilitator, probed with the node's own
    /// parameters.
    pub fn validate(&self, facilitators: &FacilitatorRegistry) -> Result<(), PlanError> {
        for node in self.nodes.values() {
            let probe = Ambiance::new("validation", &self.id)
                .extend(Level::new(&node.id, node.group));
            if facilitators
                .facilitate(&node.step_type, &probe, &node.step_parameters)
                .is_none()
            {
                return Err(PlanError::NoDecisiveFacilitator {
                    node: node.id.clone(),
                    step_type: node.step_type.clone(),
                });
            }
        }
        Ok(())
    }
}
