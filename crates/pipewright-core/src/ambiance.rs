//! Ambiance - the immutable execution context.
//!
//! An Ambiance identifies a node's position in the plan tree as an ordered,
//! append-only sequence of levels (pipeline → stage → step-group → step).
//! It is never mutated in place, only extended by copy, so concurrent readers
//! never observe a torn context.

use serde::{Deserialize, Serialize};

/// Which layer of the plan tree a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeGroup {
    Pipeline,
    Stage,
    StepGroup,
    Step,
}

/// One entry in an Ambiance, identifying one plan node instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Identifier of the plan node this level was instantiated from.
    pub setup_id: String,
    /// Identifier of the runtime instance (unique per retry).
    pub runtime_id: String,
    /// Layer of the plan tree.
    pub group: NodeGroup,
    /// Zero-based retry counter for this node.
    pub retry_index: u32,
}

impl Level {
    /// Create a level with a fresh runtime id and retry index 0.
    pub fn new(setup_id: impl Into<String>, group: NodeGroup) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: uuid::Uuid::new_v4().to_string(),
            group,
            retry_index: 0,
        }
    }

    /// Clone this level for a retry: fresh runtime id, retry index bumped.
    pub fn for_retry(&self) -> Self {
        Self {
            setup_id: self.setup_id.clone(),
            runtime_id: uuid::Uuid::new_v4().to_string(),
            group: self.group,
            retry_index: self.retry_index + 1,
        }
    }
}

/// Immutable, append-only execution-context path.
///
/// A child node's Ambiance is always the parent's Ambiance plus exactly one
/// appended level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    /// Identifier of the whole plan execution.
    pub plan_execution_id: String,
    /// Identifier of the plan definition.
    pub plan_id: String,
    levels: Vec<Level>,
}

impl Ambiance {
    /// Create an empty ambiance for a plan execution.
    pub fn new(plan_execution_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            levels: Vec::new(),
        }
    }

    /// Return a new ambiance with `level` appended. Pure; `self` is untouched.
    pub fn extend(&self, level: Level) -> Ambiance {
        let mut next = self.clone();
        next.levels.push(level);
        next
    }

    /// Return a new ambiance with the last level dropped (for finishing a
    /// child and handing control back to the parent).
    pub fn clone_for_finish(&self) -> Ambiance {
        let mut next = self.clone();
        next.levels.pop();
        next
    }

    /// Return a new ambiance whose last level is replaced by its retry clone.
    pub fn clone_for_retry(&self) -> Ambiance {
        let mut next = self.clone();
        if let Some(last) = next.levels.pop() {
            next.levels.push(last.for_retry());
        }
        next
    }

    /// The deepest level, if any.
    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// All levels, root first.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// The prefix of levels up to and including the outermost level of the
    /// given group. Empty slice if no such level exists.
    pub fn levels_up_to(&self, group: NodeGroup) -> &[Level] {
        match self.levels.iter().position(|l| l.group == group) {
            Some(idx) => &self.levels[..=idx],
            None => &[],
        }
    }

    /// The deepest level of the given group, if any.
    pub fn level_of(&self, group: NodeGroup) -> Option<&Level> {
        self.levels.iter().rev().find(|l| l.group == group)
    }

    /// Runtime id of the current level, empty if the ambiance has no levels.
    pub fn current_runtime_id(&self) -> &str {
        self.current_level().map(|l| l.runtime_id.as_str()).unwrap_or("")
    }

    /// Depth of the context path.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}
