//! # Pipewright Core
//!
//! Core abstractions and deterministic logic for the Pipewright orchestration
//! engine.
//!
//! This crate contains:
//! - Ambiance / Level execution-context definitions
//! - Plan / PlanNode definitions and plan-time validation
//! - NodeExecution state machine and its transition table
//! - Adviser / Facilitator contracts and the standard implementations
//! - Timeout trackers and the task-chain protocol
//! - Store and dispatch traits implemented elsewhere
//!
//! This crate does NOT care about:
//! - How records are persisted (see pipewright-stores)
//! - How nodes are actually driven (see pipewright-engine)
//! - How a plan was authored or parsed

pub mod adviser;
pub mod ambiance;
pub mod chain;
pub mod dispatch;
pub mod facilitator;
pub mod interrupt;
pub mod node;
pub mod plan;
pub mod step;
pub mod store;
pub mod timeout;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::adviser::{
        Adviser, AdviserRegistry, AdviserResponse, AdviserSpec, AdviserType, AdvisingEvent,
        ManualInterventionAdviser, OnFailAdviser, ProceedWithDefaultAdviser, RepairAction,
        RetryAdviser,
    };
    pub use crate::ambiance::{Ambiance, Level, NodeGroup};
    pub use crate::chain::{
        ChainError, PassThroughData, TaskChainExecutable, TaskChainResponse,
    };
    pub use crate::dispatch::{TaskDescriptor, TaskDispatcher, TaskResult};
    pub use crate::facilitator::{
        ExecutionMode, Facilitator, FacilitatorRegistry, FacilitatorResponse,
    };
    pub use crate::interrupt::{
        Interrupt, InterruptConfig, InterruptState, InterruptTarget, InterruptType,
    };
    pub use crate::node::{
        FailureInfo, FailureType, InterruptEffect, NodeExecution, NodeExecutionId, NodeStatus,
    };
    pub use crate::plan::{Plan, PlanError, PlanNode, PlanNodeId};
    pub use crate::step::{StepOutcome, StepRegistry, SyncExecutable, TaskExecutable};
    pub use crate::store::{
        InterruptStore, NodeExecutionStore, StoreError, TimeoutStore,
    };
    pub use crate::timeout::{
        AbsoluteTracker, ActiveTracker, TimeoutInstance, TimeoutTracker, TrackerState,
    };
}

// Re-export key types at crate root
pub use ambiance::{Ambiance, Level, NodeGroup};
pub use node::{NodeExecution, NodeExecutionId, NodeStatus};
pub use store::StoreError;
