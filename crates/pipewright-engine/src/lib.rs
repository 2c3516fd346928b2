//! # Pipewright Engine
//!
//! The orchestration machinery: walks an execution plan, drives every node
//! through its lifecycle, consults advisers after each transition, applies
//! external interrupts, and watches deadlines from an independent monitor
//! task.
//!
//! The only mutation entry point exposed to callers outside the engine is
//! interrupt registration; everything else funnels through the per-node
//! compare-and-swap transition discipline.

pub mod bootstrap;
pub mod driver;
pub mod error;
pub mod interrupts;
pub mod orchestrator;
pub mod router;
pub mod timeouts;
pub mod transitions;

pub use bootstrap::{init_tracing_if_needed, Engine, EngineBuilder};
pub use driver::{DriverSettings, NodeDriver, NodeResult, PlanControl};
pub use error::EngineError;
pub use interrupts::{InterruptOutcome, InterruptService};
pub use orchestrator::{PlanExecutor, PlanOutcome};
pub use router::TaskResultRouter;
pub use timeouts::TimeoutMonitor;
pub use transitions::{TransitionOutcome, Transitioner};
