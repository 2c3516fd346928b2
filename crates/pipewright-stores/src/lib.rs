//! # Pipewright Stores
//!
//! Reference implementations of the pipewright-core store contracts, plus
//! the realtime event bus. All in-memory; a durable backend implements the
//! same traits against its own storage.

mod event_bus;
mod interrupt_store;
mod node_store;
mod timeout_store;

pub use event_bus::{BroadcastEventBus, EngineEvent, EventBus};
pub use interrupt_store::InMemoryInterruptStore;
pub use node_store::InMemoryNodeExecutionStore;
pub use timeout_store::InMemoryTimeoutStore;
