//! In-memory InterruptStore.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use pipewright_core::interrupt::{
    Interrupt, InterruptId, InterruptState, InterruptTarget, InterruptType,
};
use pipewright_core::store::{InterruptStore, StoreError};

/// In-memory interrupt store.
#[derive(Default)]
pub struct InMemoryInterruptStore {
    interrupts: RwLock<HashMap<InterruptId, Interrupt>>,
}

impl InMemoryInterruptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InterruptStore for InMemoryInterruptStore {
    async fn save(&self, interrupt: &Interrupt) -> Result<(), StoreError> {
        self.interrupts
            .write()
            .await
            .insert(interrupt.id.clone(), interrupt.clone());
        Ok(())
    }

    async fn get(&self, id: &InterruptId) -> Result<Option<Interrupt>, StoreError> {
        Ok(self.interrupts.read().await.get(id).cloned())
    }

    async fn update_state(
        &self,
        id: &InterruptId,
        state: InterruptState,
    ) -> Result<(), StoreError> {
        let mut interrupts = self.interrupts.write().await;
        let interrupt = interrupts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        interrupt.state = state;
        if state.is_processed() {
            interrupt.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn find_in_flight(
        &self,
        target: &InterruptTarget,
        interrupt_type: &InterruptType,
    ) -> Result<Option<Interrupt>, StoreError> {
        Ok(self
            .interrupts
            .read()
            .await
            .values()
            .find(|i| {
                i.state.is_in_flight()
                    && &i.target == target
                    && &i.interrupt_type == interrupt_type
            })
            .cloned())
    }
}
