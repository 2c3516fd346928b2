//! In-memory TimeoutStore.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use pipewright_core::store::{StoreError, TimeoutStore};
use pipewright_core::timeout::TimeoutInstance;

/// In-memory registry of active timeout instances.
#[derive(Default)]
pub struct InMemoryTimeoutStore {
    instances: RwLock<HashMap<String, TimeoutInstance>>,
}

impl InMemoryTimeoutStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    async fn add(&self, instance: &TimeoutInstance) -> Result<(), StoreError> {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn update(&self, instance: &TimeoutInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        if !instances.contains_key(&instance.id) {
            return Err(StoreError::NotFound(instance.id.clone()));
        }
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.instances.write().await.remove(id);
        Ok(())
    }

    async fn remove_for_node(&self, node_execution_id: &str) -> Result<usize, StoreError> {
        let mut instances = self.instances.write().await;
        let before = instances.len();
        instances.retain(|_, i| i.node_execution_id != node_execution_id);
        Ok(before - instances.len())
    }

    async fn for_node(&self, node_execution_id: &str) -> Result<Vec<TimeoutInstance>, StoreError> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.node_execution_id == node_execution_id)
            .cloned()
            .collect())
    }

    async fn active(&self) -> Result<Vec<TimeoutInstance>, StoreError> {
        Ok(self.instances.read().await.values().cloned().collect())
    }
}
