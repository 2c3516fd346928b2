//! Timeout monitor - background expiry sweep.
//!
//! The monitor never mutates node state itself. An expired tracker becomes a
//! MarkExpired interrupt routed through the interrupt subsystem; the plain
//! transition path and the interrupt path stay the only two writers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pipewright_core::interrupt::{InterruptConfig, InterruptTarget, InterruptType};
use pipewright_core::store::TimeoutStore;
use pipewright_core::timeout::{TimeoutTracker, TrackerState};

use crate::interrupts::{InterruptError, InterruptService};

/// Delete a node's trackers with a bounded retry. Cleanup failure is logged
/// and swallowed; a leaked instance is re-noticed by the scan and removed
/// there once its node is terminal.
pub(crate) async fn cleanup_for_node(
    timeouts: &dyn TimeoutStore,
    node_execution_id: &str,
    retries: u32,
    backoff: Duration,
) {
    let mut attempt = 0;
    loop {
        match timeouts.remove_for_node(node_execution_id).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::debug!(
                        node_execution_id = %node_execution_id,
                        removed,
                        "timeout trackers removed"
                    );
                }
                return;
            }
            Err(err) if attempt < retries => {
                attempt += 1;
                tracing::warn!(
                    node_execution_id = %node_execution_id,
                    attempt,
                    error = %err,
                    "timeout cleanup failed; retrying"
                );
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(err) => {
                tracing::error!(
                    node_execution_id = %node_execution_id,
                    error = %err,
                    "timeout cleanup abandoned"
                );
                return;
            }
        }
    }
}

/// Periodically sweeps registered trackers and raises MarkExpired interrupts
/// for the expired ones.
pub struct TimeoutMonitor {
    timeouts: Arc<dyn TimeoutStore>,
    interrupts: Arc<InterruptService>,
    scan_interval: Duration,
}

impl TimeoutMonitor {
    pub fn new(
        timeouts: Arc<dyn TimeoutStore>,
        interrupts: Arc<InterruptService>,
        scan_interval: Duration,
    ) -> Self {
        Self {
            timeouts,
            interrupts,
            scan_interval,
        }
    }

    /// Run the sweep loop until the token is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("timeout monitor stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.scan_once().await;
                    }
                }
            }
        })
    }

    /// One sweep over every registered tracker.
    pub async fn scan_once(&self) {
        let instances = match self.timeouts.active().await {
            Ok(instances) => instances,
            Err(err) => {
                tracing::error!(error = %err, "timeout scan failed to list trackers");
                return;
            }
        };

        let now = Utc::now();
        for instance in instances {
            if instance.tracker.state_at(now) != TrackerState::Expired {
                continue;
            }
            tracing::info!(
                timeout_id = %instance.id,
                node_execution_id = %instance.node_execution_id,
                "tracker expired; raising expiry interrupt"
            );
            match self
                .interrupts
                .register_and_process(
                    InterruptType::MarkExpired,
                    InterruptTarget::node(instance.node_execution_id.clone()),
                    InterruptConfig::with_reason("timeout exceeded"),
                )
                .await
            {
                Ok(_) => {}
                Err(InterruptError::Duplicate { .. }) => {
                    // Another sweep or caller got there first.
                    tracing::debug!(
                        node_execution_id = %instance.node_execution_id,
                        "expiry interrupt already in flight"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        node_execution_id = %instance.node_execution_id,
                        error = %err,
                        "expiry interrupt failed"
                    );
                    continue;
                }
            }
            // The expired tracker has done its job either way.
            if let Err(err) = self.timeouts.remove(&instance.id).await {
                tracing::warn!(timeout_id = %instance.id, error = %err, "expired tracker removal failed");
            }
        }
    }
}
