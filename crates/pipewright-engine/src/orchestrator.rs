//! Plan executor - runs a whole plan execution from the root node down.

use std::sync::Arc;

use chrono::Utc;

use pipewright_core::ambiance::Ambiance;
use pipewright_core::facilitator::FacilitatorRegistry;
use pipewright_core::node::NodeStatus;
use pipewright_core::plan::Plan;
use pipewright_stores::{EngineEvent, EventBus};

use crate::driver::NodeDriver;
use crate::error::EngineError;

/// How a plan execution ended.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan_execution_id: String,
    /// Effective status of the root node.
    pub status: NodeStatus,
}

impl PlanOutcome {
    pub fn is_successful(&self) -> bool {
        matches!(self.status, NodeStatus::Succeeded | NodeStatus::Skipped)
    }
}

/// Validates a plan and drives it to conclusion through the node driver.
pub struct PlanExecutor {
    plan: Arc<Plan>,
    driver: Arc<NodeDriver>,
    events: Arc<dyn EventBus>,
}

impl PlanExecutor {
    pub fn new(plan: Arc<Plan>, driver: Arc<NodeDriver>, events: Arc<dyn EventBus>) -> Self {
        Self {
            plan,
            driver,
            events,
        }
    }

    /// Configuration check before anything executes: every step type must
    /// resolve to a decisive facilitator.
    pub fn validate(&self, facilitators: &FacilitatorRegistry) -> Result<(), EngineError> {
        self.plan.validate(facilitators)?;
        Ok(())
    }

    /// Run the plan under the given execution id. Returns once the root node
    /// reached an effective conclusion.
    pub async fn execute(
        &self,
        plan_execution_id: impl Into<String>,
    ) -> Result<PlanOutcome, EngineError> {
        let plan_execution_id = plan_execution_id.into();
        let root_ambiance = Ambiance::new(plan_execution_id.clone(), self.plan.id.clone());
        tracing::info!(
            plan_execution_id = %plan_execution_id,
            plan_id = %self.plan.id,
            root = %self.plan.root,
            "plan execution starting"
        );

        let result = self
            .driver
            .run_node(&self.plan.root, root_ambiance, None)
            .await?;

        tracing::info!(
            plan_execution_id = %plan_execution_id,
            status = %result.status,
            "plan execution concluded"
        );
        if let Err(err) = self
            .events
            .publish(EngineEvent::PlanConcluded {
                plan_execution_id: plan_execution_id.clone(),
                status: result.status,
                at: Utc::now(),
            })
            .await
        {
            tracing::warn!(error = %err, "plan conclusion event delivery failed");
        }

        Ok(PlanOutcome {
            plan_execution_id,
            status: result.status,
        })
    }
}
