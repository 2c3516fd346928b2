//! Node driver - walks a plan node through its full lifecycle.
//!
//! One driver invocation owns one plan node: instantiate the execution
//! record, resolve the execution mode, run the step (or its children),
//! conclude the status, and consult the node's advisers when it breaks.
//! Retry creates a fresh instance and loops; the superseded instance stays
//! behind as Retried.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;

use pipewright_core::adviser::{AdviserRegistry, AdviserResponse, AdvisingEvent, RepairAction};
use pipewright_core::ambiance::{Ambiance, Level};
use pipewright_core::chain::ChainError;
use pipewright_core::dispatch::{TaskDispatcher, TaskResult};
use pipewright_core::facilitator::{ExecutionMode, FacilitatorRegistry};
use pipewright_core::node::{
    FailureInfo, FailureType, NodeExecution, NodeExecutionId, NodeStatus,
};
use pipewright_core::plan::{Plan, PlanError, PlanNode};
use pipewright_core::step::{StepHandler, StepOutcome, StepRegistry};
use pipewright_core::store::{NodeExecutionStore, TimeoutStore};
use pipewright_core::timeout::{AbsoluteTracker, ActiveTracker, TimeoutInstance, Tracker};

use crate::error::EngineError;
use crate::router::TaskResultRouter;
use crate::timeouts;
use crate::transitions::{TransitionOutcome, Transitioner};

/// Control-flow decision a finished node hands to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanControl {
    /// Proceed to the next sibling as planned.
    Continue,
    /// Stop the whole plan execution.
    EndPlan,
    /// Jump to the named sibling instead of the declared next one.
    NextStep(String),
}

/// Effective outcome of one plan node, as seen by its parent. `status` is
/// the outcome the parent acts on; an adviser may let the plan proceed as
/// successful past a stored Failed instance.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub status: NodeStatus,
    pub control: PlanControl,
    pub failure_info: Option<FailureInfo>,
}

impl NodeResult {
    fn concluded(status: NodeStatus, control: PlanControl, failure_info: Option<FailureInfo>) -> Self {
        Self {
            status,
            control,
            failure_info,
        }
    }

    /// Whether the parent should treat this node as having succeeded.
    pub fn is_successful(&self) -> bool {
        matches!(self.status, NodeStatus::Succeeded | NodeStatus::Skipped)
    }
}

/// Tunables the driver takes from configuration.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub max_parallel_children: usize,
    /// Interval for watching externally-driven status changes while waiting.
    pub poll_interval: Duration,
    pub cleanup_retries: u32,
    pub cleanup_backoff: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_parallel_children: 8,
            poll_interval: Duration::from_millis(50),
            cleanup_retries: 3,
            cleanup_backoff: Duration::from_millis(100),
        }
    }
}

enum InstanceOutcome {
    Done(NodeResult),
    /// A fresh retry instance supersedes the current one.
    Reattempt(NodeExecution),
    /// Re-run the step on the same instance (operator resumed it).
    Rerun(NodeExecution),
}

enum Body {
    Outcome {
        outcome: StepOutcome,
        control: PlanControl,
    },
    /// An interrupt or timeout took the node terminal mid-wait.
    Halted(NodeStatus),
}

enum Wait {
    Result(TaskResult),
    Halted(NodeStatus),
}

/// Drives plan nodes through the state machine.
pub struct NodeDriver {
    plan: Arc<Plan>,
    transitioner: Transitioner,
    steps: Arc<StepRegistry>,
    facilitators: Arc<FacilitatorRegistry>,
    advisers: Arc<AdviserRegistry>,
    dispatcher: Arc<dyn TaskDispatcher>,
    timeouts: Arc<dyn TimeoutStore>,
    router: Arc<TaskResultRouter>,
    settings: DriverSettings,
}

impl NodeDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan: Arc<Plan>,
        transitioner: Transitioner,
        steps: Arc<StepRegistry>,
        facilitators: Arc<FacilitatorRegistry>,
        advisers: Arc<AdviserRegistry>,
        dispatcher: Arc<dyn TaskDispatcher>,
        timeouts: Arc<dyn TimeoutStore>,
        router: Arc<TaskResultRouter>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            plan,
            transitioner,
            steps,
            facilitators,
            advisers,
            dispatcher,
            timeouts,
            router,
            settings,
        }
    }

    fn store(&self) -> Arc<dyn NodeExecutionStore> {
        self.transitioner.store()
    }

    /// Run one plan node (and, through its mode, its subtree) to an
    /// effective conclusion. Boxed for recursion into children.
    pub fn run_node<'a>(
        &'a self,
        plan_node_id: &'a str,
        parent_ambiance: Ambiance,
        parent_execution_id: Option<NodeExecutionId>,
    ) -> BoxFuture<'a, Result<NodeResult, EngineError>> {
        Box::pin(async move {
            let plan_node = self
                .plan
                .node(plan_node_id)
                .ok_or_else(|| EngineError::PlanNodeNotFound(plan_node_id.to_string()))?
                .clone();

            let ambiance =
                parent_ambiance.extend(Level::new(&plan_node.id, plan_node.group));
            let mut exec = NodeExecution::new(ambiance, plan_node.step_parameters.clone());
            if let Some(parent_id) = parent_execution_id {
                exec = exec.with_parent(parent_id);
            }
            self.store().save(&exec).await?;
            tracing::info!(
                plan_node = %plan_node.id,
                node_execution_id = %exec.id,
                group = ?plan_node.group,
                "node queued"
            );

            let mut fresh = true;
            loop {
                match self.drive_instance(&plan_node, exec, fresh).await? {
                    InstanceOutcome::Done(result) => {
                        tracing::info!(
                            plan_node = %plan_node.id,
                            status = %result.status,
                            "node concluded"
                        );
                        return Ok(result);
                    }
                    InstanceOutcome::Reattempt(next) => {
                        tracing::info!(
                            plan_node = %plan_node.id,
                            node_execution_id = %next.id,
                            retry_index = next.retry_index(),
                            "retry instance queued"
                        );
                        exec = next;
                        fresh = true;
                    }
                    InstanceOutcome::Rerun(same) => {
                        exec = same;
                        fresh = false;
                    }
                }
            }
        })
    }

    /// One pass over one NodeExecution instance.
    async fn drive_instance(
        &self,
        plan_node: &PlanNode,
        exec: NodeExecution,
        fresh: bool,
    ) -> Result<InstanceOutcome, EngineError> {
        if fresh {
            self.register_deadline(plan_node, &exec).await?;
        }

        let response = self
            .facilitators
            .facilitate(
                &plan_node.step_type,
                &exec.ambiance,
                &plan_node.step_parameters,
            )
            .ok_or_else(|| {
                EngineError::Plan(PlanError::NoDecisiveFacilitator {
                    node: plan_node.id.clone(),
                    step_type: plan_node.step_type.clone(),
                })
            })?;
        if let Some(wait) = response.initial_wait {
            tokio::time::sleep(wait).await;
        }

        if let Some(terminal) = self.to_running(&exec.id).await? {
            return self.settle_halted(plan_node, &exec, terminal).await;
        }

        let body = self.execute_body(plan_node, &exec, response.mode).await?;
        match body {
            Body::Halted(status) => self.settle_halted(plan_node, &exec, status).await,
            Body::Outcome { outcome, control } => {
                self.settle(plan_node, &exec, outcome, control).await
            }
        }
    }

    /// Conclude an instance that an interrupt or timeout forced out
    /// mid-flight. Broke statuses still get the adviser scan, so a retry or
    /// intervention adviser can act on an expiry.
    async fn settle_halted(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
        status: NodeStatus,
    ) -> Result<InstanceOutcome, EngineError> {
        self.cleanup(&exec.id).await;
        if !status.is_broken() {
            return Ok(InstanceOutcome::Done(NodeResult::concluded(
                status,
                PlanControl::Continue,
                None,
            )));
        }
        let failure = self
            .load(&exec.id)
            .await?
            .failure_info
            .unwrap_or_else(|| halted_failure(status));
        self.advise(plan_node, exec, status, failure, PlanControl::Continue)
            .await
    }

    async fn register_deadline(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
    ) -> Result<(), EngineError> {
        let Some(spec) = &plan_node.timeout else {
            return Ok(());
        };
        let tracker = if spec.pausable {
            Tracker::Active(ActiveTracker::starting_now(spec.duration))
        } else {
            Tracker::Absolute(AbsoluteTracker::starting_now(spec.duration))
        };
        let instance = TimeoutInstance::new(exec.id.clone(), tracker);
        self.timeouts.add(&instance).await?;
        self.store().append_timeout_id(&exec.id, instance.id).await?;
        Ok(())
    }

    /// Execute the step (or children) according to the facilitated mode.
    async fn execute_body(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
        mode: ExecutionMode,
    ) -> Result<Body, EngineError> {
        match mode {
            ExecutionMode::Sync => self.run_sync(plan_node, exec).await,
            ExecutionMode::Async => self.run_async(plan_node, exec).await,
            ExecutionMode::Task => self.run_task(plan_node, exec).await,
            ExecutionMode::TaskChain => self.run_chain(plan_node, exec).await,
            ExecutionMode::Child => self.run_children_sequential(plan_node, exec).await,
            ExecutionMode::Children => self.run_children_parallel(plan_node, exec).await,
        }
    }

    async fn run_sync(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
    ) -> Result<Body, EngineError> {
        let Some(StepHandler::Unit(step)) = self.steps.get(&plan_node.step_type) else {
            return Err(EngineError::MissingHandler {
                step_type: plan_node.step_type.clone(),
                mode: ExecutionMode::Sync,
            });
        };
        let outcome = step
            .execute(&exec.ambiance, &plan_node.step_parameters)
            .await;
        Ok(Body::Outcome {
            outcome,
            control: PlanControl::Continue,
        })
    }

    async fn run_async(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
    ) -> Result<Body, EngineError> {
        let Some(StepHandler::Unit(step)) = self.steps.get(&plan_node.step_type) else {
            return Err(EngineError::MissingHandler {
                step_type: plan_node.step_type.clone(),
                mode: ExecutionMode::Async,
            });
        };
        match self
            .transitioner
            .transition(&exec.id, NodeStatus::AsyncWaiting, |s| {
                s == NodeStatus::Running
            })
            .await?
        {
            TransitionOutcome::Applied { .. } => {}
            TransitionOutcome::AlreadyTerminal(s) => return Ok(Body::Halted(s)),
            TransitionOutcome::NotApplicable(s) => return Ok(Body::Halted(s)),
        }

        let ambiance = exec.ambiance.clone();
        let parameters = plan_node.step_parameters.clone();
        let handle = tokio::spawn(async move { step.execute(&ambiance, &parameters).await });
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(err) => StepOutcome::failure(FailureInfo::application(format!(
                "spawned step aborted: {err}"
            ))),
        };
        Ok(Body::Outcome {
            outcome,
            control: PlanControl::Continue,
        })
    }

    async fn run_task(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
    ) -> Result<Body, EngineError> {
        let Some(StepHandler::Task(step)) = self.steps.get(&plan_node.step_type) else {
            return Err(EngineError::MissingHandler {
                step_type: plan_node.step_type.clone(),
                mode: ExecutionMode::Task,
            });
        };
        let descriptor = match step
            .obtain_task(&exec.ambiance, &plan_node.step_parameters)
            .await
        {
            Ok(descriptor) => descriptor,
            Err(failure) => {
                return Ok(Body::Outcome {
                    outcome: StepOutcome::failure(failure),
                    control: PlanControl::Continue,
                })
            }
        };

        let task_id = match self.dispatcher.dispatch(descriptor).await {
            Ok(task_id) => task_id,
            Err(err) => {
                return Ok(Body::Outcome {
                    outcome: StepOutcome::failure(FailureInfo::new(
                        format!("task dispatch failed: {err}"),
                        vec![FailureType::Connectivity],
                    )),
                    control: PlanControl::Continue,
                })
            }
        };
        let rx = self.router.expect(task_id.clone()).await;

        match self
            .transitioner
            .transition(&exec.id, NodeStatus::TaskWaiting, |s| {
                s == NodeStatus::Running
            })
            .await?
        {
            TransitionOutcome::Applied { .. } => {}
            TransitionOutcome::AlreadyTerminal(s) | TransitionOutcome::NotApplicable(s) => {
                self.router.forget(&task_id).await;
                return Ok(Body::Halted(s));
            }
        }

        match self.await_task(&exec.id, &task_id, rx).await? {
            Wait::Halted(status) => Ok(Body::Halted(status)),
            Wait::Result(result) => {
                if let Some(terminal) = self.to_running(&exec.id).await? {
                    return Ok(Body::Halted(terminal));
                }
                let outcome = step
                    .handle_task_result(&exec.ambiance, &plan_node.step_parameters, result)
                    .await;
                Ok(Body::Outcome {
                    outcome,
                    control: PlanControl::Continue,
                })
            }
        }
    }

    async fn run_chain(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
    ) -> Result<Body, EngineError> {
        let Some(StepHandler::Chain(step)) = self.steps.get(&plan_node.step_type) else {
            return Err(EngineError::MissingHandler {
                step_type: plan_node.step_type.clone(),
                mode: ExecutionMode::TaskChain,
            });
        };
        let parameters = &plan_node.step_parameters;
        let mut response = step.start_chain_link(&exec.ambiance, parameters).await?;
        let mut last_result: Option<TaskResult> = None;

        loop {
            let (chain_end, task, pass_through) = response.into_parts();
            if chain_end {
                let outcome = step
                    .finalize_execution(&exec.ambiance, parameters, pass_through, last_result)
                    .await?;
                return Ok(Body::Outcome {
                    outcome,
                    control: PlanControl::Continue,
                });
            }
            // Guaranteed by TaskChainResponse construction.
            let descriptor = task.ok_or(ChainError::MissingTask)?;

            let task_id = match self.dispatcher.dispatch(descriptor).await {
                Ok(task_id) => task_id,
                Err(err) => {
                    return Ok(Body::Outcome {
                        outcome: StepOutcome::failure(FailureInfo::new(
                            format!("chain task dispatch failed: {err}"),
                            vec![FailureType::Connectivity],
                        )),
                        control: PlanControl::Continue,
                    })
                }
            };
            let rx = self.router.expect(task_id.clone()).await;

            match self
                .transitioner
                .transition(&exec.id, NodeStatus::TaskWaiting, |s| {
                    s == NodeStatus::Running
                })
                .await?
            {
                TransitionOutcome::Applied { .. } => {}
                TransitionOutcome::AlreadyTerminal(s) | TransitionOutcome::NotApplicable(s) => {
                    self.router.forget(&task_id).await;
                    return Ok(Body::Halted(s));
                }
            }

            match self.await_task(&exec.id, &task_id, rx).await? {
                Wait::Halted(status) => return Ok(Body::Halted(status)),
                Wait::Result(result) => {
                    if let Some(terminal) = self.to_running(&exec.id).await? {
                        return Ok(Body::Halted(terminal));
                    }
                    response = step
                        .execute_next_link(
                            &exec.ambiance,
                            parameters,
                            pass_through,
                            result.clone(),
                        )
                        .await?;
                    last_result = Some(result);
                }
            }
        }
    }

    async fn run_children_sequential(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
    ) -> Result<Body, EngineError> {
        let mut index = 0;
        while index < plan_node.children.len() {
            let child_id = plan_node.children[index].clone();
            let result = self
                .run_node(&child_id, exec.ambiance.clone(), Some(exec.id.clone()))
                .await?;

            match result.control {
                PlanControl::EndPlan => {
                    return Ok(Body::Outcome {
                        outcome: child_outcome(&child_id, &result),
                        control: PlanControl::EndPlan,
                    });
                }
                PlanControl::NextStep(ref target) => {
                    match plan_node.children.iter().position(|c| c == target) {
                        Some(position) => {
                            tracing::info!(from = %child_id, to = %target, "jumping to sibling");
                            index = position;
                            continue;
                        }
                        None => {
                            // Not our child; let an ancestor resolve it.
                            return Ok(Body::Outcome {
                                outcome: child_outcome(&child_id, &result),
                                control: PlanControl::NextStep(target.clone()),
                            });
                        }
                    }
                }
                PlanControl::Continue => {}
            }

            if !result.is_successful() {
                return Ok(Body::Outcome {
                    outcome: child_outcome(&child_id, &result),
                    control: PlanControl::Continue,
                });
            }
            index += 1;
        }
        Ok(Body::Outcome {
            outcome: StepOutcome::success(Value::Null),
            control: PlanControl::Continue,
        })
    }

    async fn run_children_parallel(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
    ) -> Result<Body, EngineError> {
        let results: Vec<(String, Result<NodeResult, EngineError>)> =
            stream::iter(plan_node.children.clone())
                .map(|child_id| {
                    let ambiance = exec.ambiance.clone();
                    let parent_id = exec.id.clone();
                    async move {
                        let result = self.run_node(&child_id, ambiance, Some(parent_id)).await;
                        (child_id, result)
                    }
                })
                .buffer_unordered(self.settings.max_parallel_children.max(1))
                .collect()
                .await;

        let mut end_plan = false;
        let mut first_failure: Option<StepOutcome> = None;
        for (child_id, result) in results {
            let result = result?;
            match result.control {
                PlanControl::EndPlan => end_plan = true,
                PlanControl::NextStep(ref target) => {
                    tracing::warn!(
                        from = %child_id,
                        to = %target,
                        "sibling jump ignored among parallel children"
                    );
                }
                PlanControl::Continue => {}
            }
            if !result.is_successful() && first_failure.is_none() {
                first_failure = Some(child_outcome(&child_id, &result));
            }
        }

        let control = if end_plan {
            PlanControl::EndPlan
        } else {
            PlanControl::Continue
        };
        Ok(Body::Outcome {
            outcome: first_failure.unwrap_or_else(|| StepOutcome::success(Value::Null)),
            control,
        })
    }

    /// Conclude the instance from a step outcome, consulting advisers on
    /// failure.
    async fn settle(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
        outcome: StepOutcome,
        control: PlanControl,
    ) -> Result<InstanceOutcome, EngineError> {
        match outcome {
            StepOutcome::Success { .. } => {
                let status = self
                    .conclude(&exec.id, NodeStatus::Succeeded)
                    .await?
                    .unwrap_or(NodeStatus::Succeeded);
                self.cleanup(&exec.id).await;
                Ok(InstanceOutcome::Done(NodeResult::concluded(
                    status, control, None,
                )))
            }
            StepOutcome::Failure { failure } => {
                self.settle_failure(plan_node, exec, failure, control).await
            }
        }
    }

    async fn settle_failure(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
        failure: FailureInfo,
        control: PlanControl,
    ) -> Result<InstanceOutcome, EngineError> {
        // The failure detail must be readable before the status flips.
        // Field-scoped write: a concurrent interrupt's transition and audit
        // entry survive it.
        self.store()
            .record_failure_info(&exec.id, failure.clone())
            .await?;

        if let Some(terminal) = self.conclude(&exec.id, NodeStatus::Failed).await? {
            // Pre-empted by an interrupt or expiry; that status is the one
            // the advisers get to see.
            if terminal.is_broken() {
                return self.advise(plan_node, exec, terminal, failure, control).await;
            }
            self.cleanup(&exec.id).await;
            return Ok(InstanceOutcome::Done(NodeResult::concluded(
                terminal,
                control,
                Some(failure),
            )));
        }
        tracing::warn!(
            plan_node = %plan_node.id,
            node_execution_id = %exec.id,
            reason = %failure.message,
            "node failed"
        );
        self.advise(plan_node, exec, NodeStatus::Failed, failure, control)
            .await
    }

    /// Run the adviser scan for an instance that reached `broke` and apply
    /// the decision.
    async fn advise(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
        broke: NodeStatus,
        failure: FailureInfo,
        control: PlanControl,
    ) -> Result<InstanceOutcome, EngineError> {
        let event = AdvisingEvent {
            ambiance: exec.ambiance.clone(),
            from_status: NodeStatus::Running,
            to_status: broke,
            failure_info: Some(failure.clone()),
            adviser_parameters: Value::Null,
            retry_index: exec.retry_index(),
        };
        let response = self.advisers.advise(&event, &plan_node.advisers);

        if let Some(resolved) = &response {
            if let Ok(raw) = serde_json::to_value(resolved) {
                self.store().record_resolved_advice(&exec.id, raw).await?;
            }
        }
        tracing::info!(
            plan_node = %plan_node.id,
            node_execution_id = %exec.id,
            advice = ?response,
            "adviser decision"
        );

        match response {
            None | Some(AdviserResponse::Ignore) | Some(AdviserResponse::ProceedWithFailure) => {
                self.cleanup(&exec.id).await;
                Ok(InstanceOutcome::Done(NodeResult::concluded(
                    broke,
                    control,
                    Some(failure),
                )))
            }
            Some(AdviserResponse::ProceedWithSuccess) | Some(AdviserResponse::MarkSuccess) => {
                self.cleanup(&exec.id).await;
                Ok(InstanceOutcome::Done(NodeResult::concluded(
                    NodeStatus::Succeeded,
                    control,
                    None,
                )))
            }
            Some(AdviserResponse::ProceedWithDefault { .. }) => {
                self.cleanup(&exec.id).await;
                Ok(InstanceOutcome::Done(NodeResult::concluded(
                    NodeStatus::Succeeded,
                    control,
                    None,
                )))
            }
            Some(AdviserResponse::EndPlan) => {
                self.cleanup(&exec.id).await;
                Ok(InstanceOutcome::Done(NodeResult::concluded(
                    broke,
                    PlanControl::EndPlan,
                    Some(failure),
                )))
            }
            Some(AdviserResponse::NextStep { next_node_id }) => {
                self.cleanup(&exec.id).await;
                Ok(InstanceOutcome::Done(NodeResult::concluded(
                    broke,
                    PlanControl::NextStep(next_node_id),
                    Some(failure),
                )))
            }
            Some(AdviserResponse::Retry { wait }) => {
                if !NodeStatus::can_transition(broke, NodeStatus::Retried) {
                    // Aborted has no retry edge; the interrupt's verdict
                    // stands.
                    self.cleanup(&exec.id).await;
                    return Ok(InstanceOutcome::Done(NodeResult::concluded(
                        broke,
                        control,
                        Some(failure),
                    )));
                }
                if let Some(wait) = wait {
                    tokio::time::sleep(wait).await;
                }
                match self
                    .transitioner
                    .adviser_transition(&exec.id, broke, NodeStatus::Retried)
                    .await?
                {
                    TransitionOutcome::Applied { .. } => {
                        self.cleanup(&exec.id).await;
                        let next = exec.instantiate_retry();
                        self.store().save(&next).await?;
                        Ok(InstanceOutcome::Reattempt(next))
                    }
                    TransitionOutcome::AlreadyTerminal(s)
                    | TransitionOutcome::NotApplicable(s) => {
                        // An interrupt already moved the node; honor it.
                        self.cleanup(&exec.id).await;
                        Ok(InstanceOutcome::Done(NodeResult::concluded(
                            s,
                            control,
                            Some(failure),
                        )))
                    }
                }
            }
            Some(AdviserResponse::ManualIntervention {
                timeout,
                on_timeout,
            }) => {
                if !NodeStatus::can_transition(broke, NodeStatus::InterventionWaiting) {
                    self.cleanup(&exec.id).await;
                    return Ok(InstanceOutcome::Done(NodeResult::concluded(
                        broke,
                        control,
                        Some(failure),
                    )));
                }
                self.intervene(plan_node, exec, broke, failure, timeout, on_timeout, control)
                    .await
            }
        }
    }

    /// Park the node for a human, auto-repairing after the window expires.
    #[allow(clippy::too_many_arguments)]
    async fn intervene(
        &self,
        plan_node: &PlanNode,
        exec: &NodeExecution,
        broke: NodeStatus,
        failure: FailureInfo,
        window: Duration,
        on_timeout: RepairAction,
        control: PlanControl,
    ) -> Result<InstanceOutcome, EngineError> {
        match self
            .transitioner
            .adviser_transition(&exec.id, broke, NodeStatus::InterventionWaiting)
            .await?
        {
            TransitionOutcome::Applied { .. } => {}
            TransitionOutcome::AlreadyTerminal(s) | TransitionOutcome::NotApplicable(s) => {
                self.cleanup(&exec.id).await;
                return Ok(InstanceOutcome::Done(NodeResult::concluded(
                    s,
                    control,
                    Some(failure),
                )));
            }
        }
        tracing::warn!(
            plan_node = %plan_node.id,
            node_execution_id = %exec.id,
            window_secs = window.as_secs(),
            "waiting for manual intervention"
        );

        let deadline = tokio::time::Instant::now() + window;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return self.repair(exec, failure, on_timeout, control).await;
            }
            tokio::time::sleep(self.settings.poll_interval.min(window)).await;

            let status = self.load(&exec.id).await?.status;
            match status {
                NodeStatus::InterventionWaiting => {}
                NodeStatus::Retried => {
                    // A retry interrupt created the successor instance.
                    let next = self.find_retry_successor(exec).await?;
                    self.cleanup(&exec.id).await;
                    return Ok(InstanceOutcome::Reattempt(next));
                }
                NodeStatus::Running | NodeStatus::Queued => {
                    // Operator resumed the instance itself.
                    let doc = self.load(&exec.id).await?;
                    return Ok(InstanceOutcome::Rerun(doc));
                }
                s if s.is_terminal() => {
                    self.cleanup(&exec.id).await;
                    let failure_info =
                        (s != NodeStatus::Succeeded).then(|| failure.clone());
                    return Ok(InstanceOutcome::Done(NodeResult::concluded(
                        s,
                        control,
                        failure_info,
                    )));
                }
                _ => {}
            }
        }
    }

    /// Apply the configured repair action after an intervention window
    /// expired with no human response.
    async fn repair(
        &self,
        exec: &NodeExecution,
        failure: FailureInfo,
        action: RepairAction,
        control: PlanControl,
    ) -> Result<InstanceOutcome, EngineError> {
        tracing::warn!(
            node_execution_id = %exec.id,
            action = ?action,
            "intervention window expired; applying repair action"
        );
        let waiting = |s: NodeStatus| s == NodeStatus::InterventionWaiting;
        let (target, result_failure) = match action {
            RepairAction::Abort => (NodeStatus::Aborted, Some(failure.clone())),
            RepairAction::MarkFailed | RepairAction::Ignore => {
                (NodeStatus::Failed, Some(failure.clone()))
            }
            RepairAction::MarkSuccess => (NodeStatus::Succeeded, None),
            RepairAction::Retry => {
                return match self
                    .transitioner
                    .transition(&exec.id, NodeStatus::Retried, waiting)
                    .await?
                {
                    TransitionOutcome::Applied { .. } => {
                        self.cleanup(&exec.id).await;
                        let next = exec.instantiate_retry();
                        self.store().save(&next).await?;
                        Ok(InstanceOutcome::Reattempt(next))
                    }
                    TransitionOutcome::AlreadyTerminal(s)
                    | TransitionOutcome::NotApplicable(s) => {
                        self.cleanup(&exec.id).await;
                        Ok(InstanceOutcome::Done(NodeResult::concluded(
                            s,
                            control,
                            Some(failure),
                        )))
                    }
                };
            }
        };

        let status = match self
            .transitioner
            .transition(&exec.id, target, waiting)
            .await?
        {
            TransitionOutcome::Applied { .. } => target,
            TransitionOutcome::AlreadyTerminal(s) | TransitionOutcome::NotApplicable(s) => s,
        };
        self.cleanup(&exec.id).await;
        Ok(InstanceOutcome::Done(NodeResult::concluded(
            status,
            control,
            result_failure,
        )))
    }

    /// Drive the node to Running, riding out pause windows. `Some(status)`
    /// means the node went terminal instead.
    async fn to_running(&self, id: &NodeExecutionId) -> Result<Option<NodeStatus>, EngineError> {
        loop {
            let outcome = self
                .transitioner
                .transition(id, NodeStatus::Running, |s| {
                    !matches!(s, NodeStatus::Pausing | NodeStatus::Paused)
                        && NodeStatus::can_transition(s, NodeStatus::Running)
                })
                .await?;
            match outcome {
                TransitionOutcome::Applied { .. } => return Ok(None),
                TransitionOutcome::AlreadyTerminal(s) => return Ok(Some(s)),
                TransitionOutcome::NotApplicable(NodeStatus::Running) => return Ok(None),
                TransitionOutcome::NotApplicable(NodeStatus::Pausing) => {
                    // Safe point: complete the pause, then wait for resume.
                    self.transitioner
                        .transition(id, NodeStatus::Paused, |s| s == NodeStatus::Pausing)
                        .await?;
                }
                TransitionOutcome::NotApplicable(_) => {
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }

    /// Conclude the node at `target` from whatever live status it holds,
    /// waiting out pause windows first.
    async fn conclude(
        &self,
        id: &NodeExecutionId,
        target: NodeStatus,
    ) -> Result<Option<NodeStatus>, EngineError> {
        loop {
            let outcome = self
                .transitioner
                .transition(id, target, |s| NodeStatus::can_transition(s, target))
                .await?;
            match outcome {
                TransitionOutcome::Applied { .. } => return Ok(None),
                TransitionOutcome::AlreadyTerminal(s) => return Ok(Some(s)),
                TransitionOutcome::NotApplicable(s) if s == target => return Ok(None),
                TransitionOutcome::NotApplicable(_) => {
                    if let Some(terminal) = self.to_running(id).await? {
                        return Ok(Some(terminal));
                    }
                }
            }
        }
    }

    /// Wait for a dispatched task's result while watching for the node being
    /// forced out externally.
    async fn await_task(
        &self,
        id: &NodeExecutionId,
        task_id: &str,
        mut rx: tokio::sync::oneshot::Receiver<TaskResult>,
    ) -> Result<Wait, EngineError> {
        loop {
            tokio::select! {
                received = &mut rx => {
                    return match received {
                        Ok(result) => Ok(Wait::Result(result)),
                        Err(_) => Ok(Wait::Halted(self.load(id).await?.status)),
                    };
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {
                    let status = self.load(id).await?.status;
                    if status.is_terminal() {
                        self.router.forget(task_id).await;
                        if let Err(err) = self.dispatcher.cancel(&task_id.to_string()).await {
                            tracing::warn!(task_id, error = %err, "task cancel failed");
                        }
                        return Ok(Wait::Halted(status));
                    }
                    if status == NodeStatus::Pausing {
                        self.transitioner
                            .transition(id, NodeStatus::Paused, |s| s == NodeStatus::Pausing)
                            .await?;
                    }
                }
            }
        }
    }

    /// The instance an external retry interrupt created to supersede `exec`.
    async fn find_retry_successor(
        &self,
        exec: &NodeExecution,
    ) -> Result<NodeExecution, EngineError> {
        let live = self
            .store()
            .live_for_plan(&exec.ambiance.plan_execution_id)
            .await?;
        if let Some(next) = live
            .into_iter()
            .find(|n| n.previous_execution_id.as_deref() == Some(exec.id.as_str()))
        {
            return Ok(next);
        }
        // The successor vanished (raced with an abort); recreate it.
        let next = exec.instantiate_retry();
        self.store().save(&next).await?;
        Ok(next)
    }

    async fn load(&self, id: &NodeExecutionId) -> Result<NodeExecution, EngineError> {
        self.store()
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NodeNotFound(id.clone()))
    }

    async fn cleanup(&self, id: &NodeExecutionId) {
        timeouts::cleanup_for_node(
            self.timeouts.as_ref(),
            id,
            self.settings.cleanup_retries,
            self.settings.cleanup_backoff,
        )
        .await;
    }
}

/// Failure detail for a node forced out without a step-reported failure.
fn halted_failure(status: NodeStatus) -> FailureInfo {
    match status {
        NodeStatus::Expired => {
            FailureInfo::new("node timed out", vec![FailureType::Timeout])
        }
        NodeStatus::Aborted => FailureInfo::new("node aborted", vec![FailureType::Unknown]),
        other => FailureInfo::new(format!("node ended {other}"), vec![FailureType::Unknown]),
    }
}

fn child_outcome(child_id: &str, result: &NodeResult) -> StepOutcome {
    if result.is_successful() {
        return StepOutcome::success(Value::Null);
    }
    let failure = result.failure_info.clone().unwrap_or_else(|| {
        FailureInfo::new(
            format!("child '{child_id}' ended {}", result.status),
            vec![FailureType::Application],
        )
    });
    StepOutcome::failure(failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use pipewright_core::adviser::{Adviser, AdviserSpec, AdviserType};
    use pipewright_core::ambiance::NodeGroup;
    use pipewright_core::dispatch::{DispatchError, TaskDescriptor, TaskId};
    use pipewright_core::facilitator::FixedModeFacilitator;
    use pipewright_core::plan::PlanNode;
    use pipewright_core::step::{SyncExecutable, TaskExecutable};
    use pipewright_stores::{
        BroadcastEventBus, EngineEvent, EventBus, InMemoryNodeExecutionStore,
        InMemoryTimeoutStore,
    };

    struct Harness {
        driver: Arc<NodeDriver>,
        nodes: Arc<dyn NodeExecutionStore>,
        events: Arc<dyn EventBus>,
    }

    fn harness(
        plan: Plan,
        steps: StepRegistry,
        facilitators: FacilitatorRegistry,
        advisers: AdviserRegistry,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> Harness {
        let nodes: Arc<dyn NodeExecutionStore> = Arc::new(InMemoryNodeExecutionStore::new());
        let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(256));
        let timeouts: Arc<dyn TimeoutStore> = Arc::new(InMemoryTimeoutStore::new());
        let transitioner = Transitioner::new(nodes.clone(), events.clone(), 3);
        let settings = DriverSettings {
            poll_interval: Duration::from_millis(10),
            ..DriverSettings::default()
        };
        let driver = Arc::new(NodeDriver::new(
            Arc::new(plan),
            transitioner,
            Arc::new(steps),
            Arc::new(facilitators),
            Arc::new(advisers),
            dispatcher,
            timeouts,
            Arc::new(TaskResultRouter::new()),
            settings,
        ));
        Harness {
            driver,
            nodes,
            events,
        }
    }

    fn root_ambiance() -> Ambiance {
        Ambiance::new("exec-1", "plan-1")
    }

    fn drain(
        rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    struct OkStep;

    #[async_trait]
    impl SyncExecutable for OkStep {
        async fn execute(&self, _ambiance: &Ambiance, params: &Value) -> StepOutcome {
            StepOutcome::success(params.clone())
        }
    }

    struct FlakyStep;

    #[async_trait]
    impl SyncExecutable for FlakyStep {
        async fn execute(&self, _ambiance: &Ambiance, _params: &Value) -> StepOutcome {
            StepOutcome::failure(FailureInfo::new(
                "connection reset by peer",
                vec![FailureType::Connectivity],
            ))
        }
    }

    struct RemoteStep;

    #[async_trait]
    impl TaskExecutable for RemoteStep {
        async fn obtain_task(
            &self,
            _ambiance: &Ambiance,
            params: &Value,
        ) -> Result<TaskDescriptor, FailureInfo> {
            Ok(TaskDescriptor::new("shell", params.clone()))
        }

        async fn handle_task_result(
            &self,
            _ambiance: &Ambiance,
            _params: &Value,
            result: TaskResult,
        ) -> StepOutcome {
            if result.success {
                StepOutcome::success(result.data)
            } else {
                StepOutcome::failure(FailureInfo::application("remote task failed"))
            }
        }
    }

    /// Dispatcher that echoes a successful result back through the router.
    struct EchoDispatcher {
        router: Arc<TaskResultRouter>,
        counter: AtomicU64,
    }

    impl EchoDispatcher {
        fn new(router: Arc<TaskResultRouter>) -> Self {
            Self {
                router,
                counter: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl TaskDispatcher for EchoDispatcher {
        async fn dispatch(&self, descriptor: TaskDescriptor) -> Result<TaskId, DispatchError> {
            let task_id = format!("task-{}", self.counter.fetch_add(1, Ordering::SeqCst));
            let router = self.router.clone();
            let result = TaskResult::succeeded(task_id.clone(), descriptor.parameters);
            tokio::spawn(async move {
                // The waiter may not have parked its mailbox yet.
                while !router.deliver(result.clone()).await {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
            Ok(task_id)
        }

        async fn cancel(&self, _task_id: &TaskId) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    /// Dispatcher whose tasks never report back.
    struct SilentDispatcher;

    #[async_trait]
    impl TaskDispatcher for SilentDispatcher {
        async fn dispatch(&self, _descriptor: TaskDescriptor) -> Result<TaskId, DispatchError> {
            Ok("task-silent".to_string())
        }

        async fn cancel(&self, _task_id: &TaskId) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    struct NullDispatcher;

    #[async_trait]
    impl TaskDispatcher for NullDispatcher {
        async fn dispatch(&self, descriptor: TaskDescriptor) -> Result<TaskId, DispatchError> {
            Err(DispatchError::NoExecutor(descriptor.task_type))
        }

        async fn cancel(&self, _task_id: &TaskId) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn tree_plan(step_advisers: Vec<AdviserSpec>, step_type: &str) -> Plan {
        Plan::new(
            "plan-1",
            "pipeline-1",
            vec![
                PlanNode::new("pipeline-1", "Pipeline", NodeGroup::Pipeline, "container")
                    .with_children(vec!["stage-1".into()]),
                PlanNode::new("stage-1", "Stage", NodeGroup::Stage, "container")
                    .with_children(vec!["step-1".into()]),
                PlanNode::new("step-1", "Step", NodeGroup::Step, step_type)
                    .with_parameters(json!({"cmd": "make"}))
                    .with_advisers(step_advisers),
            ],
        )
        .unwrap()
    }

    fn container_facilitators(leaf_type: &str, leaf_mode: ExecutionMode) -> FacilitatorRegistry {
        let mut registry = FacilitatorRegistry::new();
        registry.register(
            "container",
            Arc::new(FixedModeFacilitator::new(ExecutionMode::Child)),
        );
        registry.register(leaf_type, Arc::new(FixedModeFacilitator::new(leaf_mode)));
        registry
    }

    #[test]
    fn test_sync_tree_succeeds_top_to_bottom() {
        tokio_test::block_on(async {
            let mut steps = StepRegistry::new();
            steps.register_unit("echo", Arc::new(OkStep));
            let hx = harness(
                tree_plan(vec![], "echo"),
                steps,
                container_facilitators("echo", ExecutionMode::Sync),
                AdviserRegistry::with_standard_advisers(),
                Arc::new(NullDispatcher),
            );
            let mut rx = hx.events.subscribe();

            let result = hx
                .driver
                .run_node("pipeline-1", root_ambiance(), None)
                .await
                .unwrap();

            assert_eq!(result.status, NodeStatus::Succeeded);
            assert_eq!(result.control, PlanControl::Continue);

            let succeeded: Vec<String> = drain(&mut rx)
                .into_iter()
                .filter_map(|event| match event {
                    EngineEvent::NodeStatusChanged {
                        ambiance,
                        to: NodeStatus::Succeeded,
                        ..
                    } => ambiance.current_level().map(|l| l.setup_id.clone()),
                    _ => None,
                })
                .collect();
            assert!(succeeded.contains(&"step-1".to_string()));
            assert!(succeeded.contains(&"stage-1".to_string()));
            assert!(succeeded.contains(&"pipeline-1".to_string()));
        });
    }

    #[test]
    fn test_retry_exhaustion_escalates_to_intervention() {
        tokio_test::block_on(async {
            let mut steps = StepRegistry::new();
            steps.register_unit("flaky", Arc::new(FlakyStep));
            let advisers = vec![
                AdviserSpec::new(AdviserType::Retry, json!({"max_attempts": 2})),
                AdviserSpec::new(
                    AdviserType::ManualIntervention,
                    json!({
                        "applicable_failure_types": ["connectivity"],
                        "timeout_secs": 1,
                        "on_timeout": "mark_failed"
                    }),
                ),
            ];
            let hx = harness(
                tree_plan(advisers, "flaky"),
                steps,
                container_facilitators("flaky", ExecutionMode::Sync),
                AdviserRegistry::with_standard_advisers(),
                Arc::new(NullDispatcher),
            );
            let mut rx = hx.events.subscribe();

            let result = hx
                .driver
                .run_node("step-1", root_ambiance(), None)
                .await
                .unwrap();

            // Window expired unattended; the configured repair marked it
            // failed.
            assert_eq!(result.status, NodeStatus::Failed);

            let events = drain(&mut rx);
            let retried = events
                .iter()
                .filter(|event| {
                    matches!(
                        event,
                        EngineEvent::NodeStatusChanged {
                            to: NodeStatus::Retried,
                            ..
                        }
                    )
                })
                .count();
            assert_eq!(retried, 2);
            assert!(events.iter().any(|event| matches!(
                event,
                EngineEvent::NodeStatusChanged {
                    to: NodeStatus::InterventionWaiting,
                    ..
                }
            )));
        });
    }

    #[test]
    fn test_untagged_failure_skips_connectivity_scoped_intervention() {
        tokio_test::block_on(async {
            struct AppFailStep;

            #[async_trait]
            impl SyncExecutable for AppFailStep {
                async fn execute(&self, _ambiance: &Ambiance, _params: &Value) -> StepOutcome {
                    StepOutcome::failure(FailureInfo::application("assertion failed"))
                }
            }

            let mut steps = StepRegistry::new();
            steps.register_unit("flaky", Arc::new(AppFailStep));
            let advisers = vec![AdviserSpec::new(
                AdviserType::ManualIntervention,
                json!({"applicable_failure_types": ["connectivity"], "timeout_secs": 1}),
            )];
            let hx = harness(
                tree_plan(advisers, "flaky"),
                steps,
                container_facilitators("flaky", ExecutionMode::Sync),
                AdviserRegistry::with_standard_advisers(),
                Arc::new(NullDispatcher),
            );

            let result = hx
                .driver
                .run_node("step-1", root_ambiance(), None)
                .await
                .unwrap();

            // No adviser matched; the failure stands without parking.
            assert_eq!(result.status, NodeStatus::Failed);
        });
    }

    #[test]
    fn test_task_step_round_trips_through_router() {
        tokio_test::block_on(async {
            let mut steps = StepRegistry::new();
            steps.register_task("remote", Arc::new(RemoteStep));
            let router = Arc::new(TaskResultRouter::new());

            let nodes: Arc<dyn NodeExecutionStore> =
                Arc::new(InMemoryNodeExecutionStore::new());
            let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(256));
            let timeouts: Arc<dyn TimeoutStore> = Arc::new(InMemoryTimeoutStore::new());
            let driver = Arc::new(NodeDriver::new(
                Arc::new(tree_plan(vec![], "remote")),
                Transitioner::new(nodes.clone(), events.clone(), 3),
                Arc::new(steps),
                Arc::new(container_facilitators("remote", ExecutionMode::Task)),
                Arc::new(AdviserRegistry::with_standard_advisers()),
                Arc::new(EchoDispatcher::new(router.clone())),
                timeouts,
                router,
                DriverSettings {
                    poll_interval: Duration::from_millis(10),
                    ..DriverSettings::default()
                },
            ));

            let result = driver
                .run_node("step-1", root_ambiance(), None)
                .await
                .unwrap();
            assert_eq!(result.status, NodeStatus::Succeeded);
        });
    }

    #[test]
    fn test_abort_while_task_waiting_halts_the_node() {
        tokio_test::block_on(async {
            let mut steps = StepRegistry::new();
            steps.register_task("remote", Arc::new(RemoteStep));
            let hx = harness(
                tree_plan(vec![], "remote"),
                steps,
                container_facilitators("remote", ExecutionMode::Task),
                AdviserRegistry::with_standard_advisers(),
                Arc::new(SilentDispatcher),
            );

            let driver = hx.driver.clone();
            let handle = tokio::spawn(async move {
                driver.run_node("step-1", root_ambiance(), None).await
            });

            // Wait for the node to park, then force it out.
            let waiting = loop {
                let live = hx.nodes.live_for_plan("exec-1").await.unwrap();
                if let Some(node) = live
                    .iter()
                    .find(|n| n.status == NodeStatus::TaskWaiting)
                {
                    break node.clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            hx.nodes
                .update_status(&waiting.id, NodeStatus::TaskWaiting, NodeStatus::Aborted)
                .await
                .unwrap();

            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.status, NodeStatus::Aborted);
        });
    }

    #[test]
    fn test_expired_node_is_retried_by_advisers() {
        tokio_test::block_on(async {
            let mut steps = StepRegistry::new();
            steps.register_task("remote", Arc::new(RemoteStep));
            let router = Arc::new(TaskResultRouter::new());
            let nodes: Arc<dyn NodeExecutionStore> =
                Arc::new(InMemoryNodeExecutionStore::new());
            let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(256));
            let timeouts: Arc<dyn TimeoutStore> = Arc::new(InMemoryTimeoutStore::new());
            let advisers = vec![AdviserSpec::new(
                AdviserType::Retry,
                json!({"max_attempts": 1}),
            )];
            let driver = Arc::new(NodeDriver::new(
                Arc::new(tree_plan(advisers, "remote")),
                Transitioner::new(nodes.clone(), events.clone(), 3),
                Arc::new(steps),
                Arc::new(container_facilitators("remote", ExecutionMode::Task)),
                Arc::new(AdviserRegistry::with_standard_advisers()),
                Arc::new(SilentDispatcher),
                timeouts,
                router.clone(),
                DriverSettings {
                    poll_interval: Duration::from_millis(10),
                    ..DriverSettings::default()
                },
            ));
            let mut rx = events.subscribe();

            let run = {
                let driver = driver.clone();
                tokio::spawn(
                    async move { driver.run_node("step-1", root_ambiance(), None).await },
                )
            };

            // First attempt parks on its task; force it expired the way the
            // timeout monitor would.
            let first = loop {
                let live = nodes.live_for_plan("exec-1").await.unwrap();
                if let Some(node) = live
                    .iter()
                    .find(|n| n.status == NodeStatus::TaskWaiting)
                {
                    break node.clone();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            nodes
                .update_status(&first.id, NodeStatus::TaskWaiting, NodeStatus::Expired)
                .await
                .unwrap();

            // The retry adviser re-instantiates; complete the second attempt.
            loop {
                let live = nodes.live_for_plan("exec-1").await.unwrap();
                if live.iter().any(|n| {
                    n.status == NodeStatus::TaskWaiting
                        && n.previous_execution_id.as_deref() == Some(first.id.as_str())
                }) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(
                router
                    .deliver(TaskResult::succeeded("task-silent", json!({"ok": true})))
                    .await
            );

            let result = run.await.unwrap().unwrap();
            assert_eq!(result.status, NodeStatus::Succeeded);

            let events = drain(&mut rx);
            assert!(events.iter().any(|event| matches!(
                event,
                EngineEvent::NodeStatusChanged {
                    to: NodeStatus::Retried,
                    ..
                }
            )));
        });
    }

    #[test]
    fn test_next_step_advice_jumps_over_sibling() {
        tokio_test::block_on(async {
            struct JumpAdviser;

            impl Adviser for JumpAdviser {
                fn can_advise(&self, event: &AdvisingEvent) -> bool {
                    event.to_status.is_broken()
                }
                fn on_advise_event(&self, _event: &AdvisingEvent) -> AdviserResponse {
                    AdviserResponse::NextStep {
                        next_node_id: "step-3".to_string(),
                    }
                }
            }

            let plan = Plan::new(
                "plan-1",
                "stage-1",
                vec![
                    PlanNode::new("stage-1", "Stage", NodeGroup::Stage, "container")
                        .with_children(vec![
                            "step-1".into(),
                            "step-2".into(),
                            "step-3".into(),
                        ]),
                    PlanNode::new("step-1", "Broken", NodeGroup::Step, "flaky")
                        .with_advisers(vec![AdviserSpec::new(
                            AdviserType::Custom("jump".into()),
                            Value::Null,
                        )]),
                    PlanNode::new("step-2", "Skipped over", NodeGroup::Step, "echo"),
                    PlanNode::new("step-3", "Landing", NodeGroup::Step, "echo"),
                ],
            )
            .unwrap();

            let mut steps = StepRegistry::new();
            steps.register_unit("flaky", Arc::new(FlakyStep));
            steps.register_unit("echo", Arc::new(OkStep));
            let mut facilitators = container_facilitators("echo", ExecutionMode::Sync);
            facilitators.register(
                "flaky",
                Arc::new(FixedModeFacilitator::new(ExecutionMode::Sync)),
            );
            let mut advisers = AdviserRegistry::with_standard_advisers();
            advisers.register(AdviserType::Custom("jump".into()), Arc::new(JumpAdviser));

            let hx = harness(
                plan,
                steps,
                facilitators,
                advisers,
                Arc::new(NullDispatcher),
            );
            let mut rx = hx.events.subscribe();

            let result = hx
                .driver
                .run_node("stage-1", root_ambiance(), None)
                .await
                .unwrap();
            assert_eq!(result.status, NodeStatus::Succeeded);

            let touched: Vec<String> = drain(&mut rx)
                .into_iter()
                .filter_map(|event| match event {
                    EngineEvent::NodeStatusChanged { ambiance, .. } => {
                        ambiance.current_level().map(|l| l.setup_id.clone())
                    }
                    _ => None,
                })
                .collect();
            assert!(touched.contains(&"step-3".to_string()));
            assert!(!touched.contains(&"step-2".to_string()));
        });
    }

    #[test]
    fn test_parallel_children_all_run() {
        tokio_test::block_on(async {
            let plan = Plan::new(
                "plan-1",
                "stage-1",
                vec![
                    PlanNode::new("stage-1", "Stage", NodeGroup::Stage, "fanout")
                        .with_children(vec!["a".into(), "b".into(), "c".into()]),
                    PlanNode::new("a", "A", NodeGroup::Step, "echo"),
                    PlanNode::new("b", "B", NodeGroup::Step, "echo"),
                    PlanNode::new("c", "C", NodeGroup::Step, "echo"),
                ],
            )
            .unwrap();

            let mut steps = StepRegistry::new();
            steps.register_unit("echo", Arc::new(OkStep));
            let mut facilitators = FacilitatorRegistry::new();
            facilitators.register(
                "fanout",
                Arc::new(FixedModeFacilitator::new(ExecutionMode::Children)),
            );
            facilitators.register(
                "echo",
                Arc::new(FixedModeFacilitator::new(ExecutionMode::Sync)),
            );

            let hx = harness(
                plan,
                steps,
                facilitators,
                AdviserRegistry::with_standard_advisers(),
                Arc::new(NullDispatcher),
            );
            let mut rx = hx.events.subscribe();

            let result = hx
                .driver
                .run_node("stage-1", root_ambiance(), None)
                .await
                .unwrap();
            assert_eq!(result.status, NodeStatus::Succeeded);

            let succeeded: Vec<String> = drain(&mut rx)
                .into_iter()
                .filter_map(|event| match event {
                    EngineEvent::NodeStatusChanged {
                        ambiance,
                        to: NodeStatus::Succeeded,
                        ..
                    } => ambiance.current_level().map(|l| l.setup_id.clone()),
                    _ => None,
                })
                .collect();
            for child in ["a", "b", "c"] {
                assert!(succeeded.contains(&child.to_string()), "{child}");
            }
        });
    }
}
