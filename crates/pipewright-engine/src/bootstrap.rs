//! Engine bootstrap - wires stores, registries, and background tasks from
//! configuration into a ready-to-run engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pipewright_config::{ObservabilityConfig, PipewrightConfig};
use pipewright_core::adviser::{
    AdviserRegistry, AdviserType, ManualInterventionAdviser, RepairAction,
};
use pipewright_core::dispatch::{DispatchError, TaskDescriptor, TaskDispatcher, TaskId, TaskResult};
use pipewright_core::facilitator::FacilitatorRegistry;
use pipewright_core::interrupt::{Interrupt, InterruptConfig, InterruptTarget, InterruptType};
use pipewright_core::plan::Plan;
use pipewright_core::step::StepRegistry;
use pipewright_core::store::{InterruptStore, NodeExecutionStore, TimeoutStore};
use pipewright_stores::{
    BroadcastEventBus, EngineEvent, EventBus, InMemoryInterruptStore, InMemoryNodeExecutionStore,
    InMemoryTimeoutStore,
};

use crate::driver::{DriverSettings, NodeDriver};
use crate::error::EngineError;
use crate::interrupts::{InterruptError, InterruptOutcome, InterruptService};
use crate::orchestrator::{PlanExecutor, PlanOutcome};
use crate::router::TaskResultRouter;
use crate::timeouts::TimeoutMonitor;
use crate::transitions::Transitioner;

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialise the tracing subscriber once per process. Subsequent calls are
/// no-ops, so embedding hosts that already installed a subscriber keep it.
pub fn init_tracing_if_needed(config: &ObservabilityConfig) {
    if TRACING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if builder.try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Dispatcher used when no remote executor is wired in. Plans without Task
/// or TaskChain nodes never touch it.
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

fn repair_action_from_config(name: &str) -> RepairAction {
    match name {
        "mark_failed" => RepairAction::MarkFailed,
        "mark_success" => RepairAction::MarkSuccess,
        "retry" => RepairAction::Retry,
        "ignore" => RepairAction::Ignore,
        // Config validation restricts the value; anything else resolves to
        // the safe default.
        _ => RepairAction::Abort,
    }
}

/// Assembles an [Engine] from configuration, a plan, and the registries.
pub struct EngineBuilder {
    config: PipewrightConfig,
    plan: Option<Plan>,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    nodes: Option<Arc<dyn NodeExecutionStore>>,
    interrupts: Option<Arc<dyn InterruptStore>>,
    timeouts: Option<Arc<dyn TimeoutStore>>,
}

impl EngineBuilder {
    pub fn new(config: PipewrightConfig) -> Self {
        // The intervention policy is configuration; rebind the standard
        // adviser over the configured defaults.
        let mut advisers = AdviserRegistry::with_standard_advisers();
        advisers.register(
            AdviserType::ManualIntervention,
            Arc::new(ManualInterventionAdviser::with_defaults(
                config.intervention.default_timeout(),
                repair_action_from_config(&config.intervention.default_action),
            )),
        );
        Self {
            config,
            plan: None,
            steps: StepRegistry::new(),
            facilitators: FacilitatorRegistry::new(),
            advisers,
            dispatcher: None,
            nodes: None,
            interrupts: None,
            timeouts: None,
        }
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Swap in a durable node store; defaults to in-memory.
    pub fn with_node_store(mut self, store: Arc<dyn NodeExecutionStore>) -> Self {
        self.nodes = Some(store);
        self
    }

    pub fn with_interrupt_store(mut self, store: Arc<dyn InterruptStore>) -> Self {
        self.interrupts = Some(store);
        self
    }

    pub fn with_timeout_store(mut self, store: Arc<dyn TimeoutStore>) -> Self {
        self.timeouts = Some(store);
        self
    }

    pub fn steps_mut(&mut self) -> &mut StepRegistry {
        &mut self.steps
    }

    pub fn facilitators_mut(&mut self) -> &mut FacilitatorRegistry {
        &mut self.facilitators
    }

    pub fn advisers_mut(&mut self) -> &mut AdviserRegistry {
        &mut self.advisers
    }

    /// Wire everything together. Validates the plan against the facilitator
    /// registry before anything can execute.
    pub fn build(self) -> Result<Engine, EngineError> {
        let plan = Arc::new(self.plan.ok_or(EngineError::NotConfigured("plan"))?);
        let facilitators = Arc::new(self.facilitators);
        plan.validate(&facilitators)?;

        let nodes = self
            .nodes
            .unwrap_or_else(|| Arc::new(InMemoryNodeExecutionStore::new()));
        let interrupts = self
            .interrupts
            .unwrap_or_else(|| Arc::new(InMemoryInterruptStore::new()));
        let timeouts = self
            .timeouts
            .unwrap_or_else(|| Arc::new(InMemoryTimeoutStore::new()));
        let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(
            self.config.engine.event_bus_capacity,
        ));
        let dispatcher = self.dispatcher.unwrap_or_else(|| Arc::new(NullDispatcher));
        let router = Arc::new(TaskResultRouter::new());

        let transitioner = Transitioner::new(
            nodes.clone(),
            events.clone(),
            self.config.engine.cas_retry_budget,
        );
        let interrupt_service = Arc::new(InterruptService::new(
            interrupts,
            timeouts.clone(),
            Transitioner::new(
                nodes.clone(),
                events.clone(),
                self.config.engine.cas_retry_budget,
            ),
            events.clone(),
            self.config.timeouts.cleanup_retries,
            self.config.timeouts.cleanup_backoff(),
        ));

        let settings = DriverSettings {
            max_parallel_children: self.config.engine.max_parallel_children,
            cleanup_retries: self.config.timeouts.cleanup_retries,
            cleanup_backoff: self.config.timeouts.cleanup_backoff(),
            ..DriverSettings::default()
        };
        let driver = Arc::new(NodeDriver::new(
            plan.clone(),
            transitioner,
            Arc::new(self.steps),
            facilitators,
            Arc::new(self.advisers),
            dispatcher,
            timeouts.clone(),
            router.clone(),
            settings,
        ));
        let executor = PlanExecutor::new(plan, driver, events.clone());
        let monitor = Arc::new(TimeoutMonitor::new(
            timeouts,
            interrupt_service.clone(),
            self.config.timeouts.scan_interval(),
        ));

        Ok(Engine {
            executor,
            interrupt_service,
            router,
            events,
            monitor,
            shutdown: CancellationToken::new(),
        })
    }
}

/// The assembled orchestration engine. Interrupt registration is the only
/// mutation entry point exposed to the outside; task results and plan
/// execution flow through their dedicated ingress methods.
pub struct Engine {
    executor: PlanExecutor,
    interrupt_service: Arc<InterruptService>,
    router: Arc<TaskResultRouter>,
    events: Arc<dyn EventBus>,
    monitor: Arc<TimeoutMonitor>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Run the plan under the given execution id to conclusion.
    pub async fn execute_plan(
        &self,
        plan_execution_id: impl Into<String>,
    ) -> Result<PlanOutcome, EngineError> {
        self.executor.execute(plan_execution_id).await
    }

    /// External control ingress: register an interrupt and apply it.
    pub async fn register_interrupt(
        &self,
        interrupt_type: InterruptType,
        target: InterruptTarget,
        config: InterruptConfig,
    ) -> Result<(Interrupt, InterruptOutcome), InterruptError> {
        self.interrupt_service
            .register_and_process(interrupt_type, target, config)
            .await
    }

    /// External result ingress: route a remote task result to the node
    /// waiting on it. Returns whether a waiter existed.
    pub async fn deliver_task_result(&self, result: TaskResult) -> bool {
        self.router.deliver(result).await
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Start the background timeout monitor. Runs until [Engine::shutdown].
    pub fn start_timeout_monitor(&self) -> JoinHandle<()> {
        self.monitor.clone().spawn(self.shutdown.child_token())
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
