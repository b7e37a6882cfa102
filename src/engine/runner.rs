// ABOUTME: Engine entry point that validates definitions and starts runs
// ABOUTME: Owns the shared services and exposes run handles with observers and cancellation

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::context::{ExecutionContext, Scope, Services};
use super::error::{ExecutionError, Result, ValidationErrors};
use super::graph::{Graph, GraphBuilder, DEFAULT_MAX_ITERATIONS};
use super::planner::RunPlanner;
use super::resource::AdmissionController;
use super::result::{NodeStatus, RunResult};
use super::scheduler::Scheduler;
use super::state::{RunObserver, RunSnapshot};
use crate::actions::{ActionInvoker, ActionRegistry};
use crate::parser::TaskDefinition;
use crate::template::{ParameterRenderer, TemplateEngine};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on concurrently running action nodes.
    pub max_concurrent: usize,
    /// Capacity of resource pools not listed in `resource_pools`.
    pub default_pool_size: usize,
    pub resource_pools: HashMap<String, usize>,
    /// Loop cap for loops that do not declare one.
    pub default_max_iterations: u32,
    pub run_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            default_pool_size: 1,
            resource_pools: HashMap::new(),
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            run_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_pool(mut self, tag: impl Into<String>, size: usize) -> Self {
        self.resource_pools.insert(tag.into(), size);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(ExecutionError::ConfigurationError(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.default_max_iterations == 0 {
            return Err(ExecutionError::ConfigurationError(
                "default_max_iterations must be at least 1".to_string(),
            ));
        }
        if self.run_timeout == Some(Duration::ZERO) {
            return Err(ExecutionError::ConfigurationError(
                "run_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn build_admission(&self) -> Result<AdmissionController> {
        let config_error = |err: super::resource::AdmissionError| {
            ExecutionError::ConfigurationError(err.to_string())
        };
        let mut admission = AdmissionController::new(self.max_concurrent)
            .with_default_pool_size(self.default_pool_size)
            .map_err(config_error)?;
        for (tag, size) in &self.resource_pools {
            admission = admission.with_pool(tag.clone(), *size).map_err(config_error)?;
        }
        Ok(admission)
    }
}

/// Validates definitions and runs them. Runs started by one engine share
/// its action invoker, renderer and resource pools.
pub struct Engine {
    config: EngineConfig,
    services: Arc<Services>,
    planner: Option<Arc<dyn RunPlanner>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("planner", &self.planner.is_some())
            .finish()
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        invoker: Arc<dyn ActionInvoker>,
        renderer: Arc<dyn ParameterRenderer>,
    ) -> Result<Self> {
        config.validate()?;
        let admission = Arc::new(config.build_admission()?);
        Ok(Self {
            config,
            services: Arc::new(Services {
                invoker,
                renderer,
                admission,
            }),
            planner: None,
        })
    }

    /// Built-in actions, the handlebars renderer and default limits.
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            EngineConfig::default(),
            Arc::new(ActionRegistry::with_builtins()),
            Arc::new(TemplateEngine::new()?),
        )
    }

    pub fn with_planner(mut self, planner: Arc<dyn RunPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.services.admission
    }

    /// Build and validate without running anything.
    pub fn validate(&self, definition: &TaskDefinition) -> std::result::Result<Graph, ValidationErrors> {
        GraphBuilder::new()
            .with_default_max_iterations(self.config.default_max_iterations)
            .build(definition)
    }

    /// Validate the definition and start running it in the background.
    ///
    /// `bindings` override the definition's own variables.
    #[instrument(skip(self, definition, bindings), fields(task = %definition.name))]
    pub async fn start(
        &self,
        definition: &TaskDefinition,
        bindings: Map<String, Value>,
    ) -> Result<RunHandle> {
        let graph = Arc::new(self.validate(definition)?);

        let mut initial = definition.variables.clone();
        initial.extend(bindings);
        if let Some(planner) = &self.planner {
            planner.prepare(&graph, &mut initial).await?;
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (publisher, receiver) = watch::channel(RunSnapshot {
            run_id: run_id.clone(),
            nodes: graph
                .node_ids()
                .map(|id| (id.to_string(), NodeStatus::Pending))
                .collect(),
            finished: false,
        });

        info!(
            "Starting run of '{}' (run_id: {}) with {} nodes",
            definition.name,
            run_id,
            graph.total_nodes()
        );

        let cx = ExecutionContext::new(
            run_id.clone(),
            Arc::clone(&self.services),
            Scope::new(initial),
            cancel.clone(),
        );
        let scheduler = Scheduler::new(definition.name.clone(), graph, cx)
            .with_publisher(publisher)
            .with_timeout(self.config.run_timeout);
        let join = tokio::spawn(scheduler.run());

        Ok(RunHandle {
            run_id,
            observer: RunObserver::new(receiver),
            cancel,
            join,
        })
    }

    /// Validate, run to completion and return the result.
    pub async fn run(
        &self,
        definition: &TaskDefinition,
        bindings: Map<String, Value>,
    ) -> Result<RunResult> {
        let handle = self.start(definition, bindings).await?;
        let result = handle.wait().await?;
        info!(
            "Run '{}' completed with status {} in {:?}",
            result.name,
            result.status,
            result.duration()
        );
        Ok(result)
    }
}

/// A run in progress.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    observer: RunObserver,
    cancel: CancellationToken,
    join: JoinHandle<RunResult>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn observer(&self) -> RunObserver {
        self.observer.clone()
    }

    /// Request cancellation. Running nodes are cancelled and drained; the
    /// result is still available from `wait`.
    pub fn cancel(&self) {
        info!("Cancellation requested for run {}", self.run_id);
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<RunResult> {
        Ok(self.join.await?)
    }
}
