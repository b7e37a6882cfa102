// ABOUTME: Execution engine for node graphs
// ABOUTME: Validates graphs, evaluates dependencies, admits resources and schedules node executors

pub mod context;
pub mod dependency;
pub mod error;
mod executor;
pub mod graph;
pub mod planner;
pub mod resource;
pub mod result;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use context::{ExecutionContext, Scope, Services};
pub use dependency::{DependencyExpr, Resolution};
pub use error::{
    ExecutionError, ItemFailure, NodeError, Result, ValidationError, ValidationErrors,
};
pub use graph::{Graph, GraphBuilder, Node, NodeKind};
pub use planner::{RequiredBindings, RunPlanner};
pub use resource::{AdmissionController, AdmissionError, AdmissionRequest, ScopedPermit};
pub use result::{NodeRecord, NodeStatus, RunResult, RunStatus, RunSummary, SkipReason};
pub use retry::RetryPolicy;
pub use runner::{Engine, EngineConfig, RunHandle};
pub use scheduler::Scheduler;
pub use state::{RunObserver, RunSnapshot};
