// ABOUTME: Main library module for the trellis task graph engine
// ABOUTME: Exports all core modules and provides the public API

pub mod actions;
pub mod cli;
pub mod engine;
pub mod parser;
pub mod template;

// Re-export commonly used types
pub use actions::{Action, ActionContext, ActionInvoker, ActionRegistry};
pub use cli::{App, Args, Config};
pub use engine::{Engine, EngineConfig, NodeStatus, RunHandle, RunResult, RunStatus};
pub use parser::{TaskDefinition, WorkflowParser};
pub use template::{ParameterRenderer, TemplateEngine};

// Error handling
pub type Result<T> = anyhow::Result<T>;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
