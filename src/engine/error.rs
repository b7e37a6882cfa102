// ABOUTME: Error types for graph validation, node execution and engine operations
// ABOUTME: Node errors are serializable so run results keep full per-node failure detail

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Structural problems found while building a graph. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Cyclic dependency detected: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Branch '{branch}' targets unknown node '{target}'")]
    UnknownBranchTarget { branch: String, target: String },

    #[error("Terminal node '{node}' is not declared")]
    UnknownTerminalNode { node: String },

    #[error("Duplicate node id: {node}")]
    DuplicateNode { node: String },

    #[error("Invalid node '{node}': {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("Node '{node}' requests resource '{tag}' already held by an enclosing node")]
    ReentrantResourceTag { node: String, tag: String },

    #[error("Resources are nested in conflicting orders: {tags:?}")]
    ResourceOrderConflict { tags: Vec<String> },

    #[error("Graph '{path}' has no nodes")]
    EmptyGraph { path: String },
}

fn format_cycle(cycle: &[String]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(String::as_str).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.as_str());
    }
    parts.join(" -> ")
}

/// Every validation error found in a definition, in a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_cycle(&self) -> bool {
        self.0
            .iter()
            .any(|e| matches!(e, ValidationError::CyclicDependency { .. }))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Why a single item of a fan-out failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub index: usize,
    pub item: Value,
    pub error: NodeError,
}

/// Failure recorded against a node.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    #[error("Action '{action}' failed: {message}")]
    Execution { action: String, message: String },

    #[error("Failed to render parameters: {message}")]
    Render { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Attempt timed out after {timeout:?}")]
    Timeout {
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },

    #[error("{} of {total} items failed", .failures.len())]
    Aggregate {
        total: usize,
        failures: Vec<ItemFailure>,
    },

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        source: Box<NodeError>,
    },

    #[error("Terminal nodes did not succeed: {terminal:?}")]
    Incomplete { terminal: Vec<String> },

    #[error("Loop condition still true after {max_iterations} iterations")]
    LoopCapExceeded { max_iterations: u32 },

    #[error("Recovery failed: {source}")]
    Recovery {
        body: Box<NodeError>,
        source: Box<NodeError>,
    },

    #[error("Always block failed: {source}")]
    Always { source: Box<NodeError> },

    #[error("Internal executor error: {message}")]
    Internal { message: String },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    /// Cancellation propagates immediately and is never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, NodeError::Cancelled)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Execution { .. } => "execution",
            NodeError::Render { .. } => "render",
            NodeError::InvalidInput { .. } => "invalid_input",
            NodeError::Timeout { .. } => "timeout",
            NodeError::Aggregate { .. } => "aggregate",
            NodeError::Step { .. } => "step",
            NodeError::Incomplete { .. } => "incomplete",
            NodeError::LoopCapExceeded { .. } => "loop_cap_exceeded",
            NodeError::Recovery { .. } => "recovery",
            NodeError::Always { .. } => "always",
            NodeError::Internal { .. } => "internal",
            NodeError::Cancelled => "cancelled",
        }
    }

    /// Follows nested step wrappers down to the error that started it,
    /// returning the path of steps walked through.
    pub fn root_cause(&self) -> (Vec<&str>, &NodeError) {
        let mut path = Vec::new();
        let mut current = self;
        while let NodeError::Step { step, source } = current {
            path.push(step.as_str());
            current = source;
        }
        (path, current)
    }

    /// Value bound as `error` for recovery blocks and failure handlers.
    pub fn to_binding(&self, node_id: &str) -> Value {
        let (steps, root) = self.root_cause();
        let mut origin = vec![node_id];
        origin.extend(steps);
        json!({
            "node": node_id,
            "origin": origin.join("/"),
            "kind": root.kind(),
            "message": root.to_string(),
            "detail": self.to_string(),
        })
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Parser error: {0}")]
    ParserError(#[from] crate::parser::ParserError),

    #[error("Template error: {0}")]
    TemplateError(#[from] crate::template::TemplateError),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Planner error: {0}")]
    PlannerError(String),

    #[error("Join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
