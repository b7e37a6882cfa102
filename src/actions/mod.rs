// ABOUTME: Action invocation seam and the default action registry
// ABOUTME: Maps action names to async or blocking implementations with a few built-ins

pub mod blocking;
pub mod builtin;
pub mod command;
pub mod error;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use blocking::BlockingAction;
pub use error::{ActionError, Result};

/// What an action knows about the node invoking it.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub node_id: String,
    /// Location of the node including enclosing composites.
    pub path: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

impl ActionContext {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            path: node_id.clone(),
            node_id,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }
}

/// Invokes actions by name with already-rendered parameters.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke(&self, action: &str, params: Value, ctx: &ActionContext) -> Result<Value>;
}

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, params: Value, ctx: &ActionContext) -> Result<Value>;

    /// Reject parameters before execution starts.
    fn validate_params(&self, _params: &Value) -> Result<()> {
        Ok(())
    }
}

/// Deserialize an action's parameters into its typed form.
pub fn parse_params<T: DeserializeOwned>(action: &str, params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| ActionError::invalid_params(action, e))
}

#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.list_supported())
            .finish()
    }
}

impl ActionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `echo`, `fail`, `sleep` and `command`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::EchoAction);
        registry.register(builtin::FailAction);
        registry.register(builtin::SleepAction);
        registry.register(command::CommandAction);
        registry
    }

    /// Add an action, replacing any existing one with the same name.
    pub fn register<A: Action + 'static>(&mut self, action: A) -> &mut Self {
        self.actions.insert(action.name().to_string(), Arc::new(action));
        self
    }

    /// Add a synchronous function, run on the blocking thread pool.
    pub fn register_blocking<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(BlockingAction::new(name, func))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn list_supported(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ActionInvoker for ActionRegistry {
    async fn invoke(&self, action: &str, params: Value, ctx: &ActionContext) -> Result<Value> {
        let implementation = self
            .get(action)
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))?;
        implementation.validate_params(&params)?;
        debug!("Executing action '{}' for node '{}'", action, ctx.path);
        implementation.execute(params, ctx).await
    }
}
