// ABOUTME: Adapter running synchronous functions as actions
// ABOUTME: Executes the function on tokio's blocking pool so the scheduler never stalls

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{Action, ActionContext, ActionError, Result};

type BlockingFn = dyn Fn(Value) -> Result<Value> + Send + Sync;

/// A named synchronous function invoked like any other action.
pub struct BlockingAction {
    name: String,
    func: Arc<BlockingFn>,
}

impl BlockingAction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl Action for BlockingAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> Result<Value> {
        let func = Arc::clone(&self.func);
        tokio::task::spawn_blocking(move || func(params))
            .await
            .map_err(|e| ActionError::Failed(format!("blocking action '{}' panicked: {}", self.name, e)))?
    }
}
