// ABOUTME: Optional hook that prepares a run before scheduling starts
// ABOUTME: Planners may inspect the validated graph and adjust the initial bindings

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::error::Result;
use super::graph::Graph;

/// Runs once per top-level run, after validation and before the first node
/// is dispatched. It has no further say once scheduling begins.
#[async_trait]
pub trait RunPlanner: Send + Sync {
    async fn prepare(&self, graph: &Graph, bindings: &mut Map<String, Value>) -> Result<()>;
}

/// Planner that checks every binding it requires is present.
#[derive(Debug, Clone, Default)]
pub struct RequiredBindings {
    names: Vec<String>,
}

impl RequiredBindings {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl RunPlanner for RequiredBindings {
    async fn prepare(&self, _graph: &Graph, bindings: &mut Map<String, Value>) -> Result<()> {
        let missing: Vec<&str> = self
            .names
            .iter()
            .filter(|name| !bindings.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(super::error::ExecutionError::PlannerError(format!(
                "missing required bindings: {}",
                missing.join(", ")
            )))
        }
    }
}
