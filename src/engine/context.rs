// ABOUTME: Execution context handed to every node executor
// ABOUTME: Carries the shared services, visible bindings and results, cancellation and held resources

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::resource::AdmissionController;
use crate::actions::ActionInvoker;
use crate::template::ParameterRenderer;

/// Collaborators shared by every run an engine starts.
pub struct Services {
    pub invoker: Arc<dyn ActionInvoker>,
    pub renderer: Arc<dyn ParameterRenderer>,
    pub admission: Arc<AdmissionController>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("admission", &self.admission.stats())
            .finish_non_exhaustive()
    }
}

/// Names and results visible to templates in one run.
///
/// Templates see every binding at the top level plus a `results` object
/// keyed by node id. A nested run starts from its parent's scope, so an
/// inner step can read outer results; results recorded inside the nested
/// run shadow outer ones of the same id.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: Map<String, Value>,
    results: Map<String, Value>,
}

impl Scope {
    pub fn new(bindings: Map<String, Value>) -> Self {
        Self {
            bindings,
            results: Map::new(),
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bind(name, value);
        self
    }

    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn bindings(&self) -> &Map<String, Value> {
        &self.bindings
    }

    pub fn result(&self, node_id: &str) -> Option<&Value> {
        self.results.get(node_id)
    }

    pub fn record_result(&mut self, node_id: impl Into<String>, value: Value) {
        self.results.insert(node_id.into(), value);
    }

    /// The JSON object templates are rendered against.
    pub fn to_value(&self) -> Value {
        let mut root = self.bindings.clone();
        root.insert("results".to_string(), Value::Object(self.results.clone()));
        Value::Object(root)
    }
}

/// Per-node view of a run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub services: Arc<Services>,
    pub scope: Scope,
    /// Slash-separated location of the current run, e.g. `deploy/items[2]`.
    pub path: String,
    pub cancel: CancellationToken,
    /// Tags held by enclosing composite nodes.
    pub held_tags: BTreeSet<String>,
}

impl ExecutionContext {
    pub fn new(
        run_id: impl Into<String>,
        services: Arc<Services>,
        scope: Scope,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            services,
            scope,
            path: String::new(),
            cancel,
            held_tags: BTreeSet::new(),
        }
    }

    /// Context for a nested run below this one. Cancelling this context
    /// cancels the child, never the other way round.
    pub fn child(&self, label: &str, scope: Scope) -> Self {
        Self {
            run_id: self.run_id.clone(),
            services: Arc::clone(&self.services),
            scope,
            path: self.qualify(label),
            cancel: self.cancel.child_token(),
            held_tags: self.held_tags.clone(),
        }
    }

    /// Same context with `tags` added to the held set.
    pub fn holding(&self, tags: &BTreeSet<String>) -> Self {
        let mut cx = self.clone();
        cx.held_tags.extend(tags.iter().cloned());
        cx
    }

    pub fn qualify(&self, label: &str) -> String {
        if self.path.is_empty() {
            label.to_string()
        } else {
            format!("{}/{}", self.path, label)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_value_exposes_bindings_and_results() {
        let mut bindings = Map::new();
        bindings.insert("region".to_string(), json!("eu"));
        let mut scope = Scope::new(bindings).with_binding("index", json!(2));
        scope.record_result("fetch", json!({ "rows": 3 }));

        assert_eq!(
            scope.to_value(),
            json!({
                "region": "eu",
                "index": 2,
                "results": { "fetch": { "rows": 3 } }
            })
        );
    }

    #[test]
    fn test_nested_results_shadow_outer() {
        let mut outer = Scope::default();
        outer.record_result("a", json!("outer"));
        outer.record_result("b", json!("kept"));

        let mut inner = outer.clone();
        inner.record_result("a", json!("inner"));

        assert_eq!(inner.result("a"), Some(&json!("inner")));
        assert_eq!(inner.result("b"), Some(&json!("kept")));
        assert_eq!(outer.result("a"), Some(&json!("outer")));
    }
}
