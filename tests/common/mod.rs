// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Provides test actions that record calls and overlap, plus engine and file helpers

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;

use trellis::actions::{Action, ActionContext, ActionError, ActionRegistry};
use trellis::engine::{Engine, EngineConfig};
use trellis::parser::TaskDefinition;
use trellis::template::TemplateEngine;

/// Parse a definition from inline YAML.
pub fn definition(yaml: &str) -> TaskDefinition {
    TaskDefinition::from_yaml(yaml).expect("test definition should parse")
}

#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub params: Value,
    pub attempt: u32,
}

#[derive(Default)]
struct TrackerState {
    calls: Mutex<Vec<Call>>,
    active: Mutex<HashMap<String, usize>>,
    max_active: Mutex<HashMap<String, usize>>,
}

/// Action named `track` that records every call and the peak overlap per
/// `key` parameter. Fails when `fail` renders truthy, sleeps for `ms`.
#[derive(Clone, Default)]
pub struct Tracker {
    state: Arc<TrackerState>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, node_id: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == node_id || c.path.ends_with(&format!("/{}", node_id)))
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.lock().unwrap().len()
    }

    /// Highest number of overlapping calls seen with this key.
    pub fn max_overlap(&self, key: &str) -> usize {
        self.state
            .max_active
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, key: &str) {
        let mut active = self.state.active.lock().unwrap();
        let count = active.entry(key.to_string()).or_insert(0);
        *count += 1;
        let mut max = self.state.max_active.lock().unwrap();
        let peak = max.entry(key.to_string()).or_insert(0);
        *peak = (*peak).max(*count);
    }

    fn leave(&self, key: &str) {
        if let Some(count) = self.state.active.lock().unwrap().get_mut(key) {
            *count -= 1;
        }
    }
}

fn is_set(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim() == "true",
        _ => false,
    }
}

#[async_trait]
impl Action for Tracker {
    fn name(&self) -> &str {
        "track"
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> trellis::actions::Result<Value> {
        self.state.calls.lock().unwrap().push(Call {
            path: ctx.path.clone(),
            params: params.clone(),
            attempt: ctx.attempt,
        });

        let key = params
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let delay = params.get("ms").and_then(Value::as_u64).unwrap_or(0);

        self.enter(&key);
        let slept = tokio::select! {
            _ = ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(delay)) => true,
        };
        self.leave(&key);

        if !slept {
            return Err(ActionError::Cancelled);
        }
        if is_set(params.get("fail")) {
            return Err(ActionError::Failed(format!("{} was told to fail", ctx.node_id)));
        }
        Ok(json!({ "node": ctx.node_id, "params": params }))
    }
}

/// Action named `flaky` that fails its first `failures` calls.
#[derive(Clone)]
pub struct Flaky {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl Flaky {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _params: Value, ctx: &ActionContext) -> trellis::actions::Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(ActionError::Failed(format!("transient failure {}", call)))
        } else {
            Ok(json!({ "attempt": ctx.attempt }))
        }
    }
}

/// Built-in actions plus the given test actions.
pub fn registry_with(tracker: &Tracker, flaky: Option<&Flaky>) -> ActionRegistry {
    let mut registry = ActionRegistry::with_builtins();
    registry.register(tracker.clone());
    if let Some(flaky) = flaky {
        registry.register(flaky.clone());
    }
    registry
}

pub fn engine_with(config: EngineConfig, registry: ActionRegistry) -> Engine {
    Engine::new(
        config,
        Arc::new(registry),
        Arc::new(TemplateEngine::new().unwrap()),
    )
    .unwrap()
}

/// Engine with built-ins and a tracker under default limits.
pub fn tracked_engine(config: EngineConfig) -> (Engine, Tracker) {
    let tracker = Tracker::new();
    let engine = engine_with(config, registry_with(&tracker, None));
    (engine, tracker)
}

pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    pub async fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, content).await.unwrap();
        path
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}
