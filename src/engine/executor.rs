// ABOUTME: Node executors, one strategy per node kind
// ABOUTME: Handles admission, per-attempt timeouts, retries and failure handlers around each kind

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::context::{ExecutionContext, Scope};
use super::error::{ItemFailure, NodeError};
use super::graph::{BranchArm, Graph, Node, NodeKind};
use super::resource::{AdmissionRequest, ScopedPermit};
use super::result::{RunResult, RunStatus};
use super::scheduler::{RunEvent, Scheduler};
use crate::actions::{ActionContext, ActionError};

/// How a node ended, as reported to its scheduler.
#[derive(Debug)]
pub(crate) enum Outcome {
    Success(Value),
    Failed(NodeError),
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct NodeReport {
    pub outcome: Outcome,
    pub attempts: u32,
    /// Targets a branch decided not to take.
    pub branch_skips: Vec<String>,
    /// Stamped while the node still holds its permits.
    pub finished_at: DateTime<Utc>,
}

impl NodeReport {
    pub fn failed(error: NodeError, attempts: u32) -> Self {
        Self {
            outcome: Outcome::Failed(error),
            attempts,
            branch_skips: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    fn cancelled(attempts: u32) -> Self {
        Self {
            outcome: Outcome::Cancelled,
            attempts,
            branch_skips: Vec::new(),
            finished_at: Utc::now(),
        }
    }
}

/// A successful attempt.
struct Completed {
    value: Value,
    branch_skips: Vec<String>,
}

impl Completed {
    fn value(value: Value) -> Self {
        Self {
            value,
            branch_skips: Vec::new(),
        }
    }
}

/// Run one node to a terminal outcome and report it to the scheduler.
///
/// The node waits for admission, is attempted under its retry policy and
/// runs its failure handler if it ended FAILED. `Finished` is sent before
/// the permits drop, so whoever is admitted next starts after this node
/// has finished.
#[instrument(
    name = "node",
    skip_all,
    fields(id = %node.id, kind = node.kind_name(), path = %cx.qualify(&node.id))
)]
pub(crate) async fn run_node(
    node: Arc<Node>,
    cx: ExecutionContext,
    events: mpsc::UnboundedSender<RunEvent>,
) {
    let (report, permit) = execute_node(&node, &cx, &events).await;
    let _ = events.send(RunEvent::Finished {
        node: node.id.clone(),
        report,
    });
    drop(permit);
}

async fn execute_node(
    node: &Node,
    cx: &ExecutionContext,
    events: &mpsc::UnboundedSender<RunEvent>,
) -> (NodeReport, Option<ScopedPermit>) {
    let request = AdmissionRequest {
        tags: node.resource_tags.clone(),
        takes_run_slot: node.is_action(),
        bypass_queue: !cx.held_tags.is_empty(),
    };

    let mut permit = tokio::select! {
        biased;
        _ = cx.cancel.cancelled() => {
            debug!("Cancelled while waiting for admission");
            return (NodeReport::cancelled(0), None);
        }
        granted = cx.services.admission.acquire(&request) => match granted {
            Ok(permit) => permit,
            Err(err) => {
                let error = NodeError::Internal {
                    message: err.to_string(),
                };
                return (NodeReport::failed(error, 0), None);
            }
        },
    };

    let _ = events.send(RunEvent::Started {
        node: node.id.clone(),
        at: Utc::now(),
    });

    let body_cx = cx.holding(&node.resource_tags);
    let mut attempt = 0;
    let result = loop {
        attempt += 1;
        let outcome = attempt_node(node, &body_cx, attempt).await;

        match outcome {
            Ok(completed) => break Ok(completed),
            Err(NodeError::Cancelled) => break Err(NodeError::Cancelled),
            Err(_) if cx.is_cancelled() => break Err(NodeError::Cancelled),
            Err(err) if err.is_retryable() && node.retry.should_retry(attempt) => {
                let delay = node.retry.delay_after(attempt);
                warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt, node.retry.max_attempts, err, delay
                );
                tokio::select! {
                    biased;
                    _ = cx.cancel.cancelled() => break Err(NodeError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => break Err(err),
        }
    };

    // Retries cover body and recovery; `always` runs once on the final outcome.
    let result = match &node.kind {
        NodeKind::Guarded {
            always: Some(always),
            ..
        } => run_always(node, &body_cx, always, result).await,
        _ => result,
    };

    let report = match result {
        Ok(completed) => NodeReport {
            outcome: Outcome::Success(completed.value),
            attempts: attempt,
            branch_skips: completed.branch_skips,
            finished_at: Utc::now(),
        },
        Err(NodeError::Cancelled) => NodeReport::cancelled(attempt),
        Err(err) => {
            if let Some(handler) = &node.failure_handler {
                // The handler's actions take their own run slots.
                permit.release_run_slot();
                run_failure_handler(node, handler, &body_cx, &err).await;
            }
            NodeReport::failed(err, attempt)
        }
    };
    (report, Some(permit))
}

async fn run_failure_handler(node: &Node, handler: &Arc<Graph>, cx: &ExecutionContext, err: &NodeError) {
    info!("Running failure handler for '{}'", node.id);
    let scope = cx.scope.clone().with_binding("error", err.to_binding(&node.id));
    let run = run_nested(cx, &format!("{}/on_failure", node.id), handler, scope).await;
    match run.status {
        RunStatus::Success => debug!("Failure handler for '{}' completed", node.id),
        status => warn!("Failure handler for '{}' ended {}", node.id, status),
    }
}

async fn attempt_node(node: &Node, cx: &ExecutionContext, attempt: u32) -> Result<Completed, NodeError> {
    let execution = execute_kind(node, cx, attempt);
    match node.timeout {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout { timeout: limit }),
        },
        None => execution.await,
    }
}

async fn execute_kind(node: &Node, cx: &ExecutionContext, attempt: u32) -> Result<Completed, NodeError> {
    match &node.kind {
        NodeKind::Action { action, params } => {
            execute_action(node, cx, attempt, action, params).await.map(Completed::value)
        }
        NodeKind::Sequence { body } => {
            let run = run_nested(cx, &node.id, body, cx.scope.clone()).await;
            nested_output(&run).map(Completed::value)
        }
        NodeKind::ParallelForEach {
            items,
            binding,
            template,
        } => execute_for_each(node, cx, items, binding, template)
            .await
            .map(Completed::value),
        NodeKind::ConditionalLoop {
            condition,
            max_iterations,
            body,
        } => execute_loop(node, cx, condition, *max_iterations, body)
            .await
            .map(Completed::value),
        NodeKind::Branch { arms, default } => execute_branch(cx, arms, default),
        NodeKind::Guarded { body, recovery, .. } => {
            execute_guarded(node, cx, body, recovery.as_ref())
                .await
                .map(Completed::value)
        }
    }
}

async fn execute_action(
    node: &Node,
    cx: &ExecutionContext,
    attempt: u32,
    action: &str,
    params: &Value,
) -> Result<Value, NodeError> {
    let rendered = cx
        .services
        .renderer
        .render(params, &cx.scope.to_value())
        .map_err(render_error)?;

    let action_cx = ActionContext {
        node_id: node.id.clone(),
        path: cx.qualify(&node.id),
        attempt,
        cancel: cx.cancel.clone(),
    };

    debug!("Invoking action '{}' (attempt {})", action, attempt);
    tokio::select! {
        biased;
        _ = cx.cancel.cancelled() => Err(NodeError::Cancelled),
        result = cx.services.invoker.invoke(action, rendered, &action_cx) => match result {
            Ok(value) => Ok(value),
            Err(ActionError::Cancelled) => Err(NodeError::Cancelled),
            Err(err) => Err(NodeError::Execution {
                action: action.to_string(),
                message: err.to_string(),
            }),
        },
    }
}

async fn execute_for_each(
    node: &Node,
    cx: &ExecutionContext,
    items: &Value,
    binding: &str,
    template: &Arc<Graph>,
) -> Result<Value, NodeError> {
    let rendered = cx
        .services
        .renderer
        .render(items, &cx.scope.to_value())
        .map_err(render_error)?;
    let items = into_items(rendered)?;
    debug!("Fanning out over {} items", items.len());

    let runs = items.iter().enumerate().map(|(index, item)| {
        let scope = cx
            .scope
            .clone()
            .with_binding(binding, item.clone())
            .with_binding("index", json!(index));
        run_nested(cx, &format!("{}[{}]", node.id, index), template, scope)
    });
    let runs = join_all(runs).await;

    if cx.is_cancelled() {
        return Err(NodeError::Cancelled);
    }

    let total = items.len();
    let mut outputs = Vec::with_capacity(total);
    let mut failures = Vec::new();
    for (index, (item, run)) in items.into_iter().zip(runs.iter()).enumerate() {
        match nested_output(run) {
            Ok(output) => outputs.push(output),
            Err(NodeError::Cancelled) => return Err(NodeError::Cancelled),
            Err(error) => failures.push(ItemFailure { index, item, error }),
        }
    }

    if failures.is_empty() {
        Ok(Value::Array(outputs))
    } else {
        Err(NodeError::Aggregate { total, failures })
    }
}

/// Accepts an array, or a string holding a JSON array (what a `json`
/// helper renders to).
fn into_items(value: Value) -> Result<Vec<Value>, NodeError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::String(text) => match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(other) => Err(NodeError::InvalidInput {
                message: format!("items must be an array, got {}", json_type(&other)),
            }),
            Err(err) => Err(NodeError::InvalidInput {
                message: format!("items is not a JSON array: {}", err),
            }),
        },
        other => Err(NodeError::InvalidInput {
            message: format!("items must be an array, got {}", json_type(&other)),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

async fn execute_loop(
    node: &Node,
    cx: &ExecutionContext,
    condition: &Value,
    max_iterations: u32,
    body: &Arc<Graph>,
) -> Result<Value, NodeError> {
    let mut outputs = Vec::new();
    let mut last = Value::Null;
    let mut iteration: u32 = 0;

    loop {
        if cx.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        let scope = cx
            .scope
            .clone()
            .with_binding("iteration", json!(iteration))
            .with_binding("last", last.clone());
        let proceed = cx
            .services
            .renderer
            .evaluate(condition, &scope.to_value())
            .map_err(render_error)?;

        if !proceed {
            debug!("Loop finished after {} iterations", iteration);
            return Ok(json!({ "iterations": iteration, "outputs": outputs }));
        }
        if iteration >= max_iterations {
            return Err(NodeError::LoopCapExceeded { max_iterations });
        }

        let label = format!("{}[{}]", node.id, iteration);
        let run = run_nested(cx, &label, body, scope).await;
        let output = nested_output(&run)?;
        last = output.clone();
        outputs.push(output);
        iteration += 1;
    }
}

fn execute_branch(
    cx: &ExecutionContext,
    arms: &[BranchArm],
    default: &[String],
) -> Result<Completed, NodeError> {
    let scope = cx.scope.to_value();
    let mut selected: &[String] = default;
    for arm in arms {
        let taken = cx
            .services
            .renderer
            .evaluate(&arm.condition, &scope)
            .map_err(render_error)?;
        if taken {
            selected = &arm.targets;
            break;
        }
    }

    let chosen: HashSet<&str> = selected.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let branch_skips: Vec<String> = arms
        .iter()
        .flat_map(|arm| arm.targets.iter())
        .chain(default.iter())
        .filter(|target| !chosen.contains(target.as_str()) && seen.insert(target.as_str()))
        .cloned()
        .collect();

    debug!("Branch selected {:?}, skipping {:?}", selected, branch_skips);
    let selected = if selected.is_empty() {
        Value::Null
    } else {
        json!(selected)
    };
    Ok(Completed {
        value: json!({ "selected": selected }),
        branch_skips,
    })
}

async fn execute_guarded(
    node: &Node,
    cx: &ExecutionContext,
    body: &Arc<Graph>,
    recovery: Option<&Arc<Graph>>,
) -> Result<Value, NodeError> {
    let body_run = run_nested(cx, &format!("{}/body", node.id), body, cx.scope.clone()).await;

    match nested_output(&body_run) {
        Ok(value) => Ok(value),
        Err(NodeError::Cancelled) => Err(NodeError::Cancelled),
        Err(err) => match recovery {
            Some(recovery) => {
                info!("Body of '{}' failed, running recovery: {}", node.id, err);
                let scope = cx
                    .scope
                    .clone()
                    .with_binding("error", err.to_binding(&node.id));
                let run = run_nested(cx, &format!("{}/recovery", node.id), recovery, scope).await;
                match nested_output(&run) {
                    Ok(value) => Ok(value),
                    Err(NodeError::Cancelled) => Err(NodeError::Cancelled),
                    Err(source) => Err(NodeError::Recovery {
                        body: Box::new(err),
                        source: Box::new(source),
                    }),
                }
            }
            None => Err(err),
        },
    }
}

/// Run a guarded node's `always` block after its final outcome. Skipped
/// when the node was cancelled.
async fn run_always(
    node: &Node,
    cx: &ExecutionContext,
    always: &Arc<Graph>,
    outcome: Result<Completed, NodeError>,
) -> Result<Completed, NodeError> {
    if matches!(outcome, Err(NodeError::Cancelled)) || cx.is_cancelled() {
        return Err(NodeError::Cancelled);
    }

    let mut scope = cx.scope.clone();
    if let Err(err) = &outcome {
        scope.bind("error", err.to_binding(&node.id));
    }
    let run = run_nested(cx, &format!("{}/always", node.id), always, scope).await;
    match nested_output(&run) {
        Ok(_) => outcome,
        Err(NodeError::Cancelled) => Err(NodeError::Cancelled),
        Err(source) if outcome.is_ok() => Err(NodeError::Always {
            source: Box::new(source),
        }),
        Err(source) => {
            // The earlier failure stays the node's error.
            warn!("Always block of '{}' also failed: {}", node.id, source);
            outcome
        }
    }
}

fn run_nested(
    cx: &ExecutionContext,
    label: &str,
    graph: &Arc<Graph>,
    scope: Scope,
) -> BoxFuture<'static, RunResult> {
    let child = cx.child(label, scope);
    Scheduler::new(child.path.clone(), Arc::clone(graph), child).run()
}

/// What a nested run hands back to the node that started it.
fn nested_output(run: &RunResult) -> Result<Value, NodeError> {
    match run.status {
        RunStatus::Success => Ok(run.output()),
        RunStatus::Cancelled => Err(NodeError::Cancelled),
        RunStatus::Failed => Err(run.failure_error()),
    }
}

fn render_error(err: crate::template::TemplateError) -> NodeError {
    NodeError::Render {
        message: err.to_string(),
    }
}
