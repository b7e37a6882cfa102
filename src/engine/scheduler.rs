// ABOUTME: Event-driven scheduler running one graph to completion
// ABOUTME: Dispatches ready nodes as tasks, resolves dead paths and drains in-flight work on cancellation

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::context::{ExecutionContext, Scope};
use super::dependency::{DependencyExpr, Resolution};
use super::error::NodeError;
use super::executor::{self, NodeReport, Outcome};
use super::graph::Graph;
use super::result::{NodeStatus, RunResult, SkipReason};
use super::state::{RunSnapshot, RunState};

/// Messages executors send back to the scheduler that owns them.
#[derive(Debug)]
pub(crate) enum RunEvent {
    /// Admission granted, the node is now RUNNING.
    Started { node: String, at: DateTime<Utc> },
    Finished { node: String, report: NodeReport },
}

/// Runs one graph. Nested runs each get their own scheduler.
pub struct Scheduler {
    name: String,
    graph: Arc<Graph>,
    cx: ExecutionContext,
    publisher: Option<watch::Sender<RunSnapshot>>,
    timeout: Option<Duration>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, graph: Arc<Graph>, cx: ExecutionContext) -> Self {
        Self {
            name: name.into(),
            graph,
            cx,
            publisher: None,
            timeout: None,
        }
    }

    /// Publish status snapshots to observers as the run progresses.
    pub fn with_publisher(mut self, publisher: watch::Sender<RunSnapshot>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Cancel the run if it has not finished within `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Drive the graph until every node is terminal.
    ///
    /// Boxed because composite executors start nested schedulers.
    pub fn run(self) -> BoxFuture<'static, RunResult> {
        self.drive().boxed()
    }

    async fn drive(self) -> RunResult {
        let started_at = Utc::now();
        let mut state = RunState::new(&self.cx.run_id, &self.graph);
        if let Some(publisher) = self.publisher.clone() {
            state = state.with_publisher(publisher);
        }
        let mut scope = self.cx.scope.clone();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut cancelled = false;

        let deadline = self.timeout.map(|limit| Instant::now() + limit);
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        debug!(
            "Starting run '{}' at '{}' with {} nodes",
            self.name,
            display_path(&self.cx.path),
            self.graph.len()
        );

        loop {
            if !cancelled && !self.cx.cancel.is_cancelled() {
                self.resolve_dead_nodes(&mut state, &in_flight);
                self.dispatch_ready(&state, &scope, &events_tx, &mut tasks, &mut in_flight);
            }
            state.publish(false);

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cx.cancel.cancelled(), if !cancelled => {
                    info!(
                        "Run '{}' cancelled, waiting for {} running nodes",
                        self.name,
                        in_flight.len()
                    );
                    cancelled = true;
                }
                _ = &mut expiry, if !cancelled && deadline.is_some() => {
                    warn!(
                        "Run '{}' timed out after {:?}, cancelling",
                        self.name,
                        self.timeout.unwrap_or_default()
                    );
                    self.cx.cancel.cancel();
                    cancelled = true;
                }
                Some(event) = events.recv() => {
                    self.apply(event, &mut state, &mut scope, &mut in_flight);
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(err) = joined {
                        error!("Node task in run '{}' ended abnormally: {}", self.name, err);
                    }
                }
            }
        }

        let cancelled = cancelled || self.cx.cancel.is_cancelled();
        let leftover: Vec<String> = self
            .graph
            .node_ids()
            .filter(|id| !state.status(id).is_terminal())
            .map(String::from)
            .collect();
        if !leftover.is_empty() && !cancelled {
            warn!(
                "Run '{}' stopped with unresolved nodes: {:?}",
                self.name, leftover
            );
        }
        for id in leftover {
            if let Some(record) = state.record_mut(&id) {
                record.mark_cancelled(0);
            }
        }
        state.publish(true);

        let result = RunResult::new(
            self.cx.run_id.clone(),
            self.name.clone(),
            started_at,
            state.into_records(),
            self.graph.terminal_nodes().to_vec(),
            cancelled,
        );
        debug!(
            "Run '{}' finished with status {} in {:?}",
            self.name,
            result.status,
            result.duration()
        );
        result
    }

    /// Mark PENDING nodes whose expression can no longer hold as SKIPPED,
    /// repeating until nothing changes so skips cascade.
    fn resolve_dead_nodes(&self, state: &mut RunState, in_flight: &HashSet<String>) {
        loop {
            let mut changed = false;
            for node in self.graph.nodes() {
                if state.status(&node.id) != NodeStatus::Pending || in_flight.contains(&node.id) {
                    continue;
                }
                let Some(expr) = &node.dependency else {
                    continue;
                };
                if expr.resolve(&|id| state.status(id)) != Resolution::Unsatisfied {
                    continue;
                }

                let reason = skip_reason(expr, state);
                debug!("Skipping node '{}': {:?}", node.id, reason);
                if let Some(record) = state.record_mut(&node.id) {
                    changed |= record.mark_skipped(reason);
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn dispatch_ready(
        &self,
        state: &RunState,
        scope: &Scope,
        events: &mpsc::UnboundedSender<RunEvent>,
        tasks: &mut JoinSet<()>,
        in_flight: &mut HashSet<String>,
    ) {
        for node in self.graph.nodes() {
            if state.status(&node.id) != NodeStatus::Pending || in_flight.contains(&node.id) {
                continue;
            }
            let ready = node
                .dependency
                .as_ref()
                .map(|expr| expr.is_satisfied(&|id| state.status(id)))
                .unwrap_or(true);
            if !ready {
                continue;
            }

            debug!("Dispatching node '{}' ({})", node.id, node.kind_name());
            in_flight.insert(node.id.clone());

            let node = Arc::clone(node);
            let cx = ExecutionContext {
                scope: scope.clone(),
                cancel: self.cx.cancel.child_token(),
                ..self.cx.clone()
            };
            let events = events.clone();
            tasks.spawn(async move {
                let id = node.id.clone();
                let run = AssertUnwindSafe(executor::run_node(node, cx, events.clone()));
                // The executor reports its own outcome; only a panic is reported here.
                if let Err(panic) = run.catch_unwind().await {
                    let message = panic_message(panic.as_ref());
                    error!("Executor for node '{}' panicked: {}", id, message);
                    let report = NodeReport::failed(NodeError::Internal { message }, 1);
                    // The scheduler outlives its tasks unless the whole run was dropped.
                    let _ = events.send(RunEvent::Finished { node: id, report });
                }
            });
        }
    }

    fn apply(
        &self,
        event: RunEvent,
        state: &mut RunState,
        scope: &mut Scope,
        in_flight: &mut HashSet<String>,
    ) {
        match event {
            RunEvent::Started { node, at } => {
                if state.mark_started(&node, at) {
                    debug!("Node '{}' started", node);
                }
            }
            RunEvent::Finished { node, report } => {
                in_flight.remove(&node);
                let finished_at = report.finished_at;
                let Some(record) = state.record_mut(&node) else {
                    return;
                };
                match report.outcome {
                    Outcome::Success(value) => {
                        if record.mark_succeeded(value.clone(), report.attempts) {
                            record.stamp_finished(finished_at);
                            info!("Node '{}' succeeded", node);
                            scope.record_result(node.clone(), value);
                        }
                        for target in report.branch_skips {
                            if let Some(skipped) = state.record_mut(&target) {
                                if skipped.mark_skipped(SkipReason::BranchNotTaken {
                                    branch: node.clone(),
                                }) {
                                    debug!("Branch '{}' skipped '{}'", node, target);
                                }
                            }
                        }
                    }
                    Outcome::Failed(err) => {
                        error!(
                            "Node '{}' failed after {} attempt(s): {}",
                            node, report.attempts, err
                        );
                        if record.mark_failed(err, report.attempts) {
                            record.stamp_finished(finished_at);
                        }
                    }
                    Outcome::Cancelled => {
                        info!("Node '{}' cancelled", node);
                        if record.mark_cancelled(report.attempts) {
                            record.stamp_finished(finished_at);
                        }
                    }
                }
            }
        }
    }
}

/// Blocked when any referenced node failed, was cancelled or was itself
/// blocked; otherwise the path was closed by routing.
fn skip_reason(expr: &DependencyExpr, state: &RunState) -> SkipReason {
    let referenced: BTreeSet<&str> = expr.referenced_nodes().into_iter().collect();
    let blocked: Vec<String> = referenced
        .iter()
        .filter(|id| match state.record(id) {
            Some(record) => {
                matches!(record.status, NodeStatus::Failed | NodeStatus::Cancelled)
                    || record.is_blocked()
            }
            None => false,
        })
        .map(|id| id.to_string())
        .collect();

    if blocked.is_empty() {
        SkipReason::DeadPath {
            dependencies: referenced.into_iter().map(String::from).collect(),
        }
    } else {
        SkipReason::Blocked {
            dependencies: blocked,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "executor panicked".to_string()
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}
