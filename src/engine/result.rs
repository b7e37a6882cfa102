// ABOUTME: Node records and run results produced by the scheduler
// ABOUTME: Holds per-node terminal status, result or error, skip reasons and run-level aggregation

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::error::NodeError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why a node ended SKIPPED without running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A branch selected a different target.
    BranchNotTaken { branch: String },
    /// The dependency expression became false with no failure involved.
    DeadPath { dependencies: Vec<String> },
    /// A required dependency failed, was cancelled, or was itself blocked.
    Blocked { dependencies: Vec<String> },
}

impl SkipReason {
    /// Skips that are part of normal routing rather than fallout from a failure.
    pub fn is_by_design(&self) -> bool {
        !matches!(self, SkipReason::Blocked { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub kind: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn new(node_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind: kind.into(),
            status: NodeStatus::Pending,
            result: None,
            error: None,
            skip_reason: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// PENDING -> RUNNING once admission is granted. Returns false if the
    /// record has already moved on.
    pub fn mark_started(&mut self, at: DateTime<Utc>) -> bool {
        if self.status != NodeStatus::Pending {
            return false;
        }
        self.status = NodeStatus::Running;
        self.started_at = Some(at);
        true
    }

    pub fn mark_succeeded(&mut self, result: Value, attempts: u32) -> bool {
        if !self.finish(NodeStatus::Success) {
            return false;
        }
        self.result = Some(result);
        self.attempts = attempts;
        true
    }

    pub fn mark_failed(&mut self, error: NodeError, attempts: u32) -> bool {
        if !self.finish(NodeStatus::Failed) {
            return false;
        }
        self.error = Some(error);
        self.attempts = attempts;
        true
    }

    pub fn mark_skipped(&mut self, reason: SkipReason) -> bool {
        if !self.finish(NodeStatus::Skipped) {
            return false;
        }
        self.skip_reason = Some(reason);
        true
    }

    pub fn mark_cancelled(&mut self, attempts: u32) -> bool {
        if !self.finish(NodeStatus::Cancelled) {
            return false;
        }
        self.error = Some(NodeError::Cancelled);
        self.attempts = attempts;
        true
    }

    // Terminal statuses are written once.
    fn finish(&mut self, status: NodeStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Use the time the executor finished rather than when the scheduler
    /// heard about it. Never earlier than the start.
    pub(crate) fn stamp_finished(&mut self, at: DateTime<Utc>) {
        let at = match self.started_at {
            Some(start) if at < start => start,
            _ => at,
        };
        self.finished_at = Some(at);
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == NodeStatus::Success
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.skip_reason, Some(SkipReason::Blocked { .. }))
    }

    /// SUCCESS, or skipped by a routing decision.
    pub fn is_acceptable_terminal(&self) -> bool {
        match self.status {
            NodeStatus::Success => true,
            NodeStatus::Skipped => self
                .skip_reason
                .as_ref()
                .map(|r| r.is_by_design())
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub total_nodes: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub success_rate: f64,
}

impl RunSummary {
    fn from_records<'a>(records: impl Iterator<Item = &'a NodeRecord>) -> Self {
        let mut summary = RunSummary::default();
        for record in records {
            summary.total_nodes += 1;
            match record.status {
                NodeStatus::Success => summary.succeeded += 1,
                NodeStatus::Failed => summary.failed += 1,
                NodeStatus::Skipped if record.is_blocked() => summary.blocked += 1,
                NodeStatus::Skipped => summary.skipped += 1,
                NodeStatus::Cancelled => summary.cancelled += 1,
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }
        summary.success_rate = if summary.total_nodes > 0 {
            summary.succeeded as f64 / summary.total_nodes as f64 * 100.0
        } else {
            0.0
        };
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: IndexMap<String, NodeRecord>,
    pub terminal_nodes: Vec<String>,
    pub summary: RunSummary,
}

impl RunResult {
    /// Assemble the final result. `cancelled` wins over node outcomes.
    pub fn new(
        run_id: String,
        name: String,
        started_at: DateTime<Utc>,
        nodes: IndexMap<String, NodeRecord>,
        terminal_nodes: Vec<String>,
        cancelled: bool,
    ) -> Self {
        let status = if cancelled {
            RunStatus::Cancelled
        } else if terminal_nodes
            .iter()
            .all(|id| nodes.get(id).map(|r| r.is_acceptable_terminal()).unwrap_or(false))
        {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        let summary = RunSummary::from_records(nodes.values());

        Self {
            run_id,
            name,
            status,
            started_at,
            finished_at: Utc::now(),
            nodes,
            terminal_nodes,
            summary,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn get_node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|r| r.status)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// The value a run hands to its parent: the single terminal node's
    /// result, or an object keyed by terminal node id.
    pub fn output(&self) -> Value {
        if let [only] = self.terminal_nodes.as_slice() {
            return self
                .nodes
                .get(only)
                .and_then(|r| r.result.clone())
                .unwrap_or(Value::Null);
        }

        let mut out = serde_json::Map::new();
        for id in &self.terminal_nodes {
            if let Some(result) = self.nodes.get(id).and_then(|r| r.result.clone()) {
                out.insert(id.clone(), result);
            }
        }
        Value::Object(out)
    }

    /// First node, in definition order, that failed in its own right.
    pub fn first_failure(&self) -> Option<(&str, &NodeError)> {
        self.nodes.values().find_map(|r| match (&r.status, &r.error) {
            (NodeStatus::Failed, Some(err)) => Some((r.node_id.as_str(), err)),
            _ => None,
        })
    }

    /// Errors of every node that failed in its own right.
    pub fn failures(&self) -> Vec<(&str, &NodeError)> {
        self.nodes
            .values()
            .filter_map(|r| match (&r.status, &r.error) {
                (NodeStatus::Failed, Some(err)) => Some((r.node_id.as_str(), err)),
                _ => None,
            })
            .collect()
    }

    /// Error describing why a failed run failed, for use by an enclosing node.
    pub fn failure_error(&self) -> NodeError {
        match self.first_failure() {
            Some((step, error)) => NodeError::Step {
                step: step.to_string(),
                source: Box::new(error.clone()),
            },
            None => NodeError::Incomplete {
                terminal: self
                    .terminal_nodes
                    .iter()
                    .filter(|id| {
                        !self
                            .nodes
                            .get(*id)
                            .map(|r| r.is_acceptable_terminal())
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(entries: Vec<NodeRecord>) -> IndexMap<String, NodeRecord> {
        entries
            .into_iter()
            .map(|r| (r.node_id.clone(), r))
            .collect()
    }

    #[test]
    fn test_terminal_status_is_write_once() {
        let mut record = NodeRecord::new("a", "action");
        assert!(record.mark_started(Utc::now()));
        assert!(record.mark_succeeded(json!(1), 1));
        assert!(!record.mark_failed(NodeError::Cancelled, 2));
        assert!(!record.mark_skipped(SkipReason::DeadPath {
            dependencies: vec![]
        }));
        assert_eq!(record.status, NodeStatus::Success);
        assert_eq!(record.result, Some(json!(1)));
        assert!(record.error.is_none());
        assert!(!record.mark_started(Utc::now()));
    }

    #[test]
    fn test_cancelled_record_carries_error() {
        let mut record = NodeRecord::new("a", "action");
        assert!(record.mark_cancelled(0));
        assert_eq!(record.status, NodeStatus::Cancelled);
        assert_eq!(record.error, Some(NodeError::Cancelled));
    }

    #[test]
    fn test_run_status_accepts_by_design_skips() {
        let mut done = NodeRecord::new("done", "action");
        done.mark_succeeded(json!("ok"), 1);
        let mut routed = NodeRecord::new("routed", "action");
        routed.mark_skipped(SkipReason::BranchNotTaken {
            branch: "pick".to_string(),
        });

        let result = RunResult::new(
            "run".to_string(),
            "test".to_string(),
            Utc::now(),
            records(vec![done, routed]),
            vec!["done".to_string(), "routed".to_string()],
            false,
        );
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.output(), json!({ "done": "ok" }));
    }

    #[test]
    fn test_run_status_fails_on_blocked_terminal() {
        let mut root = NodeRecord::new("root", "action");
        root.mark_failed(
            NodeError::Execution {
                action: "fail".to_string(),
                message: "boom".to_string(),
            },
            1,
        );
        let mut leaf = NodeRecord::new("leaf", "action");
        leaf.mark_skipped(SkipReason::Blocked {
            dependencies: vec!["root".to_string()],
        });

        let result = RunResult::new(
            "run".to_string(),
            "test".to_string(),
            Utc::now(),
            records(vec![root, leaf]),
            vec!["leaf".to_string()],
            false,
        );
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.blocked, 1);

        match result.failure_error() {
            NodeError::Step { step, source } => {
                assert_eq!(step, "root");
                assert!(source.to_string().contains("boom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_run_status() {
        let result = RunResult::new(
            "run".to_string(),
            "test".to_string(),
            Utc::now(),
            records(vec![NodeRecord::new("a", "action")]),
            vec!["a".to_string()],
            true,
        );
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.output(), Value::Null);
    }
}
