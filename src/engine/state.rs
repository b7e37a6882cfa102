// ABOUTME: Per-run status table owned by a single scheduler
// ABOUTME: Publishes read-only snapshots to observers over a watch channel

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::watch;

use super::graph::Graph;
use super::result::{NodeRecord, NodeStatus};

/// Point-in-time view of a run's node statuses.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub nodes: IndexMap<String, NodeStatus>,
    pub finished: bool,
}

impl RunSnapshot {
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|s| **s == status).count()
    }
}

/// Read-only handle on a running run.
#[derive(Debug, Clone)]
pub struct RunObserver {
    receiver: watch::Receiver<RunSnapshot>,
}

impl RunObserver {
    pub(crate) fn new(receiver: watch::Receiver<RunSnapshot>) -> Self {
        Self { receiver }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.receiver.borrow().nodes.get(node_id).copied()
    }

    pub fn is_finished(&self) -> bool {
        self.receiver.borrow().finished
    }

    /// Whether a snapshot was published since this observer last looked.
    pub fn has_changed(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }

    /// Wait for the next published snapshot. Returns false once the run has
    /// gone away and nothing more will be published.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Wait until `predicate` holds for a snapshot, returning that snapshot.
    /// Returns None if the run ends without it ever holding.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<RunSnapshot>
    where
        F: FnMut(&RunSnapshot) -> bool,
    {
        self.receiver
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .ok()
            .map(|snapshot| snapshot.clone())
    }
}

/// Status, result and error of every node in one run. Only the owning
/// scheduler mutates it.
#[derive(Debug)]
pub(crate) struct RunState {
    run_id: String,
    records: IndexMap<String, NodeRecord>,
    publisher: Option<watch::Sender<RunSnapshot>>,
}

impl RunState {
    pub fn new(run_id: &str, graph: &Graph) -> Self {
        let records = graph
            .nodes()
            .map(|node| (node.id.clone(), NodeRecord::new(&node.id, node.kind_name())))
            .collect();
        Self {
            run_id: run_id.to_string(),
            records,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: watch::Sender<RunSnapshot>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn status(&self, node_id: &str) -> NodeStatus {
        self.records
            .get(node_id)
            .map(|r| r.status)
            .unwrap_or(NodeStatus::Pending)
    }

    pub fn record(&self, node_id: &str) -> Option<&NodeRecord> {
        self.records.get(node_id)
    }

    pub fn record_mut(&mut self, node_id: &str) -> Option<&mut NodeRecord> {
        self.records.get_mut(node_id)
    }

    pub fn mark_started(&mut self, node_id: &str, at: DateTime<Utc>) -> bool {
        self.records
            .get_mut(node_id)
            .map(|r| r.mark_started(at))
            .unwrap_or(false)
    }

    pub fn snapshot(&self, finished: bool) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            nodes: self
                .records
                .iter()
                .map(|(id, r)| (id.clone(), r.status))
                .collect(),
            finished,
        }
    }

    /// Push the current statuses to observers when they differ from the
    /// last published snapshot. Returns whether observers were notified.
    pub fn publish(&self, finished: bool) -> bool {
        let Some(publisher) = &self.publisher else {
            return false;
        };
        publisher.send_if_modified(|current| {
            if self.matches(current, finished) {
                return false;
            }
            *current = self.snapshot(finished);
            true
        })
    }

    fn matches(&self, snapshot: &RunSnapshot, finished: bool) -> bool {
        snapshot.finished == finished
            && snapshot.run_id == self.run_id
            && snapshot.nodes.len() == self.records.len()
            && self
                .records
                .iter()
                .zip(snapshot.nodes.iter())
                .all(|((id, record), (seen, status))| id == seen && record.status == *status)
    }

    pub fn into_records(self) -> IndexMap<String, NodeRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{NodeDefinition, TaskDefinition};
    use serde_json::json;

    fn graph() -> Graph {
        let definition = TaskDefinition::new("state")
            .with_node("a", NodeDefinition::action("echo", json!({})))
            .with_node("b", NodeDefinition::action("echo", json!({})));
        Graph::build(&definition).unwrap()
    }

    #[tokio::test]
    async fn test_observer_sees_published_statuses() {
        let graph = graph();
        let (tx, rx) = watch::channel(RunSnapshot::default());
        let mut state = RunState::new("run-1", &graph).with_publisher(tx);
        let mut observer = RunObserver::new(rx);

        assert!(state.mark_started("a", Utc::now()));
        assert!(state.publish(false));

        assert!(observer.changed().await);
        assert_eq!(observer.status_of("a"), Some(NodeStatus::Running));
        assert_eq!(observer.status_of("b"), Some(NodeStatus::Pending));
        assert!(!observer.is_finished());

        // Nothing changed, so observers are not woken.
        assert!(!state.publish(false));
        assert!(!observer.has_changed());

        state.record_mut("a").unwrap().mark_succeeded(json!(null), 1);
        state.record_mut("b").unwrap().mark_cancelled(0);
        assert!(state.publish(true));

        let done = observer.wait_for(|s| s.finished).await.unwrap();
        assert_eq!(done.run_id, "run-1");
        assert_eq!(done.count(NodeStatus::Success), 1);
        assert_eq!(done.count(NodeStatus::Cancelled), 1);
    }
}
