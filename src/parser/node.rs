// ABOUTME: Declarative node definitions as they appear in task files
// ABOUTME: Covers node kinds, nested sub-graphs, retry settings and resource tags

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::engine::dependency::DependencyExpr;

/// One node of a task definition. The node id is the key in the enclosing map
/// (or the `id` field of a step in a list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(flatten)]
    pub kind: NodeKindDefinition,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependencyExpr>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,

    #[serde(default, alias = "retry_config", skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryDefinition>,

    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Run once retries are exhausted, with the failure bound as `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<SubGraphDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKindDefinition {
    Action {
        action: String,
        #[serde(default)]
        params: Value,
    },

    Sequence {
        steps: SubGraphDefinition,
    },

    #[serde(alias = "for_each")]
    ParallelForEach {
        items: Value,
        #[serde(rename = "as", alias = "item_name", default = "default_item_binding")]
        binding: String,
        template: SubGraphDefinition,
    },

    #[serde(alias = "loop")]
    ConditionalLoop {
        condition: Value,
        #[serde(default)]
        max_iterations: Option<u32>,
        body: SubGraphDefinition,
    },

    Branch {
        branches: Vec<BranchArmDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Targets>,
    },

    Guarded {
        body: SubGraphDefinition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recovery: Option<SubGraphDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        always: Option<SubGraphDefinition>,
    },
}

fn default_item_binding() -> String {
    "item".to_string()
}

impl NodeKindDefinition {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKindDefinition::Action { .. } => "action",
            NodeKindDefinition::Sequence { .. } => "sequence",
            NodeKindDefinition::ParallelForEach { .. } => "parallel_for_each",
            NodeKindDefinition::ConditionalLoop { .. } => "conditional_loop",
            NodeKindDefinition::Branch { .. } => "branch",
            NodeKindDefinition::Guarded { .. } => "guarded",
        }
    }
}

/// A nested graph: either an ordered list of steps run one after another,
/// or a full node map with optional terminal nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubGraphDefinition {
    Steps(Vec<StepDefinition>),
    Graph {
        nodes: IndexMap<String, NodeDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminal_nodes: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(flatten)]
    pub node: NodeDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArmDefinition {
    pub when: Value,
    #[serde(alias = "then")]
    pub target: Targets,
}

/// One node id or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    One(String),
    Many(Vec<String>),
}

impl Targets {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Targets::One(id) => vec![id.clone()],
            Targets::Many(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefinition {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", alias = "initial_delay", default = "default_delay")]
    pub delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<Duration>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

impl NodeDefinition {
    pub fn new(kind: NodeKindDefinition) -> Self {
        Self {
            description: None,
            kind,
            depends_on: None,
            resources: Vec::new(),
            retry: None,
            timeout: None,
            on_failure: None,
        }
    }

    pub fn action(action: impl Into<String>, params: Value) -> Self {
        Self::new(NodeKindDefinition::Action {
            action: action.into(),
            params,
        })
    }

    pub fn depends_on(mut self, expr: DependencyExpr) -> Self {
        self.depends_on = Some(expr);
        self
    }

    pub fn with_resources<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retry = Some(RetryDefinition {
            max_attempts,
            delay,
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: None,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_failure(mut self, handler: SubGraphDefinition) -> Self {
        self.on_failure = Some(handler);
        self
    }

    pub fn step(self, id: impl Into<String>) -> StepDefinition {
        StepDefinition {
            id: id.into(),
            node: self,
        }
    }
}
