// ABOUTME: Top-level task definition and the YAML loader producing it
// ABOUTME: Accepts the node-map form or the legacy ordered step list

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tokio::fs;
use tracing::debug;

use super::error::{ParserError, Result};
use super::node::{NodeDefinition, StepDefinition};

/// A declarative task: a named graph of nodes plus initial variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Bindings visible to every template in the run.
    #[serde(default)]
    pub variables: Map<String, Value>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub nodes: IndexMap<String, NodeDefinition>,

    /// Legacy linear form, run as a single sequence node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepDefinition>>,

    /// Nodes whose outcome decides the run status. Defaults to nodes nothing
    /// else depends on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_nodes: Option<Vec<String>>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            variables: Map::new(),
            nodes: IndexMap::new(),
            steps: None,
            terminal_nodes: None,
        }
    }

    pub fn with_node(mut self, id: impl Into<String>, node: NodeDefinition) -> Self {
        self.nodes.insert(id.into(), node);
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepDefinition>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_terminal_nodes<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminal_nodes = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_legacy(&self) -> bool {
        self.nodes.is_empty() && self.steps.is_some()
    }

    /// Parse from a YAML string and check the basic shape.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: TaskDefinition = serde_yaml::from_str(content)?;
        definition.validate_structure()?;
        Ok(definition)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate_structure(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ParserError::MissingField("name".to_string()));
        }

        match (self.nodes.is_empty(), &self.steps) {
            (false, Some(_)) => Err(ParserError::InvalidFormat(
                "'nodes' and 'steps' cannot both be set".to_string(),
            )),
            (true, None) => Err(ParserError::MissingField("nodes".to_string())),
            _ => Ok(()),
        }
    }
}

pub struct WorkflowParser;

impl WorkflowParser {
    pub fn new() -> Self {
        Self
    }

    /// Read and parse a task definition file.
    pub async fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<TaskDefinition> {
        let path = path.as_ref();
        debug!("Parsing task definition: {}", path.display());
        let content = fs::read_to_string(path).await?;
        self.parse_str(&content)
    }

    pub fn parse_str(&self, content: &str) -> Result<TaskDefinition> {
        TaskDefinition::from_yaml(content)
    }
}

impl Default for WorkflowParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_node_map() {
        let yaml = r#"
name: nightly
variables:
  region: eu
  replicas: 3
nodes:
  fetch:
    type: action
    action: echo
  report:
    type: action
    action: echo
    depends_on: fetch
terminal_nodes: [report]
"#;
        let definition = TaskDefinition::from_yaml(yaml).unwrap();
        assert_eq!(definition.name, "nightly");
        assert_eq!(definition.variables["replicas"], json!(3));
        assert_eq!(definition.nodes.len(), 2);
        assert_eq!(
            definition.nodes.keys().collect::<Vec<_>>(),
            vec!["fetch", "report"]
        );
        assert!(!definition.is_legacy());
    }

    #[test]
    fn test_parse_legacy_steps() {
        let yaml = r#"
name: legacy
steps:
  - id: one
    type: action
    action: echo
  - id: two
    type: action
    action: echo
"#;
        let definition = TaskDefinition::from_yaml(yaml).unwrap();
        assert!(definition.is_legacy());
        assert_eq!(definition.steps.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_nodes_is_rejected() {
        let result = TaskDefinition::from_yaml("name: empty\n");
        assert!(matches!(result, Err(ParserError::MissingField(field)) if field == "nodes"));
    }

    #[test]
    fn test_both_forms_rejected() {
        let yaml = r#"
name: both
nodes:
  a: { type: action, action: echo }
steps:
  - { id: b, type: action, action: echo }
"#;
        assert!(matches!(
            TaskDefinition::from_yaml(yaml),
            Err(ParserError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_yaml_round_trip_keeps_structure() {
        let definition = TaskDefinition::new("roundtrip")
            .with_node("a", NodeDefinition::action("echo", json!({ "x": 1 })));
        let yaml = definition.to_yaml().unwrap();
        let parsed = TaskDefinition::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.nodes.len(), 1);
        assert!(parsed.nodes.contains_key("a"));
    }
}
