// ABOUTME: Builds validated execution graphs from task definitions
// ABOUTME: Rejects unknown references, dependency cycles and resource nesting that could deadlock

use indexmap::IndexMap;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::dependency::DependencyExpr;
use super::error::{ValidationError, ValidationErrors};
use super::retry::RetryPolicy;
use crate::parser::{NodeDefinition, NodeKindDefinition, SubGraphDefinition, TaskDefinition};

/// Node id given to the sequence wrapping a legacy step list.
pub const LEGACY_SEQUENCE_ID: &str = "steps";

/// Iteration cap for loops that do not declare one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 1000;

/// Bindings the engine sets itself inside nested runs.
const RESERVED_BINDINGS: &[&str] = &["results", "index", "iteration", "last", "error"];

#[derive(Debug)]
pub struct BranchArm {
    pub condition: Value,
    pub targets: Vec<String>,
}

#[derive(Debug)]
pub enum NodeKind {
    Action {
        action: String,
        params: Value,
    },
    Sequence {
        body: Arc<Graph>,
    },
    ParallelForEach {
        items: Value,
        binding: String,
        template: Arc<Graph>,
    },
    ConditionalLoop {
        condition: Value,
        max_iterations: u32,
        body: Arc<Graph>,
    },
    Branch {
        arms: Vec<BranchArm>,
        default: Vec<String>,
    },
    Guarded {
        body: Arc<Graph>,
        recovery: Option<Arc<Graph>>,
        always: Option<Arc<Graph>>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Action { .. } => "action",
            NodeKind::Sequence { .. } => "sequence",
            NodeKind::ParallelForEach { .. } => "parallel_for_each",
            NodeKind::ConditionalLoop { .. } => "conditional_loop",
            NodeKind::Branch { .. } => "branch",
            NodeKind::Guarded { .. } => "guarded",
        }
    }

    fn subgraphs(&self) -> Vec<&Arc<Graph>> {
        match self {
            NodeKind::Action { .. } | NodeKind::Branch { .. } => Vec::new(),
            NodeKind::Sequence { body } | NodeKind::ConditionalLoop { body, .. } => vec![body],
            NodeKind::ParallelForEach { template, .. } => vec![template],
            NodeKind::Guarded {
                body,
                recovery,
                always,
            } => {
                let mut graphs = vec![body];
                graphs.extend(recovery.iter());
                graphs.extend(always.iter());
                graphs
            }
        }
    }
}

/// An immutable, validated node. Per-run status lives in the scheduler.
#[derive(Debug)]
pub struct Node {
    pub id: String,
    pub description: Option<String>,
    pub kind: NodeKind,
    /// Effective gate, including the implicit wait on any branch targeting
    /// this node.
    pub dependency: Option<DependencyExpr>,
    pub resource_tags: BTreeSet<String>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub failure_handler: Option<Arc<Graph>>,
}

impl Node {
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_action(&self) -> bool {
        matches!(self.kind, NodeKind::Action { .. })
    }
}

#[derive(Debug)]
pub struct Graph {
    nodes: IndexMap<String, Arc<Node>>,
    topology: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    terminal_nodes: Vec<String>,
}

impl Graph {
    /// Build and validate with default settings.
    pub fn build(definition: &TaskDefinition) -> Result<Graph, ValidationErrors> {
        GraphBuilder::new().build(definition)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    /// Nodes in definition order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn terminal_nodes(&self) -> &[String] {
        &self.terminal_nodes
    }

    /// Nodes without dependencies.
    pub fn root_nodes(&self) -> Vec<&str> {
        self.nodes_without(Direction::Incoming)
    }

    /// Nodes nothing depends on.
    pub fn sink_nodes(&self) -> Vec<&str> {
        self.nodes_without(Direction::Outgoing)
    }

    fn nodes_without(&self, direction: Direction) -> Vec<&str> {
        self.nodes
            .keys()
            .filter(|id| {
                self.indices
                    .get(*id)
                    .map(|idx| {
                        self.topology
                            .neighbors_directed(*idx, direction)
                            .next()
                            .is_none()
                    })
                    .unwrap_or(true)
            })
            .map(String::as_str)
            .collect()
    }

    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&str> {
        let Some(idx) = self.indices.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<&str> = self
            .topology
            .neighbors_directed(*idx, direction)
            .map(|n| self.topology[n].as_str())
            .collect();
        // petgraph yields neighbours newest-edge first
        found.reverse();
        found
    }

    /// A dependency-respecting order of node ids.
    pub fn topological_order(&self) -> Vec<&str> {
        match toposort(&self.topology, None) {
            Ok(order) => order
                .into_iter()
                .map(|idx| self.topology[idx].as_str())
                .collect(),
            Err(_) => self.node_ids().collect(),
        }
    }

    /// Node count including every nested sub-graph.
    pub fn total_nodes(&self) -> usize {
        self.nodes
            .values()
            .map(|node| {
                1 + node
                    .kind
                    .subgraphs()
                    .iter()
                    .map(|g| g.total_nodes())
                    .sum::<usize>()
                    + node
                        .failure_handler
                        .as_ref()
                        .map(|g| g.total_nodes())
                        .unwrap_or(0)
            })
            .sum()
    }
}

/// Turns definitions into graphs, collecting every validation error.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    default_max_iterations: u32,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_default_max_iterations(mut self, max_iterations: u32) -> Self {
        self.default_max_iterations = max_iterations;
        self
    }

    pub fn build(&self, definition: &TaskDefinition) -> Result<Graph, ValidationErrors> {
        let mut cx = BuildContext {
            errors: Vec::new(),
            tag_order: TagOrder::default(),
            default_max_iterations: self.default_max_iterations,
        };

        let graph = match (&definition.steps, definition.nodes.is_empty()) {
            (Some(steps), true) => {
                let wrapper = NodeDefinition::new(NodeKindDefinition::Sequence {
                    steps: SubGraphDefinition::Steps(steps.clone()),
                });
                let mut nodes = IndexMap::new();
                nodes.insert(LEGACY_SEQUENCE_ID.to_string(), wrapper);
                cx.build_graph("", &nodes, None, &BTreeSet::new())
            }
            _ => cx.build_graph(
                "",
                &definition.nodes,
                definition.terminal_nodes.as_deref(),
                &BTreeSet::new(),
            ),
        };

        cx.check_tag_order();

        if cx.errors.is_empty() {
            debug!(
                "Built graph '{}' with {} nodes ({} including nested)",
                definition.name,
                graph.len(),
                graph.total_nodes()
            );
            Ok(graph)
        } else {
            Err(ValidationErrors(cx.errors))
        }
    }
}

fn qualify(path: &str, id: &str) -> String {
    if path.is_empty() {
        id.to_string()
    } else {
        format!("{}/{}", path, id)
    }
}

/// Records "outer tag is held while inner tag is requested" pairs.
#[derive(Default)]
struct TagOrder {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl TagOrder {
    fn index(&mut self, tag: &str) -> NodeIndex {
        if let Some(idx) = self.indices.get(tag) {
            return *idx;
        }
        let idx = self.graph.add_node(tag.to_string());
        self.indices.insert(tag.to_string(), idx);
        idx
    }

    fn record(&mut self, outer: &str, inner: &str) {
        let a = self.index(outer);
        let b = self.index(inner);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }
}

struct BuildContext {
    errors: Vec<ValidationError>,
    tag_order: TagOrder,
    default_max_iterations: u32,
}

impl BuildContext {
    fn invalid(&mut self, node: String, reason: impl Into<String>) {
        self.errors.push(ValidationError::InvalidNode {
            node,
            reason: reason.into(),
        });
    }

    fn build_graph(
        &mut self,
        path: &str,
        definitions: &IndexMap<String, NodeDefinition>,
        terminal_nodes: Option<&[String]>,
        enclosing: &BTreeSet<String>,
    ) -> Graph {
        if definitions.is_empty() {
            self.errors.push(ValidationError::EmptyGraph {
                path: if path.is_empty() {
                    "<root>".to_string()
                } else {
                    path.to_string()
                },
            });
        }

        let mut drafts: IndexMap<String, Node> = IndexMap::new();
        for (id, definition) in definitions {
            let node = self.build_node(path, id, definition, enclosing);
            drafts.insert(id.clone(), node);
        }

        // Every leaf must name a node of this graph.
        for (id, node) in &drafts {
            if let Some(expr) = &node.dependency {
                for dependency in expr.referenced_nodes() {
                    if !drafts.contains_key(dependency) {
                        self.errors.push(ValidationError::UnknownDependency {
                            node: qualify(path, id),
                            dependency: dependency.to_string(),
                        });
                    }
                }
            }
        }

        // Branch targets wait for their branch to decide.
        let mut gates: IndexMap<String, Vec<String>> = IndexMap::new();
        for (id, node) in &drafts {
            if let NodeKind::Branch { arms, default } = &node.kind {
                let mut seen = HashSet::new();
                let targets = arms
                    .iter()
                    .flat_map(|arm| arm.targets.iter())
                    .chain(default.iter());
                for target in targets {
                    if !seen.insert(target.as_str()) {
                        continue;
                    }
                    if target == id {
                        self.invalid(qualify(path, id), "branch cannot target itself");
                    } else if !drafts.contains_key(target) {
                        self.errors.push(ValidationError::UnknownBranchTarget {
                            branch: qualify(path, id),
                            target: target.clone(),
                        });
                    } else {
                        gates.entry(target.clone()).or_default().push(id.clone());
                    }
                }
            }
        }
        for (target, branches) in gates {
            if let Some(node) = drafts.get_mut(&target) {
                let gate = DependencyExpr::all(branches);
                node.dependency = Some(match node.dependency.take() {
                    Some(declared) => declared.and(gate),
                    None => gate,
                });
            }
        }

        for cycle in find_cycles(&drafts) {
            self.errors.push(ValidationError::CyclicDependency {
                cycle: cycle.iter().map(|id| qualify(path, id)).collect(),
            });
        }

        let mut topology = DiGraph::new();
        let mut indices = HashMap::new();
        for id in drafts.keys() {
            indices.insert(id.clone(), topology.add_node(id.clone()));
        }
        for (id, node) in &drafts {
            if let Some(expr) = &node.dependency {
                for dependency in expr.referenced_nodes() {
                    if let (Some(from), Some(to)) = (indices.get(dependency), indices.get(id)) {
                        topology.add_edge(*from, *to, ());
                    }
                }
            }
        }

        let mut graph = Graph {
            nodes: drafts
                .into_iter()
                .map(|(id, node)| (id, Arc::new(node)))
                .collect(),
            topology,
            indices,
            terminal_nodes: Vec::new(),
        };

        graph.terminal_nodes = match terminal_nodes {
            Some(declared) => {
                for id in declared {
                    if graph.node(id).is_none() {
                        self.errors.push(ValidationError::UnknownTerminalNode {
                            node: qualify(path, id),
                        });
                    }
                }
                declared.to_vec()
            }
            None => graph.sink_nodes().into_iter().map(String::from).collect(),
        };

        graph
    }

    fn build_node(
        &mut self,
        path: &str,
        id: &str,
        definition: &NodeDefinition,
        enclosing: &BTreeSet<String>,
    ) -> Node {
        let qualified = qualify(path, id);

        let resource_tags: BTreeSet<String> = definition.resources.iter().cloned().collect();
        for tag in &resource_tags {
            if enclosing.contains(tag) {
                self.errors.push(ValidationError::ReentrantResourceTag {
                    node: qualified.clone(),
                    tag: tag.clone(),
                });
            } else {
                for outer in enclosing {
                    self.tag_order.record(outer, tag);
                }
            }
        }

        let retry = match &definition.retry {
            Some(retry) => {
                if retry.max_attempts == 0 {
                    self.invalid(qualified.clone(), "retry max_attempts must be at least 1");
                }
                if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier > 0.0) {
                    self.invalid(qualified.clone(), "retry backoff_multiplier must be positive");
                }
                RetryPolicy::from(retry)
            }
            None => RetryPolicy::default(),
        };

        if definition.timeout == Some(Duration::ZERO) {
            self.invalid(qualified.clone(), "timeout must be greater than zero");
        }

        if let Some(expr) = &definition.depends_on {
            if expr.has_empty_group() {
                self.invalid(qualified.clone(), "dependency expression has an empty group");
            }
        }

        let mut held = enclosing.clone();
        held.extend(resource_tags.iter().cloned());
        let kind = self.build_kind(&qualified, &definition.kind, &held);

        // Handlers run while the node still holds its tags.
        let failure_handler = definition.on_failure.as_ref().map(|handler| {
            self.build_subgraph(&format!("{}/on_failure", qualified), handler, &held)
        });

        Node {
            id: id.to_string(),
            description: definition.description.clone(),
            kind,
            dependency: definition.depends_on.clone(),
            resource_tags,
            retry,
            timeout: definition.timeout,
            failure_handler,
        }
    }

    fn build_kind(
        &mut self,
        qualified: &str,
        kind: &NodeKindDefinition,
        held: &BTreeSet<String>,
    ) -> NodeKind {
        let child = |label: &str| format!("{}/{}", qualified, label);

        match kind {
            NodeKindDefinition::Action { action, params } => {
                if action.trim().is_empty() {
                    self.invalid(qualified.to_string(), "action name cannot be empty");
                }
                NodeKind::Action {
                    action: action.clone(),
                    params: params.clone(),
                }
            }
            NodeKindDefinition::Sequence { steps } => NodeKind::Sequence {
                body: self.build_subgraph(&child("steps"), steps, held),
            },
            NodeKindDefinition::ParallelForEach {
                items,
                binding,
                template,
            } => {
                if binding.trim().is_empty() {
                    self.invalid(qualified.to_string(), "item binding name cannot be empty");
                } else if RESERVED_BINDINGS.contains(&binding.as_str()) {
                    self.invalid(
                        qualified.to_string(),
                        format!("item binding name '{}' is reserved", binding),
                    );
                }
                NodeKind::ParallelForEach {
                    items: items.clone(),
                    binding: binding.clone(),
                    template: self.build_subgraph(&child("template"), template, held),
                }
            }
            NodeKindDefinition::ConditionalLoop {
                condition,
                max_iterations,
                body,
            } => {
                let max_iterations = max_iterations.unwrap_or(self.default_max_iterations);
                if max_iterations == 0 {
                    self.invalid(qualified.to_string(), "max_iterations must be at least 1");
                }
                NodeKind::ConditionalLoop {
                    condition: condition.clone(),
                    max_iterations,
                    body: self.build_subgraph(&child("body"), body, held),
                }
            }
            NodeKindDefinition::Branch { branches, default } => {
                if branches.is_empty() && default.is_none() {
                    self.invalid(
                        qualified.to_string(),
                        "branch needs at least one arm or a default",
                    );
                }
                NodeKind::Branch {
                    arms: branches
                        .iter()
                        .map(|arm| BranchArm {
                            condition: arm.when.clone(),
                            targets: arm.target.to_vec(),
                        })
                        .collect(),
                    default: default.as_ref().map(|t| t.to_vec()).unwrap_or_default(),
                }
            }
            NodeKindDefinition::Guarded {
                body,
                recovery,
                always,
            } => NodeKind::Guarded {
                body: self.build_subgraph(&child("body"), body, held),
                recovery: recovery
                    .as_ref()
                    .map(|g| self.build_subgraph(&child("recovery"), g, held)),
                always: always
                    .as_ref()
                    .map(|g| self.build_subgraph(&child("always"), g, held)),
            },
        }
    }

    fn build_subgraph(
        &mut self,
        path: &str,
        definition: &SubGraphDefinition,
        enclosing: &BTreeSet<String>,
    ) -> Arc<Graph> {
        let graph = match definition {
            SubGraphDefinition::Steps(steps) => {
                let mut nodes: IndexMap<String, NodeDefinition> = IndexMap::new();
                let mut previous: Option<&str> = None;
                for step in steps {
                    if nodes.contains_key(&step.id) {
                        self.errors.push(ValidationError::DuplicateNode {
                            node: qualify(path, &step.id),
                        });
                        continue;
                    }
                    let mut node = step.node.clone();
                    if let Some(prev) = previous {
                        let chain = DependencyExpr::leaf(prev);
                        node.depends_on = Some(match node.depends_on.take() {
                            Some(declared) => chain.and(declared),
                            None => chain,
                        });
                    }
                    nodes.insert(step.id.clone(), node);
                    previous = Some(step.id.as_str());
                }
                let terminal: Vec<String> =
                    previous.map(|id| vec![id.to_string()]).unwrap_or_default();
                self.build_graph(path, &nodes, Some(terminal.as_slice()), enclosing)
            }
            SubGraphDefinition::Graph {
                nodes,
                terminal_nodes,
            } => self.build_graph(path, nodes, terminal_nodes.as_deref(), enclosing),
        };
        Arc::new(graph)
    }

    fn check_tag_order(&mut self) {
        let mut conflicts: Vec<Vec<String>> = tarjan_scc(&self.tag_order.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                let mut tags: Vec<String> = component
                    .into_iter()
                    .map(|idx| self.tag_order.graph[idx].clone())
                    .collect();
                tags.sort();
                tags
            })
            .collect();
        conflicts.sort();
        for tags in conflicts {
            self.errors.push(ValidationError::ResourceOrderConflict { tags });
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search over "depends on" edges with an explicit recursion
/// stack. Each distinct cycle is reported once, starting from the node first
/// reached in definition order.
fn find_cycles(nodes: &IndexMap<String, Node>) -> Vec<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut cycles = Vec::new();

    for id in nodes.keys() {
        if !marks.contains_key(id.as_str()) {
            visit(id, nodes, &mut marks, &mut stack, &mut seen, &mut cycles);
        }
    }
    cycles
}

fn visit<'a>(
    id: &'a str,
    nodes: &'a IndexMap<String, Node>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    seen: &mut HashSet<Vec<String>>,
    cycles: &mut Vec<Vec<String>>,
) {
    marks.insert(id, Mark::Visiting);
    stack.push(id);

    let dependencies = nodes
        .get(id)
        .and_then(|node| node.dependency.as_ref())
        .map(|expr| expr.referenced_nodes())
        .unwrap_or_default();

    for dependency in dependencies {
        let Some((key, _)) = nodes.get_key_value(dependency) else {
            continue;
        };
        match marks.get(key.as_str()) {
            Some(Mark::Visiting) => {
                if let Some(start) = stack.iter().position(|s| *s == key.as_str()) {
                    let cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                    let mut canonical = cycle.clone();
                    canonical.sort();
                    if seen.insert(canonical) {
                        cycles.push(cycle);
                    }
                }
            }
            Some(Mark::Done) => {}
            None => visit(key.as_str(), nodes, marks, stack, seen, cycles),
        }
    }

    stack.pop();
    marks.insert(id, Mark::Done);
}
