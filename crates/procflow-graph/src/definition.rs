use std::collections::{HashMap, HashSet};
use std::path::Path;

use procflow_core::{ProcflowError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::condition::Condition;
use crate::flow::Flow;
use crate::node::{Node, NodeKind, TaskSpec};
use crate::topology::Topology;

/// Serialized form of a process definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

/// A validated, immutable process graph.
///
/// Construction checks structure only. Handler references are checked by
/// the task registry before a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "DefinitionDocument", into = "DefinitionDocument")]
pub struct ProcessDefinition {
    id: String,
    name: Option<String>,
    nodes: Vec<Node>,
    flows: Vec<Flow>,
    index: HashMap<String, usize>,
    /// Parsed condition per flow, aligned with `flows`.
    conditions: Vec<Option<Condition>>,
    start: usize,
    topology: Topology,
}

impl TryFrom<DefinitionDocument> for ProcessDefinition {
    type Error = ProcflowError;

    fn try_from(doc: DefinitionDocument) -> Result<Self> {
        Self::new(doc)
    }
}

impl From<ProcessDefinition> for DefinitionDocument {
    fn from(def: ProcessDefinition) -> Self {
        Self {
            id: def.id,
            name: def.name,
            nodes: def.nodes,
            flows: def.flows,
        }
    }
}

fn invalid(msg: impl Into<String>) -> ProcflowError {
    ProcflowError::Definition(msg.into())
}

impl ProcessDefinition {
    /// Validate a document and build the definition.
    pub fn new(doc: DefinitionDocument) -> Result<Self> {
        let DefinitionDocument {
            id,
            name,
            nodes,
            flows,
        } = doc;

        let mut index = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(invalid("node id must not be empty"));
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
        }

        let starts: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Start))
            .map(|(i, _)| i)
            .collect();
        let start = match starts.as_slice() {
            [only] => *only,
            [] => return Err(invalid("definition has no start node")),
            _ => return Err(invalid("definition has more than one start node")),
        };

        let mut conditions = Vec::with_capacity(flows.len());
        for flow in &flows {
            for endpoint in [&flow.source, &flow.target] {
                if !index.contains_key(endpoint) {
                    return Err(invalid(format!(
                        "flow {} -> {} references unknown node '{}'",
                        flow.source, flow.target, endpoint
                    )));
                }
            }
            let parsed = match &flow.condition {
                Some(expr) => Some(Condition::parse(expr).map_err(|e| {
                    invalid(format!(
                        "flow {} -> {}: {}",
                        flow.source, flow.target, e
                    ))
                })?),
                None => None,
            };
            conditions.push(parsed);
        }

        let mut topology = Topology::new(&nodes, &flows);
        for node in &nodes {
            check_node(node, &flows, &topology)?;
        }
        topology.match_joins(&nodes, &flows).map_err(invalid)?;

        debug!(
            definition = %id,
            nodes = nodes.len(),
            flows = flows.len(),
            "Process definition validated"
        );

        Ok(Self {
            id,
            name,
            nodes,
            flows,
            index,
            conditions,
            start,
            topology,
        })
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let doc: DefinitionDocument = serde_json::from_str(s)?;
        Self::new(doc)
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        let doc: DefinitionDocument = toml::from_str(s)?;
        Self::new(doc)
    }

    /// Load from a file; `.toml` files are read as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.document())?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(&self.document()).map_err(|e| invalid(e.to_string()))
    }

    fn document(&self) -> DefinitionDocument {
        DefinitionDocument::from(self.clone())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn start_node(&self) -> &Node {
        &self.nodes[self.start]
    }

    /// The single normal flow out of a sequential node.
    pub fn next_flow(&self, node_id: &str) -> Option<&Flow> {
        self.topology
            .outgoing(node_id)
            .iter()
            .map(|&i| &self.flows[i])
            .find(|f| f.is_normal())
    }

    /// The error flow out of a task or multi-instance node.
    pub fn error_flow(&self, node_id: &str) -> Option<&Flow> {
        self.topology
            .outgoing(node_id)
            .iter()
            .map(|&i| &self.flows[i])
            .find(|f| f.on_error)
    }

    /// Outgoing flows with their parsed conditions, in declared order.
    pub fn outgoing(&self, node_id: &str) -> Vec<(&Flow, Option<&Condition>)> {
        self.topology
            .outgoing(node_id)
            .iter()
            .map(|&i| (&self.flows[i], self.conditions[i].as_ref()))
            .collect()
    }

    pub fn is_split(&self, node: &Node) -> bool {
        self.topology.is_split(node)
    }

    pub fn is_join(&self, node: &Node) -> bool {
        self.topology.is_join(node)
    }

    pub fn matching_join(&self, split_id: &str) -> Option<&str> {
        self.topology.matching_join(split_id)
    }

    pub fn join_pairs(&self) -> Vec<(&str, &str)> {
        self.topology.join_pairs()
    }

    /// Every task spec dispatched by the definition, with its node id.
    pub fn task_specs(&self) -> impl Iterator<Item = (&str, &TaskSpec)> {
        self.nodes
            .iter()
            .filter_map(|n| n.task_spec().map(|spec| (n.id.as_str(), spec)))
    }

    /// Set of node ids, for structural comparison.
    pub fn node_ids(&self) -> HashSet<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    /// Set of (source, target) pairs, for structural comparison.
    pub fn flow_pairs(&self) -> HashSet<(&str, &str)> {
        self.flows
            .iter()
            .map(|f| (f.source.as_str(), f.target.as_str()))
            .collect()
    }
}

fn check_node(node: &Node, flows: &[Flow], topology: &Topology) -> Result<()> {
    let out: Vec<&Flow> = topology.outgoing(&node.id).iter().map(|&i| &flows[i]).collect();
    let normal = out.iter().filter(|f| f.is_normal()).count();
    let errors = out.len() - normal;
    let defaults = out.iter().filter(|f| f.default).count();
    let conditional = out.iter().filter(|f| f.condition.is_some()).count();
    let id = &node.id;

    if errors > 0 && !matches!(node.kind, NodeKind::Task(_) | NodeKind::MultiInstance(_)) {
        return Err(invalid(format!(
            "only task and multi-instance nodes may have error flows ('{}')",
            id
        )));
    }
    if errors > 1 {
        return Err(invalid(format!("node '{}' has more than one error flow", id)));
    }
    if !matches!(node.kind, NodeKind::ExclusiveGateway) && (defaults > 0 || conditional > 0) {
        return Err(invalid(format!(
            "conditions and default flows are only allowed out of exclusive gateways ('{}')",
            id
        )));
    }

    match &node.kind {
        NodeKind::Start => {
            if !topology.incoming(id).is_empty() {
                return Err(invalid(format!("start node '{}' has incoming flows", id)));
            }
            expect_single(id, normal)?;
        }
        NodeKind::End => {
            if !out.is_empty() {
                return Err(invalid(format!("end node '{}' has outgoing flows", id)));
            }
        }
        NodeKind::Task(spec) => {
            check_task_spec(id, spec)?;
            expect_single(id, normal)?;
        }
        NodeKind::MultiInstance(mi) => {
            check_task_spec(id, &mi.task)?;
            if mi.collection.trim().is_empty() {
                return Err(invalid(format!(
                    "multi-instance node '{}' has an empty collection expression",
                    id
                )));
            }
            if mi.result_key.trim().is_empty() {
                return Err(invalid(format!(
                    "multi-instance node '{}' must declare a result key",
                    id
                )));
            }
            if mi.element_var.trim().is_empty() {
                return Err(invalid(format!(
                    "multi-instance node '{}' has an empty element variable",
                    id
                )));
            }
            if mi.max_concurrency == Some(0) {
                return Err(invalid(format!(
                    "multi-instance node '{}' has max_concurrency 0",
                    id
                )));
            }
            expect_single(id, normal)?;
        }
        NodeKind::ExclusiveGateway => {
            if out.is_empty() {
                return Err(invalid(format!(
                    "exclusive gateway '{}' has no outgoing flows",
                    id
                )));
            }
            if defaults > 1 {
                return Err(invalid(format!(
                    "exclusive gateway '{}' has more than one default flow",
                    id
                )));
            }
            if out.iter().any(|f| f.default && f.condition.is_some()) {
                return Err(invalid(format!(
                    "default flow out of '{}' must not carry a condition",
                    id
                )));
            }
        }
        NodeKind::ParallelGateway => {
            if out.is_empty() {
                return Err(invalid(format!(
                    "parallel gateway '{}' has no outgoing flows",
                    id
                )));
            }
            if topology.incoming(id).len() > 1 && out.len() > 1 {
                return Err(invalid(format!(
                    "parallel gateway '{}' is both a split and a join",
                    id
                )));
            }
        }
    }
    Ok(())
}

fn expect_single(id: &str, normal: usize) -> Result<()> {
    if normal != 1 {
        return Err(invalid(format!(
            "node '{}' must have exactly one outgoing flow, found {}",
            id, normal
        )));
    }
    Ok(())
}

fn check_task_spec(id: &str, spec: &TaskSpec) -> Result<()> {
    if spec.handler.trim().is_empty() {
        return Err(invalid(format!("task node '{}' has an empty handler", id)));
    }
    if spec.timeout_ms == Some(0) {
        return Err(invalid(format!("task node '{}' has timeout_ms 0", id)));
    }
    Ok(())
}
