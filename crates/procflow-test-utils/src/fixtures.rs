use procflow_core::Result;
use procflow_graph::{DefinitionDocument, Flow, Node, ProcessDefinition, TaskSpec};

/// Fluent builder over [`DefinitionDocument`].
pub struct DefinitionBuilder {
    doc: DefinitionDocument,
}

impl DefinitionBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            doc: DefinitionDocument {
                id: id.into(),
                name: None,
                nodes: Vec::new(),
                flows: Vec::new(),
            },
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.doc.nodes.push(node);
        self
    }

    pub fn flow(mut self, flow: Flow) -> Self {
        self.doc.flows.push(flow);
        self
    }

    /// Plain flow from `source` to `target`.
    pub fn edge(self, source: &str, target: &str) -> Self {
        self.flow(Flow::new(source, target))
    }

    pub fn document(self) -> DefinitionDocument {
        self.doc
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        ProcessDefinition::new(self.doc)
    }
}

/// start -> task nodes in order -> end.
pub fn linear(id: &str, tasks: Vec<(&str, TaskSpec)>) -> DefinitionBuilder {
    let mut builder = DefinitionBuilder::new(id).node(Node::start("start"));
    let mut previous = "start".to_string();
    for (node_id, spec) in tasks {
        builder = builder
            .node(Node::task(node_id, spec))
            .edge(&previous, node_id);
        previous = node_id.to_string();
    }
    builder.node(Node::end("end")).edge(&previous, "end")
}

/// start -> `task` -> end.
pub fn single_task(id: &str, spec: TaskSpec) -> DefinitionBuilder {
    linear(id, vec![("task", spec)])
}

/// start -> split -> one task per spec -> join -> end.
///
/// Branch `i` runs node `b{i}`.
pub fn parallel(id: &str, branches: Vec<TaskSpec>) -> DefinitionBuilder {
    let mut builder = DefinitionBuilder::new(id)
        .node(Node::start("start"))
        .node(Node::parallel("split"))
        .node(Node::parallel("join"))
        .node(Node::end("end"))
        .edge("start", "split")
        .edge("join", "end");
    for (i, spec) in branches.into_iter().enumerate() {
        let node_id = format!("b{}", i);
        builder = builder
            .node(Node::task(node_id.as_str(), spec))
            .edge("split", &node_id)
            .edge(&node_id, "join");
    }
    builder
}

/// start -> gateway -> (`cond` ? yes : no) -> merge -> end, with `no`
/// reached through the default flow.
pub fn exclusive(id: &str, cond: &str, yes: TaskSpec, no: TaskSpec) -> DefinitionBuilder {
    DefinitionBuilder::new(id)
        .node(Node::start("start"))
        .node(Node::exclusive("gateway"))
        .node(Node::task("yes", yes))
        .node(Node::task("no", no))
        .node(Node::exclusive("merge"))
        .node(Node::end("end"))
        .edge("start", "gateway")
        .flow(Flow::conditional("gateway", "yes", cond))
        .flow(Flow::default_flow("gateway", "no"))
        .edge("yes", "merge")
        .edge("no", "merge")
        .edge("merge", "end")
}

/// A fresh temporary directory for span logs and config files.
pub fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("failed to create temp dir")
}
