use std::collections::{HashMap, HashSet, VecDeque};

use crate::flow::Flow;
use crate::node::{Node, NodeKind};

/// Adjacency view over a definition's flows, plus parallel split/join pairing.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// node_id -> indices of outgoing flows, in declared order.
    outgoing: HashMap<String, Vec<usize>>,
    /// node_id -> indices of incoming flows, in declared order.
    incoming: HashMap<String, Vec<usize>>,
    /// split gateway id -> matching join gateway id.
    joins: HashMap<String, String>,
}

impl Topology {
    /// Build adjacency lists. Flows must already reference existing nodes.
    pub fn new(nodes: &[Node], flows: &[Flow]) -> Self {
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();

        for node in nodes {
            outgoing.entry(node.id.clone()).or_default();
            incoming.entry(node.id.clone()).or_default();
        }

        for (idx, flow) in flows.iter().enumerate() {
            outgoing.entry(flow.source.clone()).or_default().push(idx);
            incoming.entry(flow.target.clone()).or_default().push(idx);
        }

        Self {
            outgoing,
            incoming,
            joins: HashMap::new(),
        }
    }

    /// Indices of flows leaving `node_id`.
    pub fn outgoing(&self, node_id: &str) -> &[usize] {
        self.outgoing
            .get(node_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Indices of flows entering `node_id`.
    pub fn incoming(&self, node_id: &str) -> &[usize] {
        self.incoming
            .get(node_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// The join gateway paired with a split.
    pub fn matching_join(&self, split_id: &str) -> Option<&str> {
        self.joins.get(split_id).map(|s| s.as_str())
    }

    /// All split -> join pairs, sorted by split id.
    pub fn join_pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self
            .joins
            .iter()
            .map(|(s, j)| (s.as_str(), j.as_str()))
            .collect();
        pairs.sort();
        pairs
    }

    /// A parallel gateway that fans out.
    pub fn is_split(&self, node: &Node) -> bool {
        matches!(node.kind, NodeKind::ParallelGateway) && self.outgoing(&node.id).len() > 1
    }

    /// A parallel gateway that synchronizes.
    pub fn is_join(&self, node: &Node) -> bool {
        matches!(node.kind, NodeKind::ParallelGateway) && self.incoming(&node.id).len() > 1
    }

    /// Pair every parallel split with the join reachable on all of its branches.
    ///
    /// Each branch is walked forward while counting nested splits; the first
    /// join met at nesting depth zero closes the branch. Every branch must
    /// close on the same join, and no branch may reach an end node first.
    pub fn match_joins(&mut self, nodes: &[Node], flows: &[Flow]) -> Result<(), String> {
        let by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let mut joins = HashMap::new();
        for split in nodes.iter().filter(|n| self.is_split(n)) {
            if self.is_join(split) {
                return Err(format!(
                    "parallel gateway '{}' is both a split and a join",
                    split.id
                ));
            }

            let mut matched: Option<String> = None;
            for &flow_idx in self.outgoing(&split.id) {
                let target = &flows[flow_idx].target;
                let join = self.close_branch(&split.id, target, &by_id, flows)?;
                match &matched {
                    None => matched = Some(join),
                    Some(existing) if *existing != join => {
                        return Err(format!(
                            "branches of parallel split '{}' converge on different joins '{}' and '{}'",
                            split.id, existing, join
                        ));
                    }
                    Some(_) => {}
                }
            }

            if let Some(join) = matched {
                joins.insert(split.id.clone(), join);
            }
        }

        self.joins = joins;
        Ok(())
    }

    fn close_branch(
        &self,
        split_id: &str,
        first: &str,
        by_id: &HashMap<&str, &Node>,
        flows: &[Flow],
    ) -> Result<String, String> {
        let max_depth = by_id.len();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(first, 0)]);
        let mut seen: HashSet<(&str, usize)> = HashSet::new();
        let mut found: Option<&str> = None;

        while let Some((id, depth)) = queue.pop_front() {
            if !seen.insert((id, depth)) || depth > max_depth {
                continue;
            }
            let Some(node) = by_id.get(id) else {
                continue;
            };

            let mut next_depth = depth;
            if self.is_join(node) {
                if depth == 0 {
                    match found {
                        Some(existing) if existing != id => {
                            return Err(format!(
                                "a branch of parallel split '{}' reaches two joins '{}' and '{}'",
                                split_id, existing, id
                            ));
                        }
                        _ => found = Some(id),
                    }
                    continue;
                }
                next_depth -= 1;
            } else if self.is_split(node) {
                next_depth += 1;
            }

            if matches!(node.kind, NodeKind::End) {
                return Err(format!(
                    "a branch of parallel split '{}' reaches end node '{}' before joining",
                    split_id, id
                ));
            }

            for &flow_idx in self.outgoing(id) {
                queue.push_back((flows[flow_idx].target.as_str(), next_depth));
            }
        }

        found.map(str::to_string).ok_or_else(|| {
            format!(
                "no matching join is reachable from parallel split '{}' via '{}'",
                split_id, first
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TaskSpec;

    fn task(id: &str) -> Node {
        Node::task(id, TaskSpec::new("noop"))
    }

    fn build(nodes: &[Node], flows: &[Flow]) -> Result<Topology, String> {
        let mut topo = Topology::new(nodes, flows);
        topo.match_joins(nodes, flows)?;
        Ok(topo)
    }

    #[test]
    fn test_adjacency_in_declared_order() {
        let nodes = vec![Node::start("s"), task("a"), task("b"), Node::end("e")];
        let flows = vec![
            Flow::new("s", "a"),
            Flow::new("a", "b"),
            Flow::new("b", "e"),
            Flow::on_error("a", "e"),
        ];
        let topo = build(&nodes, &flows).unwrap();
        assert_eq!(topo.outgoing("a"), &[1, 3]);
        assert_eq!(topo.incoming("e"), &[2, 3]);
        assert!(topo.outgoing("e").is_empty());
        assert!(topo.outgoing("unknown").is_empty());
    }

    #[test]
    fn test_nested_splits_match_their_own_joins() {
        let nodes = vec![
            Node::start("s"),
            Node::parallel("outer"),
            Node::parallel("inner"),
            task("a"),
            task("b"),
            task("c"),
            Node::parallel("inner_join"),
            Node::parallel("outer_join"),
            Node::end("e"),
        ];
        let flows = vec![
            Flow::new("s", "outer"),
            Flow::new("outer", "inner"),
            Flow::new("outer", "c"),
            Flow::new("inner", "a"),
            Flow::new("inner", "b"),
            Flow::new("a", "inner_join"),
            Flow::new("b", "inner_join"),
            Flow::new("inner_join", "outer_join"),
            Flow::new("c", "outer_join"),
            Flow::new("outer_join", "e"),
        ];
        let topo = build(&nodes, &flows).unwrap();
        assert_eq!(topo.matching_join("outer"), Some("outer_join"));
        assert_eq!(topo.matching_join("inner"), Some("inner_join"));
        assert_eq!(
            topo.join_pairs(),
            vec![("inner", "inner_join"), ("outer", "outer_join")]
        );
    }

    #[test]
    fn test_branch_reaching_end_is_rejected() {
        let nodes = vec![
            Node::start("s"),
            Node::parallel("split"),
            task("a"),
            task("b"),
            Node::parallel("join"),
            Node::end("e"),
        ];
        let flows = vec![
            Flow::new("s", "split"),
            Flow::new("split", "a"),
            Flow::new("split", "b"),
            Flow::new("a", "join"),
            Flow::new("b", "e"),
            Flow::new("join", "e"),
        ];
        let err = build(&nodes, &flows).unwrap_err();
        assert!(err.contains("reaches end node 'e'"), "{err}");
    }

    #[test]
    fn test_split_without_join_is_rejected() {
        let nodes = vec![
            Node::start("s"),
            Node::parallel("split"),
            task("a"),
            task("b"),
            task("c"),
        ];
        let flows = vec![
            Flow::new("s", "split"),
            Flow::new("split", "a"),
            Flow::new("split", "b"),
            Flow::new("a", "c"),
            Flow::new("b", "c"),
        ];
        let err = build(&nodes, &flows).unwrap_err();
        assert!(err.contains("no matching join"), "{err}");
    }
}
