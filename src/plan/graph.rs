use std::collections::HashMap;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;

use crate::error::{BatonError, Result};
use crate::plan::node::PlanNode;

/// The static DAG describing a full pipeline run. Built once, read-only
/// afterwards; every traversal decision the engine makes is a lookup here.
#[derive(Debug)]
pub struct Plan {
    graph: DiGraph<PlanNode, ()>,
    index: HashMap<String, NodeIndex>,
}

impl Plan {
    pub fn builder() -> PlanBuilder {
        PlanBuilder::default()
    }

    pub fn node(&self, node_id: &str) -> Option<&PlanNode> {
        self.index.get(node_id).map(|idx| &self.graph[*idx])
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    /// Successors of a node in traversal order of insertion.
    pub fn next_nodes(&self, node_id: &str) -> Vec<&PlanNode> {
        let Some(idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        let mut next: Vec<&PlanNode> = self
            .graph
            .neighbors_directed(*idx, Direction::Outgoing)
            .map(|n| &self.graph[n])
            .collect();
        // petgraph yields neighbors in reverse insertion order
        next.reverse();
        next
    }

    /// Nodes with no incoming edges; traversal entry points.
    pub fn start_nodes(&self) -> Vec<&PlanNode> {
        self.graph
            .externals(Direction::Incoming)
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Sibling nodes: nodes sharing at least one predecessor with `node_id`,
    /// excluding the node itself.
    pub fn siblings(&self, node_id: &str) -> Vec<&PlanNode> {
        let Some(idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for parent in self.graph.neighbors_directed(*idx, Direction::Incoming) {
            for child in self.graph.neighbors_directed(parent, Direction::Outgoing) {
                if child != *idx {
                    out.push(&self.graph[child]);
                }
            }
        }
        out
    }

    /// Stage node ids in topological order. Used to resolve rollback targets.
    pub fn stages(&self) -> Vec<&PlanNode> {
        let mut topo = Topo::new(&self.graph);
        let mut stages = Vec::new();
        while let Some(idx) = topo.next(&self.graph) {
            if self.graph[idx].is_stage() {
                stages.push(&self.graph[idx]);
            }
        }
        stages
    }
}

#[derive(Default)]
pub struct PlanBuilder {
    nodes: Vec<PlanNode>,
    edges: Vec<(String, String)>,
}

impl PlanBuilder {
    pub fn add_node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_edge<S: Into<String>>(mut self, from: S, to: S) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn build(self) -> Result<Plan> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in self.nodes {
            let id = node.node_id().to_string();
            if index.contains_key(&id) {
                return Err(BatonError::PlanValidation {
                    message: format!("duplicate node id '{}'", id),
                });
            }
            let idx = graph.add_node(node);
            index.insert(id, idx);
        }
        for (from, to) in self.edges {
            let from_idx = *index.get(&from).ok_or_else(|| BatonError::PlanValidation {
                message: format!("edge references unknown node '{}'", from),
            })?;
            let to_idx = *index.get(&to).ok_or_else(|| BatonError::PlanValidation {
                message: format!("edge references unknown node '{}'", to),
            })?;
            graph.add_edge(from_idx, to_idx, ());
        }
        if is_cyclic_directed(&graph) {
            return Err(BatonError::PlanValidation {
                message: "plan graph contains a cycle".into(),
            });
        }
        Ok(Plan { graph, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::node::NodeInfo;

    fn step(id: &str) -> PlanNode {
        PlanNode::Step(NodeInfo::new(id, id, "ShellScript", "pipe.stage1"))
    }

    fn linear_plan() -> Plan {
        Plan::builder()
            .add_node(step("a"))
            .add_node(step("b"))
            .add_node(step("c"))
            .add_edge("a", "b")
            .add_edge("b", "c")
            .build()
            .unwrap()
    }

    #[test]
    fn successor_lookup() {
        let plan = linear_plan();
        let next: Vec<&str> = plan.next_nodes("a").iter().map(|n| n.node_id()).collect();
        assert_eq!(next, vec!["b"]);
        assert!(plan.next_nodes("c").is_empty());
        assert_eq!(plan.start_nodes()[0].node_id(), "a");
    }

    #[test]
    fn cycle_is_rejected() {
        let err = Plan::builder()
            .add_node(step("a"))
            .add_node(step("b"))
            .add_edge("a", "b")
            .add_edge("b", "a")
            .build()
            .unwrap_err();
        assert!(matches!(err, BatonError::PlanValidation { .. }));
    }

    #[test]
    fn unknown_edge_is_rejected() {
        let err = Plan::builder()
            .add_node(step("a"))
            .add_edge("a", "ghost")
            .build()
            .unwrap_err();
        assert!(matches!(err, BatonError::PlanValidation { .. }));
    }

    #[test]
    fn siblings_share_a_parent() {
        let plan = Plan::builder()
            .add_node(PlanNode::Fork(NodeInfo::new(
                "fork", "fork", "Fork", "pipe.stage1",
            )))
            .add_node(step("a"))
            .add_node(step("b"))
            .add_node(step("c"))
            .add_edge("fork", "a")
            .add_edge("fork", "b")
            .add_edge("fork", "c")
            .build()
            .unwrap();
        let mut sibs: Vec<&str> = plan.siblings("b").iter().map(|n| n.node_id()).collect();
        sibs.sort();
        assert_eq!(sibs, vec!["a", "c"]);
    }
}
