use serde::{Deserialize, Serialize};

/// Skip-graph classification for a node whose skip condition holds.
///
/// `Noop` and `SkipNode` skip only the node itself; traversal continues to
/// its successors. `SkipTree` prunes the whole subtree below the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipKind {
    Noop,
    SkipNode,
    SkipTree,
}

/// Shared, read-only attributes of every plan node.
///
/// `skip_condition` and `when_condition` are pre-evaluated booleans fixed at
/// traversal time; the engine never re-evaluates expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub name: String,
    pub step_type: String,
    pub stage_fqn: String,
    pub skip_condition: bool,
    pub when_condition: bool,
    pub skip_kind: SkipKind,
    /// Entry node of the rollback subgraph for this node, if it has one.
    /// Only meaningful on stage nodes.
    pub rollback_node_id: Option<String>,
}

impl NodeInfo {
    pub fn new<S: Into<String>>(node_id: S, name: S, step_type: S, stage_fqn: S) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            step_type: step_type.into(),
            stage_fqn: stage_fqn.into(),
            skip_condition: false,
            when_condition: true,
            skip_kind: SkipKind::Noop,
            rollback_node_id: None,
        }
    }

    pub fn with_skip(mut self, skip_condition: bool, skip_kind: SkipKind) -> Self {
        self.skip_condition = skip_condition;
        self.skip_kind = skip_kind;
        self
    }

    pub fn with_when(mut self, when_condition: bool) -> Self {
        self.when_condition = when_condition;
        self
    }

    pub fn with_rollback<S: Into<String>>(mut self, rollback_node_id: S) -> Self {
        self.rollback_node_id = Some(rollback_node_id.into());
        self
    }
}

/// Closed variant set of plan node kinds.
///
/// Identity nodes stand in for a previously-executed node on re-runs and
/// carry the execution id whose result they copy instead of re-running work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanNode {
    Step(NodeInfo),
    Stage(NodeInfo),
    Fork(NodeInfo),
    Identity {
        info: NodeInfo,
        original_node_execution_id: String,
    },
}

impl PlanNode {
    pub fn info(&self) -> &NodeInfo {
        match self {
            PlanNode::Step(info)
            | PlanNode::Stage(info)
            | PlanNode::Fork(info)
            | PlanNode::Identity { info, .. } => info,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.info().node_id
    }

    pub fn is_stage(&self) -> bool {
        matches!(self, PlanNode::Stage(_))
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, PlanNode::Identity { .. })
    }

    /// Whether traversal should skip this node outright, either because its
    /// skip expression held or its when condition did not.
    pub fn should_skip(&self) -> bool {
        let info = self.info();
        info.skip_condition || !info.when_condition
    }

    pub fn skip_kind(&self) -> SkipKind {
        self.info().skip_kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_evaluation_uses_preevaluated_flags() {
        let plain = PlanNode::Step(NodeInfo::new("n1", "build", "ShellScript", "pipe.stage1"));
        assert!(!plain.should_skip());

        let skipped = PlanNode::Step(
            NodeInfo::new("n2", "deploy", "K8sApply", "pipe.stage1")
                .with_skip(true, SkipKind::SkipTree),
        );
        assert!(skipped.should_skip());
        assert_eq!(skipped.skip_kind(), SkipKind::SkipTree);

        let when_false = PlanNode::Step(
            NodeInfo::new("n3", "verify", "Verify", "pipe.stage1").with_when(false),
        );
        assert!(when_false.should_skip());
    }

    #[test]
    fn identity_carries_original_execution() {
        let node = PlanNode::Identity {
            info: NodeInfo::new("n4", "reuse", "ShellScript", "pipe.stage1"),
            original_node_execution_id: "exec-prior".into(),
        };
        assert!(node.is_identity());
        assert_eq!(node.node_id(), "n4");
    }
}
