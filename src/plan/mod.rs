//! Static plan model: the read-only DAG of nodes a pipeline execution walks.

pub mod graph;
pub mod node;

pub use graph::{Plan, PlanBuilder};
pub use node::{NodeInfo, PlanNode, SkipKind};
