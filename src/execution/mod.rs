//! Node execution records, the status state machine, and the stores the
//! engine persists them through.

pub mod model;
pub mod sled_store;
pub mod store;
pub mod tracker;

pub use model::{ExecutionStatus, InterruptEffect, NodeExecution};
pub use sled_store::SledStore;
pub use store::{ExecutionStore, InMemoryStore};
pub use tracker::{StatusTracker, Transition};
