//! The asynchronous-suspension core: a wait registry keyed by correlation id
//! that pairs suspended node executions with the callbacks that resume them.

pub mod registry;

pub use registry::{PendingResume, ResumeCallback, Resumption, WaitNotifyRegistry};
