//! Interrupt registration and application: converts abort/retry/pause
//! control signals into advice-overriding effects on running executions.

pub mod manager;
pub mod types;

pub use manager::InterruptManager;
pub use types::{Interrupt, InterruptIssuer, InterruptState, InterruptType};
