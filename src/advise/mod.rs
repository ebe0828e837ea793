//! Advisory/retry engine: computes what to do next after a step produces a
//! result, from the step response plus the plan's failure-strategy table.

pub mod adviser;
pub mod strategy;

pub use adviser::Adviser;
pub use strategy::{
    AdviceAction, AdviceOutcome, FailureInfo, FailurePattern, FailureStrategyConfig,
    FailureStrategyEntry, FailureType, RollbackStrategy, StepResponse, StrategyAction,
};
