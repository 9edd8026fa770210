//! Planning and execution.
//!
//! This module compares desired and observed state, orders the resulting
//! changes into dependency batches and applies them.

mod diff;
mod executor;
mod plan;

pub use diff::{AttributeDiff, Change, ChangeKind, Differ};
pub use executor::{
    CancelToken, Execution, ExecutionResult, Executor, Outcome, RunStatus, SkipReason,
};
pub use plan::{Assessment, ObservationFailure, Plan, PlanBuilder, PlanSummary, Unobserved};
