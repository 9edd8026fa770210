//! Plan executor.
//!
//! Batches run one after another. Changes inside a batch run on their own
//! tokio tasks, bounded per kind by the registry's semaphores. A failed change
//! never stops its siblings, but everything depending on it is skipped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::provider::{ProviderBinding, ProviderRegistry};
use crate::resource::ResourceKey;

use super::diff::Change;
use super::plan::Plan;

/// Cooperative cancellation flag shared between the caller and the executor.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

/// Final state of one change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The provider applied the change.
    Applied,
    /// Nothing to do.
    Unchanged,
    /// The change or the observation failed.
    Failed,
    /// The change never started.
    Skipped,
}

/// Why a change was skipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A prerequisite failed, was skipped or could not be observed.
    UpstreamFailure,
    /// The run was cancelled before the change started.
    Cancelled,
}

/// Record of what happened to one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Affected resource.
    pub key: ResourceKey,
    /// Attempted change; `None` when the resource could not be observed.
    pub change: Option<Change>,
    /// Final outcome.
    pub outcome: Outcome,
    /// Set when `outcome` is `Skipped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Last error detail when `outcome` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Provider calls made.
    pub attempts: u32,
    /// Wall time spent, including retries.
    pub duration_ms: u64,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every batch was processed.
    Completed,
    /// Cancellation stopped the run.
    Aborted,
}

/// Results of executing a plan.
#[derive(Debug, Clone)]
pub struct Execution {
    /// One result per resource: unobserved ones first, then plan order.
    pub results: Vec<ExecutionResult>,
    /// Run status.
    pub status: RunStatus,
}

/// Applies plans through a provider registry.
#[derive(Debug, Clone)]
pub struct Executor {
    registry: Arc<ProviderRegistry>,
    cancel: CancelToken,
}

impl CancelToken {
    /// Creates an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. In-flight changes still complete.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamFailure => f.write_str("upstream failure"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

impl ExecutionResult {
    fn new(change: &Change, outcome: Outcome) -> Self {
        Self {
            key: change.key.clone(),
            change: Some(change.clone()),
            outcome,
            skip_reason: None,
            error: None,
            attempts: 0,
            duration_ms: 0,
        }
    }

    fn skipped(change: &Change, reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Self::new(change, Outcome::Skipped)
        }
    }

    /// Returns true if dependents of this resource must not run.
    #[must_use]
    pub const fn blocks_dependents(&self) -> bool {
        matches!(self.outcome, Outcome::Failed | Outcome::Skipped)
    }
}

impl Executor {
    /// Creates an executor over `registry`.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            cancel: CancelToken::new(),
        }
    }

    /// Uses `token` for cancellation.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Returns the cancellation token.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Executes `plan`.
    ///
    /// Per-change failures are recorded in the results, never returned.
    ///
    /// # Errors
    ///
    /// Returns `ProviderMissing` before any change is applied if a kind in the
    /// plan has no provider.
    pub async fn execute(&self, plan: &Plan) -> Result<Execution, ConfigError> {
        let kinds: BTreeSet<_> = plan.changes().map(|c| c.key.kind).collect();
        self.registry.ensure_bound(&kinds)?;

        let mut results = Vec::with_capacity(plan.unobserved.len() + plan.changes().count());
        let mut blocked: BTreeSet<ResourceKey> = BTreeSet::new();

        for unobserved in &plan.unobserved {
            error!("{} could not be observed: {}", unobserved.key, unobserved.failure.error);
            blocked.insert(unobserved.key.clone());
            results.push(ExecutionResult {
                key: unobserved.key.clone(),
                change: None,
                outcome: Outcome::Failed,
                skip_reason: None,
                error: Some(unobserved.failure.error.to_string()),
                attempts: unobserved.failure.attempts,
                duration_ms: 0,
            });
        }

        let total = plan.batches.len();
        for (index, batch) in plan.batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled; skipping batch {}/{total}", index + 1);
                results.extend(
                    batch
                        .iter()
                        .map(|c| ExecutionResult::skipped(c, SkipReason::Cancelled)),
                );
                continue;
            }

            info!("Executing batch {}/{total} ({} change(s))", index + 1, batch.len());
            let batch_results = self.execute_batch(plan, batch, &blocked).await?;
            for result in batch_results {
                if result.blocks_dependents() {
                    blocked.insert(result.key.clone());
                }
                results.push(result);
            }
        }

        let status = if self.cancel.is_cancelled() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        info!("Run {status}");

        Ok(Execution { results, status })
    }

    async fn execute_batch(
        &self,
        plan: &Plan,
        batch: &[Change],
        blocked: &BTreeSet<ResourceKey>,
    ) -> Result<Vec<ExecutionResult>, ConfigError> {
        let mut slots: Vec<Slot> = Vec::with_capacity(batch.len());

        for change in batch {
            let upstream_blocked = plan
                .prerequisites
                .get(&change.key)
                .is_some_and(|prereqs| prereqs.iter().any(|p| blocked.contains(p)));

            if upstream_blocked {
                warn!("Skipping {}: a prerequisite did not converge", change.key);
                slots.push(Slot::Done(ExecutionResult::skipped(change, SkipReason::UpstreamFailure)));
                continue;
            }

            let binding = self.registry.get(change.key.kind)?.clone();
            let handle = tokio::spawn(run_change(change.clone(), binding, self.cancel.clone()));
            slots.push(Slot::Running(change, handle));
        }

        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            let result = match slot {
                Slot::Done(result) => result,
                Slot::Running(change, handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Task for {} did not complete: {e}", change.key);
                        ExecutionResult {
                            error: Some(format!("task did not complete: {e}")),
                            ..ExecutionResult::new(change, Outcome::Failed)
                        }
                    }
                },
            };
            results.push(result);
        }

        Ok(results)
    }
}

enum Slot<'a> {
    Done(ExecutionResult),
    Running(&'a Change, JoinHandle<ExecutionResult>),
}

/// Lifecycle of one change on its own task.
async fn run_change(change: Change, binding: ProviderBinding, cancel: CancelToken) -> ExecutionResult {
    let Ok(_permit) = binding.permits.acquire_owned().await else {
        return ExecutionResult {
            error: Some(String::from("concurrency limiter closed")),
            ..ExecutionResult::new(&change, Outcome::Failed)
        };
    };

    if cancel.is_cancelled() {
        return ExecutionResult::skipped(&change, SkipReason::Cancelled);
    }

    if change.is_noop() {
        return ExecutionResult::new(&change, Outcome::Unchanged);
    }

    let started = Instant::now();
    let provider = Arc::clone(&binding.provider);
    let (outcome, attempts) = binding
        .policy
        .run("apply", &change.key, || provider.apply(&change))
        .await;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(()) => {
            info!("{} {} applied via {} ({attempts} attempt(s))", change.kind, change.key, provider.name());
            ExecutionResult {
                attempts,
                duration_ms,
                ..ExecutionResult::new(&change, Outcome::Applied)
            }
        }
        Err(e) => {
            error!("{} {} failed after {attempts} attempt(s): {e}", change.kind, change.key);
            ExecutionResult {
                error: Some(e.to_string()),
                attempts,
                duration_ms,
                ..ExecutionResult::new(&change, Outcome::Failed)
            }
        }
    }
}
