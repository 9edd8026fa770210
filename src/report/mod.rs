//! Reconciliation reports.
//!
//! A report is a pure aggregation of one run's execution results. It is
//! persisted as JSON so that `report` can render the last run later.

mod lock;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::planner::{Execution, ExecutionResult, Outcome, PlanSummary, RunStatus, SkipReason};

pub use lock::{LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS, LockInfo, RunLock, generate_holder_id};
pub use store::{LockHeartbeat, ReportStore};

/// Exit code: everything applied or unchanged.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code: at least one change failed, or a fatal error occurred.
pub const EXIT_FAILURE: i32 = 1;

/// Exit code: `plan`/`drift` found pending changes.
pub const EXIT_CHANGES_PENDING: i32 = 2;

/// Exit code: the run was cancelled.
pub const EXIT_ABORTED: i32 = 3;

/// Number of results per outcome.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeCounts {
    /// Applied changes.
    pub applied: usize,
    /// Already converged resources.
    pub unchanged: usize,
    /// Failed changes and observations.
    pub failed: usize,
    /// Changes that never started.
    pub skipped: usize,
}

/// Record of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Unique run identifier.
    pub run_id: String,
    /// Fleet name from the document settings.
    pub name: String,
    /// Hash of the document the run was planned from.
    pub document_hash: String,
    /// When observation started.
    pub started_at: DateTime<Utc>,
    /// When the last change finished.
    pub finished_at: DateTime<Utc>,
    /// Total run time.
    pub duration_ms: u64,
    /// Run status.
    pub status: RunStatus,
    /// Plan change counts.
    pub plan: PlanSummary,
    /// Result counts.
    pub counts: OutcomeCounts,
    /// Per-resource results in execution order.
    pub results: Vec<ExecutionResult>,
}

impl OutcomeCounts {
    /// Counts `results` by outcome.
    #[must_use]
    pub fn from_results(results: &[ExecutionResult]) -> Self {
        let mut counts = Self::default();
        for result in results {
            match result.outcome {
                Outcome::Applied => counts.applied += 1,
                Outcome::Unchanged => counts.unchanged += 1,
                Outcome::Failed => counts.failed += 1,
                Outcome::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Total number of results.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.applied + self.unchanged + self.failed + self.skipped
    }
}

impl ReconciliationReport {
    /// Aggregates an execution into a report.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        document_hash: impl Into<String>,
        started_at: DateTime<Utc>,
        plan: PlanSummary,
        execution: Execution,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = u64::try_from((finished_at - started_at).num_milliseconds()).unwrap_or(0);

        Self {
            run_id: Uuid::new_v4().to_string(),
            name: name.into(),
            document_hash: document_hash.into(),
            started_at,
            finished_at,
            duration_ms,
            status: execution.status,
            plan,
            counts: OutcomeCounts::from_results(&execution.results),
            results: execution.results,
        }
    }

    /// Failed results, with error details.
    pub fn failures(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| r.outcome == Outcome::Failed)
    }

    /// Skipped results.
    pub fn skipped(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| r.outcome == Outcome::Skipped)
    }

    /// Results skipped for `reason`.
    pub fn skipped_for(&self, reason: SkipReason) -> impl Iterator<Item = &ExecutionResult> {
        self.skipped().filter(move |r| r.skip_reason == Some(reason))
    }

    /// Returns true if every resource ended applied or unchanged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.counts.failed == 0 && self.counts.skipped == 0
    }

    /// Process exit code for `apply`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.status == RunStatus::Aborted {
            EXIT_ABORTED
        } else if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{Change, ChangeKind};
    use crate::resource::{ResourceKey, ResourceKind};

    fn result(identity: &str, outcome: Outcome, skip_reason: Option<SkipReason>) -> ExecutionResult {
        let key = ResourceKey::new(ResourceKind::Share, "fs01", identity);
        ExecutionResult {
            key: key.clone(),
            change: Some(Change {
                key,
                kind: ChangeKind::Create,
                attribute_diffs: vec![],
            }),
            outcome,
            skip_reason,
            error: (outcome == Outcome::Failed).then(|| String::from("Permission denied")),
            attempts: 1,
            duration_ms: 3,
        }
    }

    fn report(results: Vec<ExecutionResult>, status: RunStatus) -> ReconciliationReport {
        ReconciliationReport::new(
            "test",
            "abc",
            Utc::now(),
            PlanSummary::default(),
            Execution { results, status },
        )
    }

    #[test]
    fn test_one_failure_two_applied() {
        let report = report(
            vec![
                result("A", Outcome::Applied, None),
                result("B", Outcome::Failed, None),
                result("C", Outcome::Applied, None),
            ],
            RunStatus::Completed,
        );

        assert_eq!(report.counts.applied, 2);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.failures().next().unwrap().key.identity, "B");
        assert_eq!(report.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_exit_codes() {
        let ok = report(
            vec![result("A", Outcome::Applied, None), result("B", Outcome::Unchanged, None)],
            RunStatus::Completed,
        );
        assert_eq!(ok.exit_code(), EXIT_SUCCESS);

        let aborted = report(
            vec![
                result("A", Outcome::Applied, None),
                result("B", Outcome::Skipped, Some(SkipReason::Cancelled)),
            ],
            RunStatus::Aborted,
        );
        assert_eq!(aborted.exit_code(), EXIT_ABORTED);
        assert_eq!(aborted.skipped_for(SkipReason::Cancelled).count(), 1);
        assert_eq!(aborted.skipped_for(SkipReason::UpstreamFailure).count(), 0);
    }

    #[test]
    fn test_json_shape() {
        let report = report(
            vec![result("B", Outcome::Skipped, Some(SkipReason::UpstreamFailure))],
            RunStatus::Completed,
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["results"][0]["outcome"], "skipped");
        assert_eq!(json["results"][0]["skip_reason"], "upstream_failure");
        assert_eq!(json["results"][0]["change"]["kind"], "create");
        assert_eq!(json["results"][0]["key"]["kind"], "share");
        assert!(json["results"][0].get("error").is_none());

        let back: ReconciliationReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
