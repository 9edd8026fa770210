//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{Document, ValidationReport};
use crate::planner::{AttributeDiff, Change, ChangeKind, Outcome, Plan, PlanSummary, RunStatus};
use crate::reconciler::{DriftReport, UnobservedEntry};
use crate::report::{OutcomeCounts, ReconciliationReport};
use crate::resource::AttributeValue;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Batch")]
    batch: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Attributes")]
    attributes: String,
}

/// Execution result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Time")]
    duration: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a validation result for display.
    #[must_use]
    pub fn format_validation(
        &self,
        document: &Document,
        report: &ValidationReport,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ValidationJson {
                valid: report.errors.is_empty(),
                name: &document.settings.name,
                resources: document.resources.len(),
                errors: report
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect(),
                warnings: &report.warnings,
            }),
            OutputFormat::Text => {
                let mut output = format!("{} Document is valid.\n", "✓".green());

                if show_warnings && !report.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &report.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = write!(output, "\nDocument summary:\n");
                let _ = writeln!(output, "   Name: {}", document.settings.name);
                let _ = writeln!(output, "   Resources: {}", document.resources.len());
                let kinds: Vec<String> = document.kinds().iter().map(ToString::to_string).collect();
                let _ = writeln!(output, "   Kinds: {}", kinds.join(", "));
                output
            }
        }
    }

    /// Formats a reconciliation plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, document_hash: &str, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::new(plan, document_hash)),
            OutputFormat::Text => Self::format_plan_text(plan, document_hash, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, document_hash: &str, detailed: bool) -> String {
        let summary = plan.summary();
        let mut output = String::new();

        if plan.is_converged() {
            let _ = writeln!(
                output,
                "{} No changes required. {} resource(s) already converged.",
                "✓".green(),
                summary.noops
            );
            return output;
        }

        let _ = write!(output, "\nReconciliation Plan\n");
        let _ = write!(output, "   Document hash: {}\n\n", short(document_hash));

        let rows: Vec<ChangeRow> = plan
            .batches
            .iter()
            .enumerate()
            .flat_map(|(index, batch)| {
                batch
                    .iter()
                    .filter(move |change| detailed || !change.is_noop())
                    .map(move |change| ChangeRow {
                        batch: index + 1,
                        action: Self::format_change_kind(change.kind),
                        resource: change.key.to_string(),
                        attributes: Self::format_diff_summary(change, detailed),
                    })
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if !plan.unobserved.is_empty() {
            let _ = write!(output, "\n{} Could not observe:\n", "⚠".yellow());
            for entry in &plan.unobserved {
                let _ = writeln!(
                    output,
                    "   - {} ({} attempt(s)): {}",
                    entry.key, entry.failure.attempts, entry.failure.error
                );
            }
        }

        let _ = write!(output, "\n{}\n", Self::format_summary_line(&summary));
        output
    }

    /// Formats a reconciliation report for display.
    #[must_use]
    pub fn format_report(&self, report: &ReconciliationReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ReportJson::from(report)),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &ReconciliationReport) -> String {
        let headline = match report.status {
            RunStatus::Aborted => format!("{} Run aborted", "✗".red()),
            RunStatus::Completed if report.is_success() => {
                format!("{} Run completed", "✓".green())
            }
            RunStatus::Completed => format!("{} Run completed with failures", "✗".red()),
        };

        let mut output = format!("{headline}\n\n");
        let _ = writeln!(output, "   Run: {}", report.run_id);
        let _ = writeln!(output, "   Document: {} ({})", report.name, short(&report.document_hash));
        let _ = writeln!(
            output,
            "   Started: {}",
            report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let _ = writeln!(output, "   Duration: {}ms", report.duration_ms);
        let _ = writeln!(output, "   {}", Self::format_counts(&report.counts));

        let rows: Vec<ResultRow> = report
            .results
            .iter()
            .map(|r| ResultRow {
                resource: r.key.to_string(),
                change: r.change.as_ref().map_or_else(|| String::from("-"), |c| c.kind.to_string()),
                outcome: Self::format_outcome(r.outcome),
                attempts: r.attempts,
                duration: format!("{}ms", r.duration_ms),
                detail: r
                    .error
                    .as_deref()
                    .map(|e| truncate(e, 60))
                    .or_else(|| r.skip_reason.map(|s| s.to_string()))
                    .unwrap_or_default(),
            })
            .collect();

        if !rows.is_empty() {
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let failures: Vec<_> = report.failures().collect();
        if !failures.is_empty() {
            let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
            for failure in failures {
                let _ = writeln!(
                    output,
                    "   - {}: {}",
                    failure.key,
                    failure.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&DriftJson::from(report)),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected. {} resource(s) in sync.\n",
                        "✓".green(),
                        report.in_sync
                    );
                }

                let mut output = String::new();
                if !report.drifted.is_empty() {
                    let _ = write!(output, "{} Drift detected:\n\n", "⚠".yellow());
                    for change in &report.drifted {
                        let _ = writeln!(
                            output,
                            "   {} {}",
                            Self::format_change_kind(change.kind),
                            change.key
                        );
                        for diff in &change.attribute_diffs {
                            let _ = writeln!(output, "       {}", format_attribute_diff(diff));
                        }
                    }
                }
                if !report.unobserved.is_empty() {
                    let _ = write!(output, "\n{} Could not observe:\n", "⚠".yellow());
                    for entry in &report.unobserved {
                        let _ = writeln!(output, "   - {}: {}", entry.key, entry.error);
                    }
                }
                let _ = write!(
                    output,
                    "\n{} drifted, {} unobserved, {} in sync.\n",
                    report.drifted.len(),
                    report.unobserved.len(),
                    report.in_sync
                );
                output
            }
        }
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": "error", "message": message })),
            OutputFormat::Text => format!("{} {message}", "✗".red()),
        }
    }

    /// Formats an informational message.
    #[must_use]
    pub fn notice(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": "info", "message": message })),
            OutputFormat::Text => message.to_string(),
        }
    }

    fn format_summary_line(summary: &PlanSummary) -> String {
        format!(
            "Plan: {} to create, {} to update, {} to delete, {} unchanged, {} unobserved ({} batch(es))",
            summary.creates.to_string().green(),
            summary.updates.to_string().yellow(),
            summary.deletes.to_string().red(),
            summary.noops,
            summary.unobserved,
            summary.batches
        )
    }

    fn format_counts(counts: &OutcomeCounts) -> String {
        format!(
            "Results: {} applied, {} unchanged, {} failed, {} skipped",
            counts.applied.to_string().green(),
            counts.unchanged,
            counts.failed.to_string().red(),
            counts.skipped.to_string().yellow()
        )
    }

    fn format_diff_summary(change: &Change, detailed: bool) -> String {
        if detailed {
            change
                .attribute_diffs
                .iter()
                .map(format_attribute_diff)
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            let names: Vec<&str> = change.attribute_diffs.iter().map(|d| d.attribute.as_str()).collect();
            truncate(&names.join(", "), 40)
        }
    }

    /// Formats a change kind with color.
    fn format_change_kind(kind: ChangeKind) -> String {
        match kind {
            ChangeKind::Create => "+create".green().to_string(),
            ChangeKind::Update => "~update".yellow().to_string(),
            ChangeKind::Delete => "-delete".red().to_string(),
            ChangeKind::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Formats an outcome with color.
    fn format_outcome(outcome: Outcome) -> String {
        match outcome {
            Outcome::Applied => "applied".green().to_string(),
            Outcome::Unchanged => "unchanged".dimmed().to_string(),
            Outcome::Failed => "failed".red().to_string(),
            Outcome::Skipped => "skipped".yellow().to_string(),
        }
    }
}

fn format_attribute_diff(diff: &AttributeDiff) -> String {
    format!(
        "{}: {} -> {}",
        diff.attribute,
        display_value(diff.from.as_ref()),
        display_value(diff.to.as_ref())
    )
}

fn display_value(value: Option<&AttributeValue>) -> String {
    value.map_or_else(|| String::from("(absent)"), ToString::to_string)
}

/// First eight characters of a hash.
fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

/// Truncates a string to at most `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    name: &'a str,
    resources: usize,
    errors: Vec<String>,
    warnings: &'a [String],
}

#[derive(Serialize)]
struct PlanJson<'a> {
    document_hash: &'a str,
    created_at: String,
    summary: PlanSummary,
    batches: Vec<Vec<ChangeJson<'a>>>,
    unobserved: Vec<UnobservedJson>,
}

#[derive(Serialize)]
struct ChangeJson<'a> {
    resource: String,
    change: ChangeKind,
    attribute_diffs: &'a [AttributeDiff],
}

#[derive(Serialize)]
struct UnobservedJson {
    resource: String,
    error: String,
    attempts: u32,
}

impl<'a> PlanJson<'a> {
    fn new(plan: &'a Plan, document_hash: &'a str) -> Self {
        Self {
            document_hash,
            created_at: plan.created_at.to_rfc3339(),
            summary: plan.summary(),
            batches: plan
                .batches
                .iter()
                .map(|batch| batch.iter().map(ChangeJson::from).collect())
                .collect(),
            unobserved: plan
                .unobserved
                .iter()
                .map(|u| UnobservedJson {
                    resource: u.key.to_string(),
                    error: u.failure.error.to_string(),
                    attempts: u.failure.attempts,
                })
                .collect(),
        }
    }
}

impl<'a> From<&'a Change> for ChangeJson<'a> {
    fn from(change: &'a Change) -> Self {
        Self {
            resource: change.key.to_string(),
            change: change.kind,
            attribute_diffs: &change.attribute_diffs,
        }
    }
}

impl From<&UnobservedEntry> for UnobservedJson {
    fn from(entry: &UnobservedEntry) -> Self {
        Self {
            resource: entry.key.to_string(),
            error: entry.error.clone(),
            attempts: entry.attempts,
        }
    }
}

#[derive(Serialize)]
struct ReportJson<'a> {
    #[serde(flatten)]
    report: &'a ReconciliationReport,
    success: bool,
    exit_code: i32,
}

impl<'a> From<&'a ReconciliationReport> for ReportJson<'a> {
    fn from(report: &'a ReconciliationReport) -> Self {
        Self {
            report,
            success: report.is_success(),
            exit_code: report.exit_code(),
        }
    }
}

#[derive(Serialize)]
struct DriftJson<'a> {
    document_hash: &'a str,
    checked_at: String,
    converged: bool,
    in_sync: usize,
    drifted: Vec<ChangeJson<'a>>,
    unobserved: Vec<UnobservedJson>,
}

impl<'a> From<&'a DriftReport> for DriftJson<'a> {
    fn from(report: &'a DriftReport) -> Self {
        Self {
            document_hash: &report.document_hash,
            checked_at: report.checked_at.to_rfc3339(),
            converged: report.is_converged(),
            in_sync: report.in_sync,
            drifted: report.drifted.iter().map(ChangeJson::from).collect(),
            unobserved: report.unobserved.iter().map(UnobservedJson::from).collect(),
        }
    }
}
