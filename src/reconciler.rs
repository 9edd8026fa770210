//! Reconciler: one pass from desired state to converged state.
//!
//! A run validates the document, observes every resource fresh, diffs,
//! plans, executes and aggregates the results into a report. Nothing
//! observed is cached between runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, Document, ValidationReport};
use crate::error::{ProviderError, ReconError, Result};
use crate::planner::{
    Assessment, CancelToken, Change, Differ, Executor, ObservationFailure, Plan, PlanBuilder,
};
use crate::provider::{ObservedState, ProviderBinding, ProviderRegistry, StateProvider};
use crate::report::ReconciliationReport;
use crate::resource::{ResourceKey, ResourceKind};

/// Observation outcome for one resource.
pub type Observation = std::result::Result<ObservedState, ObservationFailure>;

/// Drives validation, observation, planning and execution for one document.
#[derive(Debug)]
pub struct Reconciler {
    document: Arc<Document>,
    registry: Arc<ProviderRegistry>,
    differ: Differ,
    hasher: ConfigHasher,
    cancel: CancelToken,
}

/// Resources whose live state differs from the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    /// Hash of the document checked.
    pub document_hash: String,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
    /// Changes that would converge drifted resources.
    pub drifted: Vec<Change>,
    /// Resources that could not be observed.
    pub unobserved: Vec<UnobservedEntry>,
    /// Resources already converged.
    pub in_sync: usize,
}

/// A resource that could not be observed, for output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnobservedEntry {
    /// The resource.
    pub key: ResourceKey,
    /// Last fetch error.
    pub error: String,
    /// Fetch attempts made.
    pub attempts: u32,
}

impl DriftReport {
    /// Returns true if nothing drifted and everything was observed.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty() && self.unobserved.is_empty()
    }
}

/// Builds a registry binding `provider` to every kind, with the document's
/// policies.
#[must_use]
pub fn registry_for(document: &Document, provider: &Arc<dyn StateProvider>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for kind in ResourceKind::ALL {
        registry.register(kind, Arc::clone(provider), document.policy_for(kind));
    }
    registry
}

impl Reconciler {
    /// Creates a reconciler for `document` over `registry`.
    #[must_use]
    pub fn new(document: Document, registry: ProviderRegistry) -> Self {
        let differ = Differ::new(document.effective_schema());
        Self {
            document: Arc::new(document),
            registry: Arc::new(registry),
            differ,
            hasher: ConfigHasher::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Uses `token` to cancel `apply`.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// The document.
    #[must_use]
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Hash of the document.
    #[must_use]
    pub fn document_hash(&self) -> String {
        self.hasher.hash_document(&self.document)
    }

    /// Validates the document and checks every used kind has a provider.
    ///
    /// # Errors
    ///
    /// Returns the first configuration or validation error.
    pub fn validate(&self) -> Result<ValidationReport> {
        let report = ConfigValidator::new().validate(&self.document)?;
        for warning in &report.warnings {
            warn!("{warning}");
        }
        self.registry.ensure_bound(&self.document.kinds())?;
        Ok(report)
    }

    /// Fetches the live state of every resource concurrently, bounded per
    /// kind and under each kind's retry policy.
    ///
    /// # Errors
    ///
    /// Returns `ProviderMissing` if a kind has no provider. Fetch failures are
    /// returned per resource, not as an error.
    pub async fn observe(&self) -> Result<BTreeMap<ResourceKey, Observation>> {
        let mut handles: Vec<(ResourceKey, JoinHandle<Observation>)> = Vec::new();

        for resource in &self.document.resources {
            let key = resource.key();
            let binding = self.registry.get(resource.kind)?.clone();
            handles.push((key.clone(), tokio::spawn(observe_one(key, binding))));
        }

        let mut observations = BTreeMap::new();
        for (key, handle) in handles {
            let observation = handle.await.unwrap_or_else(|e| {
                Err(ObservationFailure {
                    error: ProviderError::unavailable(key.kind.subsystem(), format!("fetch task did not complete: {e}")),
                    attempts: 0,
                })
            });
            observations.insert(key, observation);
        }

        debug!("Observed {} resource(s)", observations.len());
        Ok(observations)
    }

    /// Validates, observes and diffs, then builds a plan.
    ///
    /// # Errors
    ///
    /// Returns configuration and validation errors. No change is applied.
    pub async fn plan(&self) -> Result<Plan> {
        info!(
            "Planning '{}' ({} resource(s))",
            self.document.settings.name,
            self.document.resources.len()
        );
        self.validate()?;

        let observations = self.observe().await?;
        let assessments: BTreeMap<ResourceKey, Assessment> = self
            .document
            .resources
            .iter()
            .filter_map(|resource| {
                let key = resource.key();
                let observation = observations.get(&key)?;
                let assessment = match observation {
                    Ok(observed) => Ok(self.differ.diff(resource, observed)),
                    Err(failure) => Err(failure.clone()),
                };
                Some((key, assessment))
            })
            .collect();

        Ok(PlanBuilder::build(&self.document.resources, assessments)?)
    }

    /// Plans and applies, returning the run report.
    ///
    /// # Errors
    ///
    /// Returns configuration and validation errors raised before execution.
    /// Per-change failures are in the report.
    pub async fn apply(&self) -> Result<ReconciliationReport> {
        let started_at = Utc::now();
        let plan = self.plan().await?;
        self.apply_plan(&plan, started_at).await
    }

    /// Applies an already built plan.
    ///
    /// # Errors
    ///
    /// Returns `ProviderMissing` if a kind in the plan has no provider.
    pub async fn apply_plan(&self, plan: &Plan, started_at: DateTime<Utc>) -> Result<ReconciliationReport> {
        let execution = Executor::new(Arc::clone(&self.registry))
            .with_cancel_token(self.cancel.clone())
            .execute(plan)
            .await
            .map_err(ReconError::Config)?;

        let report = ReconciliationReport::new(
            self.document.settings.name.clone(),
            self.document_hash(),
            started_at,
            plan.summary(),
            execution,
        );

        info!(
            "Run {} {}: {} applied, {} unchanged, {} failed, {} skipped",
            report.run_id,
            report.status,
            report.counts.applied,
            report.counts.unchanged,
            report.counts.failed,
            report.counts.skipped
        );
        Ok(report)
    }

    /// Plans without applying and lists what drifted.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::plan`].
    pub async fn drift(&self) -> Result<DriftReport> {
        let plan = self.plan().await?;
        let drifted: Vec<Change> = plan.changes().filter(|c| !c.is_noop()).cloned().collect();
        let in_sync = plan.summary().noops;
        let unobserved = plan
            .unobserved
            .iter()
            .map(|u| UnobservedEntry {
                key: u.key.clone(),
                error: u.failure.error.to_string(),
                attempts: u.failure.attempts,
            })
            .collect();

        for change in &drifted {
            info!("Drift: {} needs {}", change.key, change.kind);
        }

        Ok(DriftReport {
            document_hash: self.document_hash(),
            checked_at: Utc::now(),
            drifted,
            unobserved,
            in_sync,
        })
    }
}

async fn observe_one(key: ResourceKey, binding: ProviderBinding) -> Observation {
    let Ok(_permit) = binding.permits.acquire_owned().await else {
        return Err(ObservationFailure {
            error: ProviderError::unavailable(key.kind.subsystem(), "concurrency limiter closed"),
            attempts: 0,
        });
    };

    let provider = Arc::clone(&binding.provider);
    let (result, attempts) = binding.policy.run("fetch", &key, || provider.fetch(&key)).await;
    result.map_err(|error| ObservationFailure { error, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{ChangeKind, Outcome, RunStatus, SkipReason};
    use crate::provider::{FileProvider, MemoryProvider, ProviderPolicy};
    use crate::report::{EXIT_FAILURE, EXIT_SUCCESS};
    use crate::resource::{AttributeValue, Attributes, Resource};
    use crate::error::{ConfigError, ValidationError};
    use std::time::Duration;
    use tempfile::TempDir;

    fn finance_share() -> Resource {
        Resource::new(ResourceKind::Share, "Finance").with_attribute("path", r"D:\Fin")
    }

    fn document(resources: Vec<Resource>) -> Document {
        Document {
            resources,
            ..Document::default()
        }
    }

    fn fast(document: &Document, provider: Arc<dyn StateProvider>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for kind in ResourceKind::ALL {
            let policy = ProviderPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                ..document.policy_for(kind)
            };
            registry.register(kind, Arc::clone(&provider), policy);
        }
        registry
    }

    #[tokio::test]
    async fn test_finance_share_converges() {
        let provider = MemoryProvider::new();
        let doc = document(vec![finance_share()]);
        let reconciler = Reconciler::new(doc.clone(), fast(&doc, Arc::new(provider.clone())));

        let plan = reconciler.plan().await.unwrap();
        let change = plan.changes().next().unwrap();
        assert_eq!(change.kind, ChangeKind::Create);

        let report = reconciler.apply_plan(&plan, Utc::now()).await.unwrap();
        assert_eq!(report.counts.applied, 1);
        assert_eq!(report.exit_code(), EXIT_SUCCESS);

        let plan = reconciler.plan().await.unwrap();
        assert!(plan.is_converged());
        assert!(plan.changes().all(Change::is_noop));
    }

    #[tokio::test]
    async fn test_apply_converges_across_runs_with_file_provider() {
        let dir = TempDir::new().unwrap();
        let doc = document(vec![
            Resource::new(ResourceKind::OrganizationalUnit, "Finance").on("corp"),
            Resource::new(ResourceKind::AdGroup, "FinanceUsers")
                .on("corp")
                .with_attribute("members", AttributeValue::List(vec![String::from("jdoe"), String::from("asmith")]))
                .depends_on(ResourceKind::OrganizationalUnit, "Finance"),
            finance_share(),
        ]);

        let provider: Arc<dyn StateProvider> = Arc::new(FileProvider::new(dir.path()));
        let first = Reconciler::new(doc.clone(), registry_for(&doc, &provider));
        let report = first.apply().await.unwrap();
        assert_eq!(report.counts.applied, 3);

        let provider: Arc<dyn StateProvider> = Arc::new(FileProvider::new(dir.path()));
        let second = Reconciler::new(doc.clone(), registry_for(&doc, &provider));
        let report = second.apply().await.unwrap();
        assert_eq!(report.counts.unchanged, 3);
        assert_eq!(report.counts.applied, 0);
        assert!(second.drift().await.unwrap().is_converged());
    }

    #[tokio::test]
    async fn test_drift_reports_external_change() {
        let provider = MemoryProvider::new();
        let share = finance_share();
        let mut live = Attributes::new();
        live.insert(String::from("path"), AttributeValue::from(r"E:\Moved"));
        provider.seed(&share.key(), live);

        let doc = document(vec![share.clone(), Resource::new(ResourceKind::Service, "Spooler")]);
        provider.seed(&Resource::new(ResourceKind::Service, "Spooler").key(), Attributes::new());

        let drift = Reconciler::new(doc.clone(), fast(&doc, Arc::new(provider)))
            .drift()
            .await
            .unwrap();
        assert!(!drift.is_converged());
        assert_eq!(drift.drifted.len(), 1);
        assert_eq!(drift.drifted[0].key, share.key());
        assert_eq!(drift.in_sync, 1);
    }

    #[tokio::test]
    async fn test_fetch_retries_then_blocks_dependents() {
        let provider = MemoryProvider::new();
        let ou = Resource::new(ResourceKind::OrganizationalUnit, "Finance").on("corp");
        let user = Resource::new(ResourceKind::AdUser, "jdoe")
            .on("corp")
            .depends_on(ResourceKind::OrganizationalUnit, "Finance");
        for _ in 0..ProviderPolicy::network().max_attempts {
            provider.fail_next_fetch(&ou.key(), ProviderError::unavailable("directory service", "down"));
        }

        let doc = document(vec![ou.clone(), user.clone()]);
        let report = Reconciler::new(doc.clone(), fast(&doc, Arc::new(provider.clone())))
            .apply()
            .await
            .unwrap();

        let failed = report.failures().next().unwrap();
        assert_eq!(failed.key, ou.key());
        assert!(failed.change.is_none());
        assert_eq!(failed.attempts, ProviderPolicy::network().max_attempts);
        assert_eq!(report.skipped_for(SkipReason::UpstreamFailure).count(), 1);
        assert_eq!(report.exit_code(), EXIT_FAILURE);
        assert_eq!(provider.total_apply_calls(), 0);
    }

    #[tokio::test]
    async fn test_validation_errors_stop_before_side_effects() {
        let provider = MemoryProvider::new();
        let doc = document(vec![
            Resource::new(ResourceKind::AdGroup, "A").depends_on(ResourceKind::AdGroup, "B"),
            Resource::new(ResourceKind::AdGroup, "B").depends_on(ResourceKind::AdGroup, "A"),
        ]);

        let err = Reconciler::new(doc.clone(), fast(&doc, Arc::new(provider.clone())))
            .apply()
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::Validation(ValidationError::CyclicDependency { .. })));
        assert!(err.is_pre_execution());
        assert_eq!(provider.total_apply_calls(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_config_error() {
        let doc = document(vec![finance_share()]);
        let err = Reconciler::new(doc, ProviderRegistry::new()).plan().await.unwrap_err();
        assert!(matches!(
            err,
            ReconError::Config(ConfigError::ProviderMissing {
                kind: ResourceKind::Share
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_aborted() {
        let provider = MemoryProvider::new();
        let doc = document(vec![finance_share()]);
        let token = CancelToken::new();
        token.cancel();

        let report = Reconciler::new(doc.clone(), fast(&doc, Arc::new(provider.clone())))
            .with_cancel_token(token)
            .apply()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.results[0].outcome, Outcome::Skipped);
        assert_eq!(report.results[0].skip_reason, Some(SkipReason::Cancelled));
        assert_eq!(provider.total_apply_calls(), 0);
    }
}
