//! Plan construction.
//!
//! Validates the dependency graph of a document and layers the computed
//! changes into batches: every prerequisite lands in an earlier batch than
//! its dependents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::error::{ProviderError, ValidationError};
use crate::resource::{Resource, ResourceKey};

use super::diff::{Change, ChangeKind};

/// Why a resource could not be assessed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationFailure {
    /// Last `fetch` error.
    pub error: ProviderError,
    /// `fetch` attempts made.
    pub attempts: u32,
}

/// Outcome of observing and diffing one resource.
pub type Assessment = Result<Change, ObservationFailure>;

/// A resource left out of the batches because its state is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unobserved {
    /// The resource.
    pub key: ResourceKey,
    /// Why it was not observed.
    pub failure: ObservationFailure,
}

/// Ordered batches of changes.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was built.
    pub created_at: DateTime<Utc>,
    /// Batches in execution order; changes within a batch are independent.
    pub batches: Vec<Vec<Change>>,
    /// Resources whose observation failed. They block their dependents.
    pub unobserved: Vec<Unobserved>,
    /// Direct prerequisites of each resource.
    pub prerequisites: BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
}

/// Change counts of a plan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSummary {
    /// Resources to create.
    pub creates: usize,
    /// Resources to update.
    pub updates: usize,
    /// Resources to delete.
    pub deletes: usize,
    /// Resources already converged.
    pub noops: usize,
    /// Resources that could not be observed.
    pub unobserved: usize,
    /// Number of batches.
    pub batches: usize,
}

/// Builds plans from validated resources and their assessments.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanBuilder;

impl PlanSummary {
    /// Number of changes that would touch a provider.
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

impl Plan {
    /// Iterates over every change in execution order.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.batches.iter().flatten()
    }

    /// Returns change counts.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            unobserved: self.unobserved.len(),
            batches: self.batches.len(),
            ..PlanSummary::default()
        };
        for change in self.changes() {
            match change.kind {
                ChangeKind::Create => summary.creates += 1,
                ChangeKind::Update => summary.updates += 1,
                ChangeKind::Delete => summary.deletes += 1,
                ChangeKind::NoOp => summary.noops += 1,
            }
        }
        summary
    }

    /// Returns true if applying the plan would call a provider.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes().any(|c| !c.is_noop())
    }

    /// Returns true if every resource was observed and is converged.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.unobserved.is_empty() && !self.has_changes()
    }
}

/// Dependency graph over declared resources.
struct Graph {
    prerequisites: BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
    dependents: BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
}

impl Graph {
    fn new(resources: &[Resource]) -> Result<Self, ValidationError> {
        let mut prerequisites: BTreeMap<ResourceKey, BTreeSet<ResourceKey>> = BTreeMap::new();
        for resource in resources {
            let key = resource.key();
            if prerequisites.contains_key(&key) {
                return Err(ValidationError::DuplicateResource { key });
            }
            prerequisites.insert(key, resource.dependency_keys().into_iter().collect());
        }

        let mut dependents: BTreeMap<ResourceKey, BTreeSet<ResourceKey>> = prerequisites
            .keys()
            .map(|k| (k.clone(), BTreeSet::new()))
            .collect();

        for (key, prereqs) in &prerequisites {
            for prereq in prereqs {
                let Some(set) = dependents.get_mut(prereq) else {
                    return Err(ValidationError::UnknownDependency {
                        from: key.clone(),
                        to: prereq.clone(),
                    });
                };
                set.insert(key.clone());
            }
        }

        Ok(Self {
            prerequisites,
            dependents,
        })
    }

    /// Kahn layering. Each layer is sorted by key.
    fn layers(&self) -> Result<Vec<Vec<ResourceKey>>, ValidationError> {
        let mut in_degree: BTreeMap<&ResourceKey, usize> = self
            .prerequisites
            .iter()
            .map(|(k, p)| (k, p.len()))
            .collect();

        let mut ready: Vec<&ResourceKey> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !ready.is_empty() {
            let mut next = Vec::new();
            for key in &ready {
                for dependent in &self.dependents[*key] {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            placed += ready.len();
            layers.push(ready.into_iter().cloned().collect());
            next.sort();
            ready = next;
        }

        if placed < self.prerequisites.len() {
            let remaining: BTreeSet<&ResourceKey> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(k, _)| *k)
                .collect();
            if let Some(start) = remaining.first() {
                return Err(self.cycle_edge(start, &remaining));
            }
        }

        Ok(layers)
    }

    /// Names one edge lying on a cycle among `remaining`, walking backwards
    /// from `start` until a node repeats.
    fn cycle_edge(&self, start: &ResourceKey, remaining: &BTreeSet<&ResourceKey>) -> ValidationError {
        let prereq_of = |key: &ResourceKey| -> Option<ResourceKey> {
            self.prerequisites
                .get(key)
                .and_then(|p| p.iter().find(|k| remaining.contains(k)))
                .cloned()
        };

        let mut seen = BTreeSet::new();
        let mut current = start.clone();
        loop {
            let Some(prev) = prereq_of(&current) else {
                return ValidationError::CyclicDependency {
                    from: current.clone(),
                    to: current,
                };
            };
            if !seen.insert(current.clone()) {
                return ValidationError::CyclicDependency {
                    from: current,
                    to: prev,
                };
            }
            current = prev;
        }
    }
}

impl PlanBuilder {
    /// Validates `resources` and returns their keys layered by dependency.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource`, `UnknownDependency` or `CyclicDependency`.
    pub fn layers(resources: &[Resource]) -> Result<Vec<Vec<ResourceKey>>, ValidationError> {
        Graph::new(resources)?.layers()
    }

    /// Checks the dependency graph without building a plan.
    ///
    /// # Errors
    ///
    /// Same as [`PlanBuilder::layers`].
    pub fn validate(resources: &[Resource]) -> Result<(), ValidationError> {
        Self::layers(resources).map(|_| ())
    }

    /// Builds a plan from validated resources and their assessments.
    ///
    /// Resources without an assessment are treated as unobserved.
    ///
    /// # Errors
    ///
    /// Same as [`PlanBuilder::layers`]. No partial plan is ever returned.
    pub fn build(
        resources: &[Resource],
        mut assessments: BTreeMap<ResourceKey, Assessment>,
    ) -> Result<Plan, ValidationError> {
        let graph = Graph::new(resources)?;
        let layers = graph.layers()?;

        let mut batches = Vec::with_capacity(layers.len());
        let mut unobserved = Vec::new();

        for layer in layers {
            let mut batch = Vec::with_capacity(layer.len());
            for key in layer {
                match assessments.remove(&key) {
                    Some(Ok(change)) => batch.push(change),
                    Some(Err(failure)) => unobserved.push(Unobserved { key, failure }),
                    None => {
                        let failure = ObservationFailure {
                            error: ProviderError::unavailable(
                                key.kind.subsystem(),
                                "resource was not observed",
                            ),
                            attempts: 0,
                        };
                        unobserved.push(Unobserved { key, failure });
                    }
                }
            }
            if !batch.is_empty() {
                batches.push(batch);
            }
        }

        let plan = Plan {
            created_at: Utc::now(),
            batches,
            unobserved,
            prerequisites: graph.prerequisites,
        };

        let summary = plan.summary();
        info!(
            "Plan: {} create, {} update, {} delete, {} unchanged, {} unobserved in {} batch(es)",
            summary.creates,
            summary.updates,
            summary.deletes,
            summary.noops,
            summary.unobserved,
            summary.batches
        );
        debug!("Plan batches: {:?}", plan.batches.iter().map(Vec::len).collect::<Vec<_>>());

        Ok(plan)
    }
}
