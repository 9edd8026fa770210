//! In-memory state provider with scripted fault injection.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;
use crate::planner::Change;
use crate::resource::{Attributes, ResourceKey, ResourceKind};

use super::entries::{self, Entries};
use super::{ObservedState, ProviderResult, StateProvider};

/// Errors scripted for one key.
#[derive(Debug, Default)]
struct Faults {
    fetch: VecDeque<ProviderError>,
    apply: VecDeque<ProviderError>,
    apply_always: Option<ProviderError>,
}

#[derive(Debug, Default)]
struct Inner {
    store: BTreeMap<(ResourceKind, String), Entries>,
    faults: HashMap<ResourceKey, Faults>,
    apply_calls: HashMap<ResourceKey, u32>,
}

/// Provider keeping every kind and target in process memory.
///
/// Cloning shares the underlying store, so a test can keep a handle for
/// seeding and inspection after registering the provider.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    inner: Arc<Mutex<Inner>>,
    latency: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every `fetch` and `apply` by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a live resource.
    pub fn seed(&self, key: &ResourceKey, attributes: Attributes) {
        self.lock()
            .store
            .entry((key.kind, key.target.clone()))
            .or_default()
            .insert(key.identity.clone(), attributes);
    }

    /// Returns the live attributes of a resource, if it exists.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<Attributes> {
        self.lock()
            .store
            .get(&(key.kind, key.target.clone()))
            .and_then(|entries| entries::lookup(entries, &key.identity))
    }

    /// Makes the next `fetch` of `key` fail with `error`. Calls queue up.
    pub fn fail_next_fetch(&self, key: &ResourceKey, error: ProviderError) {
        self.lock()
            .faults
            .entry(key.clone())
            .or_default()
            .fetch
            .push_back(error);
    }

    /// Makes the next `apply` on `key` fail with `error`. Calls queue up.
    pub fn fail_next_apply(&self, key: &ResourceKey, error: ProviderError) {
        self.lock()
            .faults
            .entry(key.clone())
            .or_default()
            .apply
            .push_back(error);
    }

    /// Makes every `apply` on `key` fail with `error` once queued faults run
    /// out.
    pub fn fail_every_apply(&self, key: &ResourceKey, error: ProviderError) {
        self.lock().faults.entry(key.clone()).or_default().apply_always = Some(error);
    }

    /// Number of `apply` calls received for `key`, failed ones included.
    #[must_use]
    pub fn apply_calls(&self, key: &ResourceKey) -> u32 {
        self.lock().apply_calls.get(key).copied().unwrap_or(0)
    }

    /// Total `apply` calls received.
    #[must_use]
    pub fn total_apply_calls(&self) -> u32 {
        self.lock().apply_calls.values().sum()
    }

    /// Highest number of `apply` calls observed in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl StateProvider for MemoryProvider {
    async fn fetch(&self, key: &ResourceKey) -> ProviderResult<ObservedState> {
        self.simulate_latency().await;

        if let Some(err) = self
            .lock()
            .faults
            .get_mut(key)
            .and_then(|f| f.fetch.pop_front())
        {
            return Err(err);
        }

        Ok(match self.get(key) {
            Some(attributes) => ObservedState::present(key.clone(), attributes),
            None => ObservedState::absent(key.clone()),
        })
    }

    async fn apply(&self, change: &Change) -> ProviderResult<()> {
        let key = &change.key;
        *self.lock().apply_calls.entry(key.clone()).or_insert(0) += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.simulate_latency().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut inner = self.lock();
        if let Some(faults) = inner.faults.get_mut(key) {
            if let Some(err) = faults.apply.pop_front().or_else(|| faults.apply_always.clone()) {
                debug!("memory provider: injected failure for {key}: {err}");
                return Err(err);
            }
        }

        let entries = inner
            .store
            .entry((key.kind, key.target.clone()))
            .or_default();
        entries::apply_change(entries, change)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{AttributeDiff, ChangeKind};
    use crate::resource::AttributeValue;

    fn key() -> ResourceKey {
        ResourceKey::new(ResourceKind::AdGroup, "corp", "FinanceUsers")
    }

    fn create() -> Change {
        Change {
            key: key(),
            kind: ChangeKind::Create,
            attribute_diffs: vec![AttributeDiff {
                attribute: String::from("scope"),
                from: None,
                to: Some(AttributeValue::from("global")),
            }],
        }
    }

    #[tokio::test]
    async fn test_fetch_missing_is_absent_not_error() {
        let provider = MemoryProvider::new();
        let observed = provider.fetch(&key()).await.unwrap();
        assert!(!observed.exists);
        assert!(observed.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_apply_then_fetch() {
        let provider = MemoryProvider::new();
        provider.apply(&create()).await.unwrap();
        provider.apply(&create()).await.unwrap();

        let observed = provider.fetch(&key()).await.unwrap();
        assert!(observed.exists);
        assert_eq!(observed.attributes["scope"], AttributeValue::from("global"));
        assert_eq!(provider.apply_calls(&key()), 2);
    }

    #[tokio::test]
    async fn test_scripted_faults_are_consumed_in_order() {
        let provider = MemoryProvider::new();
        provider.fail_next_fetch(&key(), ProviderError::unavailable("directory service", "down"));
        provider.fail_next_apply(&key(), ProviderError::permission_denied(&key(), "denied"));

        assert!(provider.fetch(&key()).await.is_err());
        assert!(provider.fetch(&key()).await.is_ok());

        assert!(matches!(
            provider.apply(&create()).await,
            Err(ProviderError::PermissionDenied { .. })
        ));
        assert!(provider.apply(&create()).await.is_ok());
    }

    #[tokio::test]
    async fn test_persistent_fault() {
        let provider = MemoryProvider::new();
        provider.fail_every_apply(&key(), ProviderError::unavailable("directory service", "down"));
        for _ in 0..3 {
            assert!(provider.apply(&create()).await.is_err());
        }
        assert!(provider.get(&key()).is_none());
    }
}
