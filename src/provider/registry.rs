//! Explicit binding of resource kinds to providers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::ConfigError;
use crate::resource::ResourceKind;

use super::{ProviderPolicy, StateProvider};

/// A provider bound to one kind, with its policy and concurrency limiter.
#[derive(Clone)]
pub struct ProviderBinding {
    /// The provider.
    pub provider: Arc<dyn StateProvider>,
    /// Retry, timeout and concurrency policy.
    pub policy: ProviderPolicy,
    /// Permits for in-flight calls, sized from `policy.concurrency`.
    pub permits: Arc<Semaphore>,
}

/// Kind to provider table, filled once before a run.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    bindings: HashMap<ResourceKind, ProviderBinding>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `provider` to `kind`, replacing any previous binding.
    pub fn register(
        &mut self,
        kind: ResourceKind,
        provider: Arc<dyn StateProvider>,
        policy: ProviderPolicy,
    ) {
        debug!(
            "Registering provider '{}' for {kind} (attempts={}, concurrency={})",
            provider.name(),
            policy.max_attempts,
            policy.concurrency
        );
        let permits = Arc::new(Semaphore::new(policy.concurrency.max(1)));
        self.bindings.insert(
            kind,
            ProviderBinding {
                provider,
                policy,
                permits,
            },
        );
    }

    /// Returns the binding for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderMissing` if nothing is registered for `kind`.
    pub fn get(&self, kind: ResourceKind) -> Result<&ProviderBinding, ConfigError> {
        self.bindings
            .get(&kind)
            .ok_or(ConfigError::ProviderMissing { kind })
    }

    /// Checks that every kind in `kinds` is bound.
    ///
    /// # Errors
    ///
    /// Returns `ProviderMissing` for the first unbound kind, in kind order.
    pub fn ensure_bound(&self, kinds: &BTreeSet<ResourceKind>) -> Result<(), ConfigError> {
        for kind in kinds {
            self.get(*kind)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ProviderBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderBinding")
            .field("provider", &self.provider.name())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.bindings.keys().copied().collect();
        kinds.sort();
        f.debug_struct("ProviderRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    #[test]
    fn test_missing_kind_is_config_error() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            ResourceKind::Share,
            Arc::new(MemoryProvider::new()),
            ProviderPolicy::local(),
        );

        assert!(registry.get(ResourceKind::Share).is_ok());
        let err = registry.get(ResourceKind::AdUser).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ProviderMissing {
                kind: ResourceKind::AdUser
            }
        ));

        let kinds: BTreeSet<_> = [ResourceKind::Share, ResourceKind::Service].into();
        assert!(registry.ensure_bound(&kinds).is_err());
    }

    #[test]
    fn test_binding_permits_match_policy() {
        let mut registry = ProviderRegistry::new();
        let policy = ProviderPolicy::for_kind(ResourceKind::AdUser);
        registry.register(ResourceKind::AdUser, Arc::new(MemoryProvider::new()), policy.clone());

        let binding = registry.get(ResourceKind::AdUser).unwrap();
        assert_eq!(binding.policy, policy);
        assert_eq!(binding.permits.available_permits(), policy.concurrency);
    }
}
