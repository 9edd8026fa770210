//! Execution policy for provider calls: retries, backoff, timeout and
//! concurrency.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::resource::{ResourceKey, ResourceKind};

use super::ProviderResult;

/// Default per-call timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Attempts for network-backed kinds.
const NETWORK_MAX_ATTEMPTS: u32 = 4;

/// Concurrent writes tolerated by the directory service.
const NETWORK_CONCURRENCY: usize = 2;

/// Concurrent writes for local kinds.
const LOCAL_CONCURRENCY: usize = 8;

/// Policy applied to every `fetch`/`apply` call of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPolicy {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: u32,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
    /// Timeout of a single call.
    pub call_timeout: Duration,
    /// Maximum calls in flight for this kind.
    pub concurrency: usize,
}

/// Partial policy as written in the `providers:` section of a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyOverride {
    /// Total attempts per call.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Delay before the first retry, in milliseconds.
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    /// Upper bound on the delay, in milliseconds.
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    /// Per-call timeout, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Maximum calls in flight.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl ProviderPolicy {
    /// Policy for network-backed providers: retried, low concurrency.
    #[must_use]
    pub const fn network() -> Self {
        Self {
            max_attempts: NETWORK_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(500),
            backoff_multiplier: 2,
            max_backoff: Duration::from_secs(10),
            call_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            concurrency: NETWORK_CONCURRENCY,
        }
    }

    /// Policy for local writes: no retry.
    #[must_use]
    pub const fn local() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(0),
            backoff_multiplier: 2,
            max_backoff: Duration::from_millis(0),
            call_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            concurrency: LOCAL_CONCURRENCY,
        }
    }

    /// Default policy for a resource kind.
    #[must_use]
    pub const fn for_kind(kind: ResourceKind) -> Self {
        if kind.is_directory_backed() {
            Self::network()
        } else {
            Self::local()
        }
    }

    /// Returns a copy with the fields of `over` applied.
    #[must_use]
    pub fn with_override(mut self, over: &PolicyOverride) -> Self {
        if let Some(attempts) = over.max_attempts {
            self.max_attempts = attempts.max(1);
        }
        if let Some(ms) = over.initial_backoff_ms {
            self.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = over.max_backoff_ms {
            self.max_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = over.timeout_secs {
            self.call_timeout = Duration::from_secs(secs);
        }
        if let Some(concurrency) = over.concurrency {
            self.concurrency = concurrency.max(1);
        }
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `call` under this policy's timeout and retry rules.
    ///
    /// Returns the last outcome together with the number of attempts made.
    /// Only retryable errors are retried; a timeout counts as retryable.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        key: &ResourceKey,
        mut call: F,
    ) -> (ProviderResult<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    operation: operation.to_string(),
                    elapsed: self.call_timeout,
                }),
            };

            match outcome {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{operation} {key} failed (attempt {attempt}/{max_attempts}): {err}; retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    debug!("{operation} {key} gave up after {attempt} attempt(s)");
                    return (Err(err), attempt);
                }
            }
        }
    }
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self::local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_network() -> ProviderPolicy {
        ProviderPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            call_timeout: Duration::from_millis(50),
            ..ProviderPolicy::network()
        }
    }

    fn key() -> ResourceKey {
        ResourceKey::new(ResourceKind::AdUser, "corp", "jdoe")
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = ProviderPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            ..ProviderPolicy::network()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_defaults_by_kind() {
        assert_eq!(ProviderPolicy::for_kind(ResourceKind::AdUser).max_attempts, NETWORK_MAX_ATTEMPTS);
        assert_eq!(ProviderPolicy::for_kind(ResourceKind::RegistryValue).max_attempts, 1);
    }

    #[test]
    fn test_override_clamps() {
        let policy = ProviderPolicy::local().with_override(&PolicyOverride {
            max_attempts: Some(0),
            concurrency: Some(0),
            timeout_secs: Some(5),
            ..PolicyOverride::default()
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.concurrency, 1);
        assert_eq!(policy.call_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = fast_network()
            .run("apply", &key(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::unavailable("directory service", "busy"))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = fast_network()
            .run("apply", &key(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::permission_denied(&key(), "access denied"))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::PermissionDenied { .. })));
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable_failure() {
        let (result, attempts) = fast_network()
            .run("fetch", &key(), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ProviderError::Timeout { .. })));
        assert_eq!(attempts, NETWORK_MAX_ATTEMPTS);
    }
}
