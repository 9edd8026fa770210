//! State provider interface and reference implementations.
//!
//! A provider reads the live state of one resource kind and applies computed
//! changes to it. The engine is agnostic to the platform API behind it; the
//! providers shipped here keep state in memory or in JSON files.

mod entries;
mod file;
mod memory;
mod policy;
mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::planner::Change;
use crate::resource::{Attributes, ResourceKey};

pub use file::FileProvider;
pub use memory::MemoryProvider;
pub use policy::{PolicyOverride, ProviderPolicy};
pub use registry::{ProviderBinding, ProviderRegistry};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Live state of one resource at observation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedState {
    /// Observed resource.
    pub key: ResourceKey,
    /// Whether the resource exists.
    pub exists: bool,
    /// Observed attribute values (empty when absent).
    pub attributes: Attributes,
    /// When the observation was taken.
    pub observed_at: DateTime<Utc>,
}

/// Capability to read and write one resource kind.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Fetches the live state of a resource.
    ///
    /// A resource that legitimately does not exist is reported with
    /// `exists = false`, not as an error.
    async fn fetch(&self, key: &ResourceKey) -> ProviderResult<ObservedState>;

    /// Applies a change. Re-applying an already-applied change is a no-op.
    async fn apply(&self, change: &Change) -> ProviderResult<()>;

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

impl ObservedState {
    /// Creates an observation of a missing resource.
    #[must_use]
    pub fn absent(key: ResourceKey) -> Self {
        Self {
            key,
            exists: false,
            attributes: Attributes::new(),
            observed_at: Utc::now(),
        }
    }

    /// Creates an observation of an existing resource.
    #[must_use]
    pub fn present(key: ResourceKey, attributes: Attributes) -> Self {
        Self {
            key,
            exists: true,
            attributes,
            observed_at: Utc::now(),
        }
    }
}
