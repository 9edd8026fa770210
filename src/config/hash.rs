//! Document fingerprinting.
//!
//! A document hash identifies the desired state a plan or report was
//! computed from. It is independent of resource declaration order.

use sha2::{Digest, Sha256};

use crate::resource::Resource;

use super::document::Document;

/// Hasher for desired-state documents.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of everything that influences a plan: resources,
    /// comparison rules and provider policies.
    #[must_use]
    pub fn hash_document(&self, document: &Document) -> String {
        let mut hasher = Sha256::new();

        hasher.update(document.settings.name.as_bytes());
        hasher.update([u8::from(document.settings.default_schema)]);

        // Maps are ordered, so JSON encoding is deterministic.
        if let Ok(schema) = serde_json::to_vec(&document.schema) {
            hasher.update(&schema);
        }
        if let Ok(providers) = serde_json::to_vec(&document.providers) {
            hasher.update(&providers);
        }

        let mut resources: Vec<_> = document.resources.iter().collect();
        resources.sort_by_key(|r| r.key());
        for resource in resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(resource.target.as_bytes());
        hasher.update([0]);
        hasher.update(resource.identity.as_bytes());
        hasher.update([0]);
        hasher.update(format!("{:?}", resource.ensure).as_bytes());

        // JSON keeps list elements and value types apart.
        for (name, value) in &resource.attributes {
            hasher.update(name.as_bytes());
            hasher.update([0]);
            if let Ok(encoded) = serde_json::to_vec(value) {
                hasher.update(&encoded);
            }
            hasher.update([0]);
        }

        for dep in resource.dependency_keys() {
            if let Ok(encoded) = serde_json::to_vec(&dep) {
                hasher.update(&encoded);
            }
            hasher.update([0]);
        }

        hex::encode(hasher.finalize())
    }
}
