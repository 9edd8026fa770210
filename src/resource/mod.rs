//! Resource model.
//!
//! Every manageable entity has the same shape: a key (kind, target,
//! identity), the attributes it should have, whether it should exist, and the
//! resources that must be in place before it.

mod attribute;
mod kind;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use attribute::{AttributeRule, AttributeSchema, AttributeValue, CaseRule, OrderRule};
pub use kind::{DEFAULT_TARGET, ResourceKey, ResourceKind, ResourceRef};

/// Attribute name to value, ordered by name.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Whether a resource should exist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    /// The resource must exist with the desired attributes.
    #[default]
    Present,
    /// The resource must not exist.
    Absent,
}

/// A desired-state declaration for one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Identity, unique within kind + target.
    pub identity: String,
    /// Machine or domain the resource lives on.
    #[serde(default = "default_target")]
    pub target: String,
    /// Existence intent.
    #[serde(default)]
    pub ensure: Ensure,
    /// Managed attributes. Anything not listed here is left untouched.
    #[serde(default)]
    pub attributes: Attributes,
    /// Resources that must be reconciled first.
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceRef>,
}

fn default_target() -> String {
    String::from(DEFAULT_TARGET)
}

impl Resource {
    /// Creates a present resource on the default target.
    #[must_use]
    pub fn new(kind: ResourceKind, identity: impl Into<String>) -> Self {
        Self {
            kind,
            identity: identity.into(),
            target: default_target(),
            ensure: Ensure::Present,
            attributes: Attributes::new(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Sets the target.
    #[must_use]
    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Adds a desired attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Adds a dependency on another resource on the same target.
    #[must_use]
    pub fn depends_on(mut self, kind: ResourceKind, identity: impl Into<String>) -> Self {
        self.depends_on.insert(ResourceRef {
            kind,
            identity: identity.into(),
            target: None,
        });
        self
    }

    /// Marks the resource for deletion.
    #[must_use]
    pub const fn absent(mut self) -> Self {
        self.ensure = Ensure::Absent;
        self
    }

    /// Returns the resource key.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.target.clone(), self.identity.clone())
    }

    /// Returns the resolved keys of every dependency.
    #[must_use]
    pub fn dependency_keys(&self) -> Vec<ResourceKey> {
        self.depends_on
            .iter()
            .map(|r| r.resolve(&self.target))
            .collect()
    }
}
