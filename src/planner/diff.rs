//! Differ: desired resource vs observed state.
//!
//! Diffing is pure and synchronous. Only attributes named by the desired
//! resource are compared; anything else on the live object is left alone.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::provider::ObservedState;
use crate::resource::{AttributeSchema, AttributeValue, Ensure, Resource, ResourceKey};

/// Kind of change needed to converge one resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Resource must be created.
    Create,
    /// Some managed attributes differ.
    Update,
    /// Resource must be removed.
    Delete,
    /// Already converged.
    #[serde(rename = "noop")]
    NoOp,
}

/// One attribute transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributeDiff {
    /// Attribute name.
    pub attribute: String,
    /// Observed value (`None` if unset or the resource is missing).
    pub from: Option<AttributeValue>,
    /// Desired value (`None` when the attribute goes away with the resource).
    pub to: Option<AttributeValue>,
}

/// Minimal change converging one resource. Immutable once computed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    /// Affected resource.
    pub key: ResourceKey,
    /// Change kind.
    pub kind: ChangeKind,
    /// Attribute transitions, ordered by attribute name.
    pub attribute_diffs: Vec<AttributeDiff>,
}

/// Computes changes using an attribute comparison schema.
#[derive(Debug, Clone, Default)]
pub struct Differ {
    schema: AttributeSchema,
}

impl ChangeKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Change {
    /// Creates a change with no attribute transitions.
    #[must_use]
    pub const fn noop(key: ResourceKey) -> Self {
        Self {
            key,
            kind: ChangeKind::NoOp,
            attribute_diffs: Vec::new(),
        }
    }

    /// Returns true if applying this change would do nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.kind == ChangeKind::NoOp
    }
}

impl Differ {
    /// Creates a differ using `schema` for attribute comparison.
    #[must_use]
    pub const fn new(schema: AttributeSchema) -> Self {
        Self { schema }
    }

    /// Returns the comparison schema.
    #[must_use]
    pub const fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    /// Computes the change that converges `observed` to `desired`.
    #[must_use]
    pub fn diff(&self, desired: &Resource, observed: &ObservedState) -> Change {
        let key = desired.key();

        let change = match (desired.ensure, observed.exists) {
            (Ensure::Present, false) => Change {
                key,
                kind: ChangeKind::Create,
                attribute_diffs: desired
                    .attributes
                    .iter()
                    .map(|(name, value)| AttributeDiff {
                        attribute: name.clone(),
                        from: None,
                        to: Some(value.clone()),
                    })
                    .collect(),
            },

            (Ensure::Absent, true) => Change {
                key,
                kind: ChangeKind::Delete,
                attribute_diffs: observed
                    .attributes
                    .iter()
                    .filter(|(name, _)| desired.attributes.contains_key(*name))
                    .map(|(name, value)| AttributeDiff {
                        attribute: name.clone(),
                        from: Some(value.clone()),
                        to: None,
                    })
                    .collect(),
            },

            (Ensure::Absent, false) => Change::noop(key),

            (Ensure::Present, true) => {
                let attribute_diffs: Vec<AttributeDiff> = desired
                    .attributes
                    .iter()
                    .filter_map(|(name, want)| {
                        let have = observed.attributes.get(name);
                        let rule = self.schema.rule(desired.kind, name);
                        match have {
                            Some(have) if have.equivalent(want, rule) => None,
                            _ => Some(AttributeDiff {
                                attribute: name.clone(),
                                from: have.cloned(),
                                to: Some(want.clone()),
                            }),
                        }
                    })
                    .collect();

                if attribute_diffs.is_empty() {
                    Change::noop(key)
                } else {
                    Change {
                        key,
                        kind: ChangeKind::Update,
                        attribute_diffs,
                    }
                }
            }
        };

        debug!(
            "diff {}: {} ({} attribute(s))",
            change.key,
            change.kind,
            change.attribute_diffs.len()
        );
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Attributes, ResourceKind};

    fn share() -> Resource {
        Resource::new(ResourceKind::Share, "Finance")
            .on("fs01")
            .with_attribute("path", r"D:\Fin")
            .with_attribute("full_access", AttributeValue::List(vec![String::from("FinanceUsers")]))
    }

    fn observed(resource: &Resource, attributes: Attributes) -> ObservedState {
        ObservedState::present(resource.key(), attributes)
    }

    #[test]
    fn test_create_when_missing() {
        let desired = share();
        let change = Differ::default().diff(&desired, &ObservedState::absent(desired.key()));

        assert_eq!(change.kind, ChangeKind::Create);
        let names: Vec<_> = change.attribute_diffs.iter().map(|d| d.attribute.as_str()).collect();
        assert_eq!(names, vec!["full_access", "path"]);
        assert!(change.attribute_diffs.iter().all(|d| d.from.is_none()));
    }

    #[test]
    fn test_noop_when_equal() {
        let desired = share();
        let change = Differ::default().diff(&desired, &observed(&desired, desired.attributes.clone()));
        assert!(change.is_noop());
        assert!(change.attribute_diffs.is_empty());
    }

    #[test]
    fn test_update_only_changed_attributes() {
        let desired = share();
        let mut live = desired.attributes.clone();
        live.insert(String::from("path"), AttributeValue::from(r"D:\Old"));
        live.insert(String::from("caching"), AttributeValue::from("manual"));

        let change = Differ::default().diff(&desired, &observed(&desired, live));

        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(
            change.attribute_diffs,
            vec![AttributeDiff {
                attribute: String::from("path"),
                from: Some(AttributeValue::from(r"D:\Old")),
                to: Some(AttributeValue::from(r"D:\Fin")),
            }]
        );
    }

    #[test]
    fn test_missing_live_attribute_is_update() {
        let desired = share();
        let change = Differ::default().diff(&desired, &observed(&desired, Attributes::new()));
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.attribute_diffs.len(), 2);
        assert!(change.attribute_diffs.iter().all(|d| d.from.is_none()));
    }

    #[test]
    fn test_delete_and_absent_noop() {
        let desired = share().absent();
        let live = desired.attributes.clone();

        let change = Differ::default().diff(&desired, &observed(&desired, live));
        assert_eq!(change.kind, ChangeKind::Delete);
        assert!(change.attribute_diffs.iter().all(|d| d.to.is_none()));

        let change = Differ::default().diff(&desired, &ObservedState::absent(desired.key()));
        assert!(change.is_noop());
    }

    #[test]
    fn test_delete_lists_only_managed_attributes() {
        let desired = share().absent();
        let mut live = desired.attributes.clone();
        live.insert(String::from("description"), AttributeValue::from("set by hand"));

        let change = Differ::default().diff(&desired, &observed(&desired, live));
        assert_eq!(change.kind, ChangeKind::Delete);
        let names: Vec<_> = change.attribute_diffs.iter().map(|d| d.attribute.as_str()).collect();
        assert_eq!(names, vec!["full_access", "path"]);
    }

    #[test]
    fn test_schema_rules_apply() {
        let desired = share();
        let mut live = desired.attributes.clone();
        live.insert(String::from("path"), AttributeValue::from(r"d:\fin"));

        assert_eq!(
            Differ::default().diff(&desired, &observed(&desired, live.clone())).kind,
            ChangeKind::Update
        );
        assert!(
            Differ::new(AttributeSchema::with_defaults())
                .diff(&desired, &observed(&desired, live))
                .is_noop()
        );
    }

    #[test]
    fn test_type_mismatch_is_update() {
        let desired = Resource::new(ResourceKind::RegistryValue, r"HKLM\Software\Corp\Level")
            .with_attribute("data", 1_i64);
        let mut live = Attributes::new();
        live.insert(String::from("data"), AttributeValue::from("1"));

        let change = Differ::new(AttributeSchema::with_defaults()).diff(&desired, &observed(&desired, live));
        assert_eq!(change.kind, ChangeKind::Update);
    }
}
