//! Attribute values and per-attribute comparison rules.
//!
//! Comparison is type-aware: an integer never equals a string, whatever the
//! rule. Case folding and list ordering are only applied where the schema
//! says so.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::kind::ResourceKind;

/// A single attribute value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer (DWORD/QWORD values, quotas, ...).
    Integer(i64),
    /// Free-form string.
    String(String),
    /// List of strings (group members, multi-string values).
    List(Vec<String>),
}

/// Case handling for string comparison.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaseRule {
    /// Exact comparison.
    #[default]
    Sensitive,
    /// ASCII/Unicode lowercase comparison.
    Insensitive,
}

/// Ordering handling for list comparison.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrderRule {
    /// Lists are equal only in the same order.
    #[default]
    Ordered,
    /// Lists are compared as multisets.
    Unordered,
}

/// Comparison rule for one attribute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AttributeRule {
    /// Case handling.
    #[serde(default)]
    pub case: CaseRule,
    /// List ordering handling.
    #[serde(default)]
    pub order: OrderRule,
}

/// Comparison rules keyed by kind and attribute name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AttributeSchema {
    rules: BTreeMap<ResourceKind, BTreeMap<String, AttributeRule>>,
}

impl AttributeValue {
    /// Returns the value normalized under `rule`.
    #[must_use]
    pub fn normalized(&self, rule: AttributeRule) -> Self {
        let fold = |s: &str| match rule.case {
            CaseRule::Sensitive => s.to_string(),
            CaseRule::Insensitive => s.to_lowercase(),
        };

        match self {
            Self::Bool(_) | Self::Integer(_) => self.clone(),
            Self::String(s) => Self::String(fold(s)),
            Self::List(items) => {
                let mut items: Vec<String> = items.iter().map(|s| fold(s)).collect();
                if rule.order == OrderRule::Unordered {
                    items.sort();
                }
                Self::List(items)
            }
        }
    }

    /// Returns true if both values are equal under `rule`.
    #[must_use]
    pub fn equivalent(&self, other: &Self, rule: AttributeRule) -> bool {
        self.normalized(rule) == other.normalized(rule)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl AttributeRule {
    /// Case-insensitive, ordered.
    #[must_use]
    pub const fn insensitive() -> Self {
        Self {
            case: CaseRule::Insensitive,
            order: OrderRule::Ordered,
        }
    }

    /// Case-insensitive, unordered.
    #[must_use]
    pub const fn insensitive_set() -> Self {
        Self {
            case: CaseRule::Insensitive,
            order: OrderRule::Unordered,
        }
    }
}

impl AttributeSchema {
    /// Creates an empty schema: every attribute compares exactly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a schema with the built-in rules for Windows attributes that
    /// the platform itself treats case-insensitively.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut schema = Self::new();
        schema.set(ResourceKind::Share, "path", AttributeRule::insensitive());
        schema.set(ResourceKind::Share, "full_access", AttributeRule::insensitive_set());
        schema.set(ResourceKind::Share, "read_access", AttributeRule::insensitive_set());
        schema.set(ResourceKind::RegistryValue, "path", AttributeRule::insensitive());
        schema.set(ResourceKind::AdUser, "sam_account_name", AttributeRule::insensitive());
        schema.set(ResourceKind::AdUser, "member_of", AttributeRule::insensitive_set());
        schema.set(ResourceKind::AdGroup, "members", AttributeRule::insensitive_set());
        schema.set(ResourceKind::GpoLink, "target_ou", AttributeRule::insensitive());
        schema.set(ResourceKind::Service, "start_type", AttributeRule::insensitive());
        schema
    }

    /// Sets the rule for one attribute.
    pub fn set(&mut self, kind: ResourceKind, attribute: impl Into<String>, rule: AttributeRule) {
        self.rules.entry(kind).or_default().insert(attribute.into(), rule);
    }

    /// Applies every rule of `overrides` on top of this schema.
    pub fn merge(&mut self, overrides: &Self) {
        for (kind, attrs) in &overrides.rules {
            for (name, rule) in attrs {
                self.set(*kind, name.clone(), *rule);
            }
        }
    }

    /// Returns the rule for an attribute, defaulting to exact comparison.
    #[must_use]
    pub fn rule(&self, kind: ResourceKind, attribute: &str) -> AttributeRule {
        self.rules
            .get(&kind)
            .and_then(|attrs| attrs.get(attribute))
            .copied()
            .unwrap_or_default()
    }
}
