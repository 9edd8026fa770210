//! Desired-state document types.
//!
//! This module defines the structs that map to `winrecon.yaml`. A document
//! holds run settings, per-kind provider policy overrides, attribute
//! comparison rules and the resources themselves.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::provider::{PolicyOverride, ProviderPolicy};
use crate::resource::{AttributeSchema, Resource, ResourceKind};

/// Default state directory, relative to the document.
const DEFAULT_STATE_DIR: &str = ".winrecon";

/// Default live-state root for the file provider, relative to the document.
const DEFAULT_SYSTEM_ROOT: &str = ".winrecon/live";

/// The root structure of a desired-state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Document {
    /// Run settings.
    #[serde(default)]
    pub settings: Settings,
    /// Provider policy overrides, by kind.
    #[serde(default)]
    pub providers: BTreeMap<ResourceKind, PolicyOverride>,
    /// Attribute comparison rule overrides.
    #[serde(default)]
    pub schema: AttributeSchema,
    /// Desired resources.
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Run settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Name of the managed fleet, shown in output.
    #[serde(default = "default_name")]
    pub name: String,
    /// Directory holding the last report and the run lock.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Root directory of the file-backed live state.
    #[serde(default = "default_system_root")]
    pub system_root: PathBuf,
    /// Start from the built-in Windows comparison rules.
    #[serde(default = "default_true")]
    pub default_schema: bool,
}

fn default_name() -> String {
    String::from("fleet")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_system_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSTEM_ROOT)
}

const fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: default_name(),
            state_dir: default_state_dir(),
            system_root: default_system_root(),
            default_schema: true,
        }
    }
}

impl Settings {
    /// Makes relative paths relative to `base` instead of the working
    /// directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.state_dir.is_relative() {
            self.state_dir = base.join(&self.state_dir);
        }
        if self.system_root.is_relative() {
            self.system_root = base.join(&self.system_root);
        }
    }
}

impl Document {
    /// Effective policy for `kind`: the kind's default with any override.
    #[must_use]
    pub fn policy_for(&self, kind: ResourceKind) -> ProviderPolicy {
        let policy = ProviderPolicy::for_kind(kind);
        match self.providers.get(&kind) {
            Some(over) => policy.with_override(over),
            None => policy,
        }
    }

    /// Effective comparison schema.
    #[must_use]
    pub fn effective_schema(&self) -> AttributeSchema {
        let mut schema = if self.settings.default_schema {
            AttributeSchema::with_defaults()
        } else {
            AttributeSchema::new()
        };
        schema.merge(&self.schema);
        schema
    }

    /// Kinds used by the resources.
    #[must_use]
    pub fn kinds(&self) -> BTreeSet<ResourceKind> {
        self.resources.iter().map(|r| r.kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{AttributeRule, AttributeValue, Ensure};
    use std::time::Duration;

    #[test]
    fn test_empty_document_defaults() {
        let doc: Document = serde_yaml::from_str("{}").unwrap();
        assert_eq!(doc.settings, Settings::default());
        assert!(doc.resources.is_empty());
        assert!(doc.kinds().is_empty());
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
settings:
  name: branch-office
  state_dir: /var/lib/winrecon
providers:
  ad_user:
    max_attempts: 6
    timeout_secs: 10
schema:
  share:
    path:
      case: sensitive
resources:
  - kind: share
    identity: Finance
    target: fs01
    attributes:
      path: 'D:\Fin'
  - kind: service
    identity: Spooler
    ensure: absent
"#;
        let doc: Document = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.settings.name, "branch-office");
        assert_eq!(doc.settings.state_dir, PathBuf::from("/var/lib/winrecon"));
        assert_eq!(doc.resources.len(), 2);
        assert_eq!(doc.resources[1].ensure, Ensure::Absent);
        assert_eq!(
            doc.resources[0].attributes["path"],
            AttributeValue::from(r"D:\Fin")
        );

        let policy = doc.policy_for(ResourceKind::AdUser);
        assert_eq!(policy.max_attempts, 6);
        assert_eq!(policy.call_timeout, Duration::from_secs(10));
        assert_eq!(doc.policy_for(ResourceKind::Share), ProviderPolicy::local());

        let schema = doc.effective_schema();
        assert_eq!(schema.rule(ResourceKind::Share, "path"), AttributeRule::default());
        assert_eq!(
            schema.rule(ResourceKind::AdGroup, "members"),
            AttributeRule::insensitive_set()
        );
    }

    #[test]
    fn test_resolve_paths_keeps_absolute() {
        let mut settings = Settings {
            state_dir: PathBuf::from("/abs/state"),
            ..Settings::default()
        };
        settings.resolve_paths(Path::new("/docs"));
        assert_eq!(settings.state_dir, PathBuf::from("/abs/state"));
        assert_eq!(settings.system_root, PathBuf::from("/docs/.winrecon/live"));
    }
}
