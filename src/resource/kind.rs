//! Resource kinds, keys and dependency references.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default target when a resource does not name one.
pub const DEFAULT_TARGET: &str = "localhost";

/// The closed set of manageable resource kinds.
///
/// Declaration order is the plan ordering for unrelated resources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Active Directory organizational unit.
    OrganizationalUnit,
    /// Active Directory group.
    AdGroup,
    /// Active Directory user.
    AdUser,
    /// Group Policy object link.
    GpoLink,
    /// SMB file share.
    Share,
    /// Registry value.
    RegistryValue,
    /// Windows service.
    Service,
}

/// Identifies one managed entity: kind + target + identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Machine or domain the resource lives on.
    pub target: String,
    /// Identity, unique within kind + target.
    pub identity: String,
}

/// A dependency reference as written in a document: `kind/identity` or
/// `kind/identity@target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceRef {
    /// Referenced kind.
    pub kind: ResourceKind,
    /// Referenced identity.
    pub identity: String,
    /// Explicit target; `None` means the declaring resource's target.
    pub target: Option<String>,
}

impl ResourceKind {
    /// All kinds, in plan order.
    pub const ALL: [Self; 7] = [
        Self::OrganizationalUnit,
        Self::AdGroup,
        Self::AdUser,
        Self::GpoLink,
        Self::Share,
        Self::RegistryValue,
        Self::Service,
    ];

    /// Returns the snake_case name used in documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OrganizationalUnit => "organizational_unit",
            Self::AdGroup => "ad_group",
            Self::AdUser => "ad_user",
            Self::GpoLink => "gpo_link",
            Self::Share => "share",
            Self::RegistryValue => "registry_value",
            Self::Service => "service",
        }
    }

    /// Returns true for kinds whose backing system is reached over the network.
    #[must_use]
    pub const fn is_directory_backed(self) -> bool {
        matches!(
            self,
            Self::OrganizationalUnit | Self::AdGroup | Self::AdUser | Self::GpoLink
        )
    }

    /// Name of the backing subsystem, used in error messages.
    #[must_use]
    pub const fn subsystem(self) -> &'static str {
        match self {
            Self::OrganizationalUnit | Self::AdGroup | Self::AdUser => "directory service",
            Self::GpoLink => "group policy",
            Self::Share => "share manager",
            Self::RegistryValue => "registry",
            Self::Service => "service control manager",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown resource kind: {s}"))
    }
}

impl ResourceKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(kind: ResourceKind, target: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            identity: identity.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.kind, self.identity, self.target)
    }
}

impl ResourceRef {
    /// Parses a reference from `kind/identity[@target]`.
    ///
    /// The identity may itself contain `/` (distinguished names, registry
    /// paths), so only the first `/` separates the kind. Identities never
    /// contain `@`, so the first `@` separates the target.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is unknown, or the identity or an explicit
    /// target is empty.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (kind, rest) = s
            .split_once('/')
            .ok_or_else(|| format!("Invalid reference: {s}. Expected format: KIND/IDENTITY[@TARGET]"))?;
        let kind: ResourceKind = kind.parse()?;

        let (identity, target) = match rest.split_once('@') {
            Some((_, "")) => return Err(format!("Invalid reference: {s}. Target cannot be empty")),
            Some((identity, target)) => (identity, Some(target.to_string())),
            None => (rest, None),
        };

        if identity.is_empty() {
            return Err(format!("Invalid reference: {s}. Identity cannot be empty"));
        }

        Ok(Self {
            kind,
            identity: identity.to_string(),
            target,
        })
    }

    /// Resolves the reference against the declaring resource's target.
    #[must_use]
    pub fn resolve(&self, default_target: &str) -> ResourceKey {
        ResourceKey::new(
            self.kind,
            self.target.as_deref().unwrap_or(default_target),
            self.identity.clone(),
        )
    }
}

impl TryFrom<String> for ResourceRef {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ResourceRef> for String {
    fn from(r: ResourceRef) -> Self {
        match r.target {
            Some(target) => format!("{}/{}@{target}", r.kind, r.identity),
            None => format!("{}/{}", r.kind, r.identity),
        }
    }
}
