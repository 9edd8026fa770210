//! Error types for the winrecon reconciliation engine.
//!
//! The hierarchy separates fatal pre-execution failures (configuration and
//! validation) from per-change provider failures, which the executor records
//! instead of propagating.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::resource::{ResourceKey, ResourceKind};

/// The main error type for winrecon.
#[derive(Debug, Error)]
pub enum ReconError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Desired-state validation errors.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Report store errors.
    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// A field holds an invalid value.
    #[error("Invalid value for {field}: {message}")]
    InvalidField {
        /// Field path.
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// No provider is registered for a resource kind used by the document.
    #[error("No state provider registered for resource kind '{kind}'")]
    ProviderMissing {
        /// The unbound kind.
        kind: ResourceKind,
    },
}

/// Desired-state validation errors. All of them are fatal and surface before
/// any change is applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Two resources share the same kind, target and identity.
    #[error("Duplicate resource: {key}")]
    DuplicateResource {
        /// The duplicated key.
        key: ResourceKey,
    },

    /// A resource depends on something the document does not declare.
    #[error("{from} depends on undeclared resource {to}")]
    UnknownDependency {
        /// Declaring resource.
        from: ResourceKey,
        /// Missing dependency.
        to: ResourceKey,
    },

    /// The dependency graph contains a cycle; one offending edge is named.
    #[error("Cyclic dependency: {from} depends on {to}")]
    CyclicDependency {
        /// Dependent side of the edge.
        from: ResourceKey,
        /// Prerequisite side of the edge.
        to: ResourceKey,
    },

    /// A resource identity is empty or malformed.
    #[error("Invalid identity for {kind}: {message}")]
    InvalidIdentity {
        /// Resource kind.
        kind: ResourceKind,
        /// Description of the problem.
        message: String,
    },
}

/// Errors returned by a state provider's `fetch` or `apply`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The backing subsystem could not be reached.
    #[error("{subsystem} unavailable: {message}")]
    Unavailable {
        /// Subsystem name (directory service, registry, ...).
        subsystem: String,
        /// Underlying detail.
        message: String,
    },

    /// The caller lacks rights for the write.
    #[error("Permission denied on {key}: {message}")]
    PermissionDenied {
        /// Affected resource.
        key: ResourceKey,
        /// Underlying detail.
        message: String,
    },

    /// The resource changed since it was fetched.
    #[error("Conflict on {key}: attribute '{attribute}' was modified externally")]
    Conflict {
        /// Affected resource.
        key: ResourceKey,
        /// Attribute whose live value matches neither side of the diff.
        attribute: String,
    },

    /// A call exceeded its per-call timeout.
    #[error("{operation} timed out after {}ms", elapsed.as_millis())]
    Timeout {
        /// `fetch` or `apply`.
        operation: String,
        /// Configured timeout.
        elapsed: Duration,
    },
}

/// Report store and run lock errors.
#[derive(Debug, Error)]
pub enum ReportError {
    /// No report has been written yet.
    #[error("No reconciliation report found at {path}")]
    NotFound {
        /// Expected report path.
        path: PathBuf,
    },

    /// The stored report or lock file cannot be parsed.
    #[error("Report store is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing to the store failed.
    #[error("Failed to write report store: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// The run lock this process held was removed or replaced.
    #[error("Run lock {lock_id} is no longer held")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// Another process holds the run lock.
    #[error("Workspace is locked by another run (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },
}

/// Result type alias for winrecon operations.
pub type Result<T> = std::result::Result<T, ReconError>;

impl ReconError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for errors raised before anything was applied.
    #[must_use]
    pub const fn is_pre_execution(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Validation(_))
    }
}

impl ProviderError {
    /// Creates an unavailability error.
    #[must_use]
    pub fn unavailable(subsystem: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            subsystem: subsystem.into(),
            message: message.into(),
        }
    }

    /// Creates a permission error.
    #[must_use]
    pub fn permission_denied(key: &ResourceKey, message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            key: key.clone(),
            message: message.into(),
        }
    }

    /// Returns true if the failed call may be retried as-is.
    ///
    /// A conflict needs a fresh fetch and re-diff, so it is not retryable here.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

impl ReportError {
    /// Creates a corruption error.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a write error.
    #[must_use]
    pub fn write_failed(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let key = ResourceKey::new(ResourceKind::Share, "fs01", "Finance");

        assert!(ProviderError::unavailable("smb", "down").is_retryable());
        assert!(
            ProviderError::Timeout {
                operation: String::from("apply"),
                elapsed: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(!ProviderError::permission_denied(&key, "no").is_retryable());
        assert!(
            !ProviderError::Conflict {
                key,
                attribute: String::from("path"),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_pre_execution_errors() {
        let err: ReconError = ValidationError::DuplicateResource {
            key: ResourceKey::new(ResourceKind::AdUser, "corp", "jdoe"),
        }
        .into();
        assert!(err.is_pre_execution());
        assert!(!ReconError::internal("boom").is_pre_execution());
    }
}
