//! Document validation.
//!
//! Checks identities, settings and policy overrides, then the dependency
//! graph. Field problems are collected so that all of them can be reported
//! at once.

use crate::error::{ConfigError, ReconError, Result, ValidationError};
use crate::planner::PlanBuilder;
use crate::resource::{Ensure, Resource, ResourceKind};
use tracing::debug;

use super::document::Document;

/// Characters Windows rejects in account and group names.
const ACCOUNT_FORBIDDEN: &[char] = &['"', '/', '\\', '[', ']', ':', ';', '|', '=', ',', '+', '*', '?', '<', '>'];

/// Characters rejected in share names.
const SHARE_FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Maximum `sAMAccountName` length.
const MAX_ACCOUNT_LEN: usize = 20;

/// Maximum share name length.
const MAX_SHARE_LEN: usize = 80;

/// Maximum service name length.
const MAX_SERVICE_LEN: usize = 256;

/// Registry hive prefixes accepted for registry value identities.
const REGISTRY_HIVES: &[&str] = &[
    "HKLM\\",
    "HKCU\\",
    "HKCR\\",
    "HKU\\",
    "HKCC\\",
    "HKEY_LOCAL_MACHINE\\",
    "HKEY_CURRENT_USER\\",
    "HKEY_CLASSES_ROOT\\",
    "HKEY_USERS\\",
    "HKEY_CURRENT_CONFIG\\",
];

/// Validator for desired-state documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Problems found in a document.
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Field and identity errors.
    pub errors: Vec<FieldError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single field or identity error.
#[derive(Debug)]
pub struct FieldError {
    /// Field path, e.g. `resources[2].identity`.
    pub field: String,
    /// Resource kind, for identity errors.
    pub kind: Option<ResourceKind>,
    /// Error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a document.
    ///
    /// # Errors
    ///
    /// Returns the first identity or field error, or the first dependency
    /// graph error.
    pub fn validate(&self, document: &Document) -> Result<ValidationReport> {
        let report = self.check(document);

        if let Some(first) = report.errors.first() {
            return Err(match first.kind {
                Some(kind) => ReconError::Validation(ValidationError::InvalidIdentity {
                    kind,
                    message: first.message.clone(),
                }),
                None => ReconError::Config(ConfigError::InvalidField {
                    field: first.field.clone(),
                    message: first.message.clone(),
                }),
            });
        }

        PlanBuilder::validate(&document.resources)?;

        debug!("Document validation passed");
        Ok(report)
    }

    /// Collects every field problem without checking the graph.
    #[must_use]
    pub fn check(&self, document: &Document) -> ValidationReport {
        let mut report = ValidationReport::default();

        Self::validate_settings(document, &mut report);
        Self::validate_providers(document, &mut report);
        for (index, resource) in document.resources.iter().enumerate() {
            Self::validate_resource(index, resource, &mut report);
        }
        Self::validate_absent_dependencies(document, &mut report);

        report
    }

    fn validate_settings(document: &Document, report: &mut ValidationReport) {
        if document.settings.name.trim().is_empty() {
            report.errors.push(FieldError {
                field: String::from("settings.name"),
                kind: None,
                message: String::from("Name cannot be empty"),
            });
        }
        if document.settings.state_dir.as_os_str().is_empty() {
            report.errors.push(FieldError {
                field: String::from("settings.state_dir"),
                kind: None,
                message: String::from("State directory cannot be empty"),
            });
        }
    }

    fn validate_providers(document: &Document, report: &mut ValidationReport) {
        for (kind, over) in &document.providers {
            if over.max_attempts == Some(0) {
                report.errors.push(FieldError {
                    field: format!("providers.{kind}.max_attempts"),
                    kind: None,
                    message: String::from("At least one attempt is required"),
                });
            }
            if over.concurrency == Some(0) {
                report.errors.push(FieldError {
                    field: format!("providers.{kind}.concurrency"),
                    kind: None,
                    message: String::from("Concurrency must be at least 1"),
                });
            }
            if over.timeout_secs == Some(0) {
                report.errors.push(FieldError {
                    field: format!("providers.{kind}.timeout_secs"),
                    kind: None,
                    message: String::from("Timeout must be at least 1 second"),
                });
            }
            if let (Some(initial), Some(max)) = (over.initial_backoff_ms, over.max_backoff_ms)
                && initial > max
            {
                report.warnings.push(format!(
                    "providers.{kind}: initial_backoff_ms ({initial}) exceeds max_backoff_ms ({max})"
                ));
            }
            if !document.resources.iter().any(|r| r.kind == *kind) {
                report
                    .warnings
                    .push(format!("providers.{kind}: no resource of this kind is declared"));
            }
        }
    }

    fn validate_resource(index: usize, resource: &Resource, report: &mut ValidationReport) {
        let field = format!("resources[{index}]");

        if resource.target.trim().is_empty() {
            report.errors.push(FieldError {
                field: format!("{field}.target"),
                kind: None,
                message: String::from("Target cannot be empty"),
            });
        }

        if let Err(message) = check_identity(resource.kind, &resource.identity) {
            report.errors.push(FieldError {
                field: format!("{field}.identity"),
                kind: Some(resource.kind),
                message,
            });
        }

        if let Some(name) = resource.attributes.keys().find(|k| k.trim().is_empty()) {
            report.errors.push(FieldError {
                field: format!("{field}.attributes"),
                kind: None,
                message: format!("Invalid attribute name '{name}'"),
            });
        }

        if resource.ensure == Ensure::Absent && !resource.attributes.is_empty() {
            report.warnings.push(format!(
                "{field} ({}): attributes are ignored for an absent resource",
                resource.key()
            ));
        }
    }

    /// A present resource depending on an absent one can never converge.
    fn validate_absent_dependencies(document: &Document, report: &mut ValidationReport) {
        let absent: Vec<_> = document
            .resources
            .iter()
            .filter(|r| r.ensure == Ensure::Absent)
            .map(Resource::key)
            .collect();

        for resource in document.resources.iter().filter(|r| r.ensure == Ensure::Present) {
            for dep in resource.dependency_keys() {
                if absent.contains(&dep) {
                    report
                        .warnings
                        .push(format!("{} depends on {dep}, which is declared absent", resource.key()));
                }
            }
        }
    }
}

/// Checks an identity against the naming rules of its kind.
///
/// # Errors
///
/// Returns a description of the first violated rule.
pub fn check_identity(kind: ResourceKind, identity: &str) -> std::result::Result<(), String> {
    if identity.is_empty() {
        return Err(String::from("Identity cannot be empty"));
    }
    if identity.trim() != identity {
        return Err(format!("Identity '{identity}' has leading or trailing whitespace"));
    }
    if identity.chars().any(char::is_control) {
        return Err(format!("Identity '{}' contains control characters", identity.escape_debug()));
    }
    if identity.contains('@') {
        return Err(format!(
            "Identity '{identity}' contains '@', which separates the target in dependency references"
        ));
    }

    match kind {
        ResourceKind::AdUser | ResourceKind::AdGroup => {
            if let Some(c) = identity.chars().find(|c| ACCOUNT_FORBIDDEN.contains(c)) {
                return Err(format!("Account name '{identity}' contains forbidden character '{c}'"));
            }
            if kind == ResourceKind::AdUser && identity.chars().count() > MAX_ACCOUNT_LEN {
                return Err(format!(
                    "Account name '{identity}' exceeds {MAX_ACCOUNT_LEN} characters"
                ));
            }
        }
        ResourceKind::Share => {
            if let Some(c) = identity.chars().find(|c| SHARE_FORBIDDEN.contains(c)) {
                return Err(format!("Share name '{identity}' contains forbidden character '{c}'"));
            }
            if identity.chars().count() > MAX_SHARE_LEN {
                return Err(format!("Share name '{identity}' exceeds {MAX_SHARE_LEN} characters"));
            }
        }
        ResourceKind::RegistryValue => {
            let upper = identity.to_ascii_uppercase();
            if !REGISTRY_HIVES.iter().any(|hive| upper.starts_with(hive)) {
                return Err(format!(
                    "Registry path '{identity}' must start with a hive (HKLM\\, HKCU\\, ...)"
                ));
            }
            if identity.ends_with('\\') {
                return Err(format!("Registry path '{identity}' must name a value"));
            }
        }
        ResourceKind::Service => {
            if identity.contains(['/', '\\']) {
                return Err(format!("Service name '{identity}' cannot contain slashes"));
            }
            if identity.chars().count() > MAX_SERVICE_LEN {
                return Err(format!("Service name '{identity}' exceeds {MAX_SERVICE_LEN} characters"));
            }
        }
        ResourceKind::OrganizationalUnit | ResourceKind::GpoLink => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::PolicyOverride;

    fn document(resources: Vec<Resource>) -> Document {
        Document {
            resources,
            ..Document::default()
        }
    }

    #[test]
    fn test_valid_document() {
        let doc = document(vec![
            Resource::new(ResourceKind::OrganizationalUnit, "OU=Finance,DC=corp,DC=local").on("corp.local"),
            Resource::new(ResourceKind::AdUser, "jdoe")
                .on("corp.local")
                .depends_on(ResourceKind::OrganizationalUnit, "OU=Finance,DC=corp,DC=local"),
            Resource::new(ResourceKind::Share, "Finance").with_attribute("path", r"D:\Fin"),
            Resource::new(ResourceKind::RegistryValue, r"HKLM\Software\Corp\Level").with_attribute("data", 3_i64),
        ]);
        let report = ConfigValidator::new().validate(&doc).unwrap();
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_identity_rules() {
        assert!(check_identity(ResourceKind::AdUser, "").is_err());
        assert!(check_identity(ResourceKind::AdUser, " jdoe").is_err());
        assert!(check_identity(ResourceKind::AdUser, "j/doe").is_err());
        assert!(check_identity(ResourceKind::AdUser, "averyveryverylongaccountname").is_err());
        assert!(check_identity(ResourceKind::AdGroup, "averyveryverylongaccountname").is_ok());
        assert!(check_identity(ResourceKind::Share, "Fin:ance").is_err());
        assert!(check_identity(ResourceKind::RegistryValue, r"Software\Corp").is_err());
        assert!(check_identity(ResourceKind::RegistryValue, r"hklm\Software\Corp\Level").is_ok());
        assert!(check_identity(ResourceKind::RegistryValue, r"HKLM\Software\Corp\").is_err());
        assert!(check_identity(ResourceKind::Service, r"svc\bad").is_err());
        assert!(check_identity(ResourceKind::GpoLink, "Default Domain Policy").is_ok());
    }

    #[test]
    fn test_principal_names_are_rejected_as_identities() {
        let err = check_identity(ResourceKind::AdUser, "jdoe@corp.local").unwrap_err();
        assert!(err.contains("'@'"));
        for kind in ResourceKind::ALL {
            assert!(check_identity(kind, "a@b").is_err(), "{kind} accepted '@'");
        }

        let doc = document(vec![Resource::new(ResourceKind::AdUser, "jdoe@corp.local")]);
        let err = ConfigValidator::new().validate(&doc).unwrap_err();
        assert!(matches!(
            err,
            ReconError::Validation(ValidationError::InvalidIdentity {
                kind: ResourceKind::AdUser,
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_identity_is_validation_error() {
        let doc = document(vec![Resource::new(ResourceKind::Share, "bad/share")]);
        let err = ConfigValidator::new().validate(&doc).unwrap_err();
        assert!(matches!(
            err,
            ReconError::Validation(ValidationError::InvalidIdentity {
                kind: ResourceKind::Share,
                ..
            })
        ));
    }

    #[test]
    fn test_graph_errors_surface() {
        let doc = document(vec![
            Resource::new(ResourceKind::Service, "Spooler"),
            Resource::new(ResourceKind::Service, "Spooler"),
        ]);
        let err = ConfigValidator::new().validate(&doc).unwrap_err();
        assert!(matches!(
            err,
            ReconError::Validation(ValidationError::DuplicateResource { .. })
        ));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut doc = document(vec![
            Resource::new(ResourceKind::Share, "").on(""),
            Resource::new(ResourceKind::AdUser, "a*b"),
        ]);
        doc.providers.insert(
            ResourceKind::AdUser,
            PolicyOverride {
                max_attempts: Some(0),
                ..PolicyOverride::default()
            },
        );

        let report = ConfigValidator::new().check(&doc);
        assert_eq!(report.errors.len(), 4);
        assert!(report.errors.iter().any(|e| e.field == "providers.ad_user.max_attempts"));
        assert!(report.errors.iter().any(|e| e.field == "resources[0].target"));
    }

    #[test]
    fn test_warnings() {
        let doc = document(vec![
            Resource::new(ResourceKind::Share, "Old").absent().with_attribute("path", r"D:\Old"),
            Resource::new(ResourceKind::RegistryValue, r"HKLM\Software\Corp\Share")
                .depends_on(ResourceKind::Share, "Old"),
        ]);
        let report = ConfigValidator::new().validate(&doc).unwrap();
        assert_eq!(report.warnings.len(), 2);
    }
}
