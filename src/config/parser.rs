//! Document parser.
//!
//! This module loads desired-state documents from YAML files and applies
//! environment overrides, with `.env` support.

use crate::error::{ConfigError, ReconError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::document::Document;

/// Overrides `settings.state_dir`.
pub const ENV_STATE_DIR: &str = "WINRECON_STATE_DIR";

/// Overrides `settings.system_root`.
pub const ENV_SYSTEM_ROOT: &str = "WINRECON_SYSTEM_ROOT";

/// Parser for desired-state documents.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for `.env` lookup.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory searched for `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a document from a YAML file. Relative settings paths are
    /// resolved against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Document> {
        let path = path.as_ref();
        info!("Loading desired state from: {}", path.display());

        if !path.exists() {
            return Err(ReconError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ReconError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let mut document = self.parse_yaml(&content, Some(path))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        document.settings.resolve_paths(base);
        Ok(document)
    }

    /// Parses a document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Document> {
        debug!("Parsing YAML document");

        let document: Document = serde_yaml::from_str(content).map_err(|e| {
            let location = e
                .location()
                .map(|l| format!("line {}, column {}", l.line(), l.column()))
                .or_else(|| source.map(|p| p.display().to_string()));
            ReconError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed document '{}' with {} resource(s)",
            document.settings.name,
            document.resources.len()
        );
        Ok(document)
    }

    /// Loads a document and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Document> {
        let mut document = self.load_file(path)?;
        Self::apply_env_overrides(&mut document);
        Ok(document)
    }

    /// Applies environment variable overrides to the document settings.
    fn apply_env_overrides(document: &mut Document) {
        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            debug!("Overriding settings.state_dir from environment");
            document.settings.state_dir = PathBuf::from(dir);
        }

        if let Ok(root) = std::env::var(ENV_SYSTEM_ROOT) {
            debug!("Overriding settings.system_root from environment");
            document.settings.system_root = PathBuf::from(root);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ReconError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default document file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["winrecon.yaml", "winrecon.yml"];

/// Finds the document in `start_dir` or its parents.
///
/// # Errors
///
/// Returns an error if no document is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found desired-state document: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ReconError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_document() {
        let yaml = r"
resources:
  - kind: organizational_unit
    identity: Finance
    target: corp.local
";
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(document.resources.len(), 1);
        assert_eq!(document.resources[0].kind, ResourceKind::OrganizationalUnit);
        assert_eq!(document.settings.name, "fleet");
    }

    #[test]
    fn test_parse_error_reports_location() {
        let yaml = "resources:\n  - kind: printer\n    identity: lab\n";
        let err = ConfigParser::new().parse_yaml(yaml, None).unwrap_err();
        let ReconError::Config(ConfigError::ParseError { location, .. }) = err else {
            panic!("expected parse error, got {err:?}");
        };
        assert!(location.is_some());
    }

    #[test]
    fn test_load_file_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("winrecon.yaml");
        std::fs::write(&path, "settings:\n  state_dir: state\n").unwrap();

        let document = ConfigParser::new().load_file(&path).unwrap();
        assert_eq!(document.settings.state_dir, dir.path().join("state"));
        assert_eq!(document.settings.system_root, dir.path().join(".winrecon/live"));
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigParser::new().load_file("/nonexistent/winrecon.yaml").unwrap_err();
        assert!(matches!(err, ReconError::Config(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_find_config_file_walks_parents() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("winrecon.yml"), "{}").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("winrecon.yml"));
    }
}
