//! Configuration module for winrecon.
//!
//! This module handles all document-related functionality:
//! - Parsing and deserializing `winrecon.yaml`
//! - Validation of identities, settings and the dependency graph
//! - Computing document hashes recorded in plans and reports

mod document;
mod hash;
mod parser;
mod validator;

pub use document::{Document, Settings};
pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, ENV_STATE_DIR, ENV_SYSTEM_ROOT, find_config_file};
pub use validator::{ConfigValidator, FieldError, ValidationReport, check_identity};
