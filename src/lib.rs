// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are reported
#![warn(unused_variables)]            // Unused variables are reported
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # winrecon
//!
//! A declarative, idempotent reconciliation engine for Windows fleet
//! resources: Active Directory objects, Group Policy links, file shares,
//! registry values and services.
//!
//! ## Overview
//!
//! You describe the desired state of a fleet in a YAML document. Each run
//! observes the live state of every declared resource, computes the minimal
//! set of changes, orders them by dependency and applies them with bounded
//! concurrency, retries and failure isolation. Running the same document
//! twice in a row performs no changes the second time.
//!
//! ## Architecture
//!
//! 1. **Desired State**: declared in `winrecon.yaml`
//! 2. **Observed State**: fetched fresh from a [`provider::StateProvider`]
//! 3. **Plan**: per-resource diffs grouped into dependency batches
//! 4. **Execution**: batches applied in order, changes within a batch concurrently
//! 5. **Report**: one result per resource, persisted as JSON
//!
//! ## Modules
//!
//! - [`resource`]: Resource kinds, keys and attribute values
//! - [`config`]: Document parsing, validation and hashing
//! - [`provider`]: State provider trait, retry policies and reference providers
//! - [`planner`]: Diffing, plan building and execution
//! - [`report`]: Run reports, report store and run lock
//! - [`reconciler`]: One end-to-end reconciliation pass
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! settings:
//!   name: branch-office
//!
//! resources:
//!   - kind: organizational_unit
//!     identity: Finance
//!     target: corp.local
//!   - kind: ad_group
//!     identity: Finance-RW
//!     target: corp.local
//!     depends_on: [organizational_unit/Finance]
//!   - kind: share
//!     identity: Finance
//!     target: fs01
//!     attributes:
//!       path: 'D:\Finance'
//!       full_access: [CORP\Finance-RW]
//!     depends_on: [ad_group/Finance-RW@corp.local]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod report;
pub mod resource;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, Document};
pub use error::{ReconError, Result};
pub use planner::{Change, ChangeKind, Differ, Executor, Plan, PlanBuilder};
pub use provider::{FileProvider, MemoryProvider, ProviderRegistry, StateProvider};
pub use reconciler::{DriftReport, Reconciler};
pub use report::{ReconciliationReport, ReportStore};
pub use resource::{Resource, ResourceKey, ResourceKind};
