//! winrecon CLI entrypoint.
//!
//! This is the main entrypoint for the winrecon command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use winrecon::cli::{Cli, Commands, OutputFormatter};
use winrecon::config::{ConfigParser, ConfigValidator, Document, find_config_file};
use winrecon::error::{ReconError, ReportError, Result};
use winrecon::planner::CancelToken;
use winrecon::provider::{FileProvider, StateProvider};
use winrecon::reconciler::{Reconciler, registry_for};
use winrecon::report::{EXIT_CHANGES_PENDING, EXIT_FAILURE, EXIT_SUCCESS, LOCK_REFRESH_SECS, ReportStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", formatter.error(&format!("Error: {e}")));
            if e.is_pre_execution() {
                eprintln!("{}", formatter.notice("No changes were applied."));
            }
            ExitCode::from(exit_byte(EXIT_FAILURE))
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<u8> {
    let config = cli.config.as_ref();
    let code = match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, formatter)?,
        Commands::Plan { detailed } => cmd_plan(config, detailed, formatter).await?,
        Commands::Apply { yes } => cmd_apply(config, yes, formatter).await?,
        Commands::Report => cmd_report(config, formatter).await?,
        Commands::Drift => cmd_drift(config, formatter).await?,
    };
    Ok(exit_byte(code))
}

/// Validate the document.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<i32> {
    let document = load_document(config_path)?;
    let validator = ConfigValidator::new();

    let collected = validator.check(&document);
    if !collected.errors.is_empty() {
        for error in &collected.errors {
            eprintln!("{}", formatter.error(&format!("{}: {}", error.field, error.message)));
        }
        eprintln!("\n{} error(s) found.", collected.errors.len());
        return Ok(EXIT_FAILURE);
    }

    let report = validator.validate(&document)?;
    emit(&formatter.format_validation(&document, &report, show_warnings));
    Ok(EXIT_SUCCESS)
}

/// Show the reconciliation plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<i32> {
    let reconciler = build_reconciler(load_document(config_path)?);
    let plan = reconciler.plan().await?;

    emit(&formatter.format_plan(&plan, &reconciler.document_hash(), detailed));

    if plan.is_converged() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_CHANGES_PENDING)
    }
}

/// Apply the reconciliation plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<i32> {
    let document = load_document(config_path)?;
    let store = ReportStore::new(&document.settings.state_dir);
    let lock = store.acquire_lock("").await?;
    let heartbeat = store.keep_alive(lock, Duration::from_secs(LOCK_REFRESH_SECS));

    let outcome = apply_locked(document, auto_approve, formatter, &store).await;

    match heartbeat.stop().await {
        Ok(lock) => {
            if let Err(e) = store.release_lock(lock).await {
                warn!("Failed to release run lock: {e}");
            }
        }
        Err(e) => warn!("Run lock left in place: {e}"),
    }
    outcome
}

async fn apply_locked(
    document: Document,
    auto_approve: bool,
    formatter: &OutputFormatter,
    store: &ReportStore,
) -> Result<i32> {
    let token = CancelToken::new();
    let reconciler = build_reconciler(document).with_cancel_token(token.clone());

    let started_at = chrono::Utc::now();
    let plan = reconciler.plan().await?;
    let hash = reconciler.document_hash();

    if plan.has_changes() {
        eprintln!("{}", formatter.format_plan(&plan, &hash, false));

        if !auto_approve {
            eprint!("\nDo you want to apply these changes? [y/N] ");
            std::io::stderr().flush()?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                eprintln!("Apply cancelled.");
                return Ok(EXIT_SUCCESS);
            }
        }
    } else {
        info!("No changes to apply");
    }

    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight changes");
            token.cancel();
        }
    });

    let result = reconciler.apply_plan(&plan, started_at).await;
    watcher.abort();
    let report = result?;

    store.save(&report).await?;
    emit(&formatter.format_report(&report));

    Ok(report.exit_code())
}

/// Show the last reconciliation report.
async fn cmd_report(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<i32> {
    let document = load_document(config_path)?;
    let store = ReportStore::new(&document.settings.state_dir);

    match store.load().await {
        Ok(report) => {
            emit(&formatter.format_report(&report));
            Ok(EXIT_SUCCESS)
        }
        Err(ReconError::Report(ReportError::NotFound { path })) => {
            eprintln!(
                "{}",
                formatter.notice(&format!("No report found at {}. Run 'winrecon apply' first.", path.display()))
            );
            Ok(EXIT_FAILURE)
        }
        Err(e) => Err(e),
    }
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<i32> {
    let reconciler = build_reconciler(load_document(config_path)?);
    let report = reconciler.drift().await?;

    emit(&formatter.format_drift(&report));

    if report.is_converged() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_CHANGES_PENDING)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the document path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads the document with `.env` and environment overrides applied.
fn load_document(config_path: Option<&PathBuf>) -> Result<Document> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading document from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(
        config_file
            .parent()
            .unwrap_or_else(|| Path::new(".")),
    );
    parser.load_dotenv()?;
    parser.load_with_env(&config_file)
}

/// Builds a reconciler backed by the file provider under `system_root`.
fn build_reconciler(document: Document) -> Reconciler {
    let provider: Arc<dyn StateProvider> = Arc::new(FileProvider::new(&document.settings.system_root));
    let registry = registry_for(&document, &provider);
    Reconciler::new(document, registry)
}

/// Writes command output to stdout.
fn emit(output: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
