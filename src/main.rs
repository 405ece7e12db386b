use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use fraud_etl::logging::init_logging;
use fraud_etl::manifest::write_reject_report;
use fraud_etl::{
    get_manifest, get_rejects, list_manifests, LoadMode, Pipeline, PipelineConfig, RunManifest,
    SqliteStore, WindowSpec,
};

/// Exit status for usage and configuration problems.
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "fraud-etl")]
#[command(about = "Batch ETL for fraud-detection transaction data")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once
    Run {
        /// Pipeline configuration (TOML)
        #[arg(long, short)]
        config: PathBuf,
        /// Override target.mode (replace or append)
        #[arg(long)]
        mode: Option<String>,
        /// Override target.table
        #[arg(long)]
        table: Option<String>,
        /// Override window.duration, e.g. 24h or 30m
        #[arg(long)]
        window: Option<String>,
        /// Override target.database
        #[arg(long)]
        database: Option<PathBuf>,
        /// Write the run's rejects to this CSV file
        #[arg(long)]
        reject_report: Option<PathBuf>,
    },
    /// List recent runs
    History {
        #[arg(long, default_value = "analytics.db")]
        database: PathBuf,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print one run manifest as JSON
    Show {
        run_id: String,
        #[arg(long, default_value = "analytics.db")]
        database: PathBuf,
    },
    /// List the rows quarantined by a run
    Rejects {
        run_id: String,
        #[arg(long, default_value = "analytics.db")]
        database: PathBuf,
        /// Export as CSV instead of printing
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let result = match cli.command {
        Commands::Run {
            config,
            mode,
            table,
            window,
            database,
            reject_report,
        } => run_pipeline(&config, mode, table, window, database, reject_report),
        Commands::History { database, limit } => show_history(&database, limit).map(|_| ExitCode::SUCCESS),
        Commands::Show { run_id, database } => show_run(&database, &run_id),
        Commands::Rejects {
            run_id,
            database,
            output,
        } => show_rejects(&database, &run_id, output.as_deref()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn run_pipeline(
    config_path: &Path,
    mode: Option<String>,
    table: Option<String>,
    window: Option<String>,
    database: Option<PathBuf>,
    reject_report: Option<PathBuf>,
) -> Result<ExitCode> {
    let mut config = PipelineConfig::from_file(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    if let Some(mode) = mode {
        config.target.mode = mode.parse::<LoadMode>()?;
    }
    if let Some(table) = table {
        config.target.table = table;
    }
    if let Some(window) = window {
        window.parse::<WindowSpec>()?;
        config.window.duration = window;
    }
    if let Some(database) = database {
        config.target.database = database;
    }
    if reject_report.is_some() {
        config.reject_report = reject_report;
    }

    let pipeline = Pipeline::new(config).context("Invalid pipeline configuration")?;

    println!("🚀 Fraud ETL run");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let manifest = pipeline.run();
    print_summary(&manifest);

    Ok(ExitCode::from(manifest.exit_code() as u8))
}

fn print_summary(manifest: &RunManifest) {
    println!("Run ID: {}", manifest.run_id);
    for input in &manifest.inputs {
        println!(
            "✓ {} {} ({} rows, sha256 {})",
            input.role,
            input.path,
            input.rows,
            &input.sha256[..12.min(input.sha256.len())]
        );
    }
    println!("✓ Extracted: {}", manifest.counts.extracted);
    println!("✓ Cleaned: {}", manifest.counts.cleaned);
    println!("✓ Enriched: {}", manifest.counts.enriched);
    println!("✓ Loaded: {} into {} ({})", manifest.counts.loaded, manifest.target_table, manifest.mode.name());
    println!("✓ High-risk alerts: {}", manifest.alert_count);

    if manifest.reject_count > 0 {
        println!("\n⚠️  Rejects: {}", manifest.reject_count);
        for (reason, count) in &manifest.rejects_by_reason {
            println!("   - {}: {}", reason, count);
        }
    }

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    match (&manifest.failed_stage, &manifest.error_message) {
        (Some(stage), Some(message)) => {
            println!("❌ FAILED at {}: {}", stage.name(), message);
        }
        _ => println!("✅ {} in {} ms", manifest.status.name().to_uppercase(), manifest.duration_ms.unwrap_or(0)),
    }
}

fn open_store(database: &Path) -> Result<SqliteStore> {
    SqliteStore::open(database, Duration::from_secs(5))
        .with_context(|| format!("Failed to open {}", database.display()))
}

fn show_history(database: &Path, limit: usize) -> Result<()> {
    let store = open_store(database)?;
    let manifests = list_manifests(store.connection(), limit)?;

    if manifests.is_empty() {
        println!("No runs recorded in {}", database.display());
        return Ok(());
    }

    println!(
        "{:<36}  {:<25}  {:<9}  {:>8}  {:>7}  {}",
        "RUN ID", "STARTED", "STATUS", "LOADED", "REJECTS", "TABLE"
    );
    for m in manifests {
        println!(
            "{:<36}  {:<25}  {:<9}  {:>8}  {:>7}  {}",
            m.run_id,
            m.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            m.status.name(),
            m.counts.loaded,
            m.reject_count,
            m.target_table
        );
    }
    Ok(())
}

fn show_run(database: &Path, run_id: &str) -> Result<ExitCode> {
    let store = open_store(database)?;
    match get_manifest(store.connection(), run_id)? {
        Some(manifest) => {
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("❌ No run {}", run_id);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn show_rejects(database: &Path, run_id: &str, output: Option<&Path>) -> Result<ExitCode> {
    let store = open_store(database)?;
    let rejects = get_rejects(store.connection(), run_id)?;

    if let Some(path) = output {
        let written = write_reject_report(path, run_id, &rejects)?;
        println!("✓ Wrote {} rejects to {}", written, path.display());
        return Ok(ExitCode::SUCCESS);
    }

    for reject in &rejects {
        println!(
            "{:>6}  {:<8}  {:<24}  {}",
            reject.raw.position,
            reject.stage.name(),
            reject.reason.code(),
            reject.detail
        );
    }
    println!("✓ {} rejects", rejects.len());
    Ok(ExitCode::SUCCESS)
}
