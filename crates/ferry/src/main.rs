//! Ferry command-line entry point
//!
//! - **watch**: poll the configured source directories and transfer every
//!   new or changed file once, until SIGINT/SIGTERM
//! - **mappings**: validate and print the mapping rules
//! - **ledger**: inspect or compact the processed-file ledger
//! - **transfer**: push a single file through the pipeline now

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ferry::{mapping_for, FerryConfig, LocalDirClient, PollingWatcher};
use ferry_pipeline::{
    CancellationToken, ProcessedFileLedger, TaskOutcome, TransferClient, TransferPipeline,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long in-flight transfers may finish after a shutdown signal
const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "ferry", about = "Transfer new and changed files exactly once")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: <ferry home>/config.toml)
    #[arg(long, global = true, env = "FERRY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch source directories and transfer changed files
    Watch,

    /// Parse and print the mapping rules
    Mappings,

    /// Show processed-file ledger statistics
    Ledger {
        /// Prune expired records and write a fresh snapshot
        #[arg(long)]
        compact: bool,
    },

    /// Transfer one file now using the first matching mapping
    Transfer {
        /// File to transfer
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = ferry_logging::init_logging(ferry_logging::LogConfig {
        app_name: "ferry",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        eprintln!("Warning: file logging unavailable: {:#}", e);
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.unwrap_or_else(FerryConfig::default_path);
    let config = FerryConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    match cli.command {
        Commands::Watch => cmd_watch(&config),
        Commands::Mappings => cmd_mappings(&config),
        Commands::Ledger { compact } => cmd_ledger(&config, compact),
        Commands::Transfer { file } => cmd_transfer(&config, &file),
    }
}

fn open_ledger(config: &FerryConfig) -> Result<Arc<ProcessedFileLedger>> {
    let ledger = ProcessedFileLedger::open(&config.ledger_path, config.pipeline.ledger.clone())
        .with_context(|| format!("Failed to open ledger {}", config.ledger_path.display()))?;
    Ok(Arc::new(ledger))
}

fn build_pipeline(config: &FerryConfig) -> Result<TransferPipeline> {
    let ledger = open_ledger(config)?;
    let client: Arc<dyn TransferClient> = Arc::new(LocalDirClient::new(&config.destination_root));
    let pipeline = TransferPipeline::new(&config.pipeline, ledger, client)
        .context("Failed to start transfer pipeline")?;
    Ok(pipeline)
}

fn cmd_watch(config: &FerryConfig) -> Result<ExitCode> {
    let mappings = config.load_mappings()?;
    if mappings.is_empty() {
        anyhow::bail!(
            "No mapping rules in {}; nothing to watch",
            config.mapping_file.display()
        );
    }

    let pipeline = build_pipeline(config)?;
    info!(
        mappings = mappings.len(),
        ledger = %config.ledger_path.display(),
        destination = %config.destination_root.display(),
        "Starting ferry"
    );

    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone())?;

    let mut watcher = PollingWatcher::new(mappings, config.polling_interval());
    let watch_result = watcher.run(&pipeline, &shutdown);

    info!("Shutting down, waiting for in-flight transfers");
    if !pipeline.shutdown(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS)) {
        warn!("Some transfers did not finish before the shutdown timeout");
    }
    match pipeline.ledger().compact() {
        Ok(pruned) => info!(pruned, "Ledger compacted"),
        Err(e) => warn!(error = %e, "Failed to compact ledger at shutdown"),
    }

    let stats = pipeline.stats();
    info!(
        submitted = stats.submitted,
        transferred = stats.transferred,
        already_processed = stats.already_processed,
        failed = stats.failed,
        "Ferry stopped"
    );

    watch_result?;
    Ok(ExitCode::SUCCESS)
}

fn install_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
        std::thread::Builder::new()
            .name("ferry-signals".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!("Received signal {}, initiating shutdown...", sig);
                    shutdown.cancel();
                }
            })
            .context("Failed to spawn signal thread")?;
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, initiating shutdown...");
            shutdown.cancel();
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    Ok(())
}

fn cmd_mappings(config: &FerryConfig) -> Result<ExitCode> {
    let mappings = config.load_mappings()?;
    println!(
        "{} mapping rule(s) in {}",
        mappings.len(),
        config.mapping_file.display()
    );
    for mapping in &mappings {
        let status = if mapping.source_root().is_dir() {
            ""
        } else {
            "  (source missing)"
        };
        println!("  {}{}", mapping, status);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_ledger(config: &FerryConfig, compact: bool) -> Result<ExitCode> {
    let ledger = open_ledger(config)?;

    if compact {
        let pruned = ledger.compact().context("Failed to compact ledger")?;
        println!("Compacted ledger: pruned {} expired record(s)", pruned);
    }

    let records = ledger.records();
    println!("Ledger:  {}", config.ledger_path.display());
    println!("Records: {}", records.len());

    let times: Vec<_> = records.iter().filter_map(|r| r.processed_at()).collect();
    if let (Some(oldest), Some(newest)) = (times.iter().min(), times.iter().max()) {
        println!("Oldest:  {}", oldest.to_rfc3339());
        println!("Newest:  {}", newest.to_rfc3339());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_transfer(config: &FerryConfig, file: &Path) -> Result<ExitCode> {
    let mappings = config.load_mappings()?;

    let mut path = file.to_path_buf();
    if mapping_for(&mappings, &path).is_none() {
        if let Ok(canonical) = std::fs::canonicalize(file) {
            path = canonical;
        }
    }
    let mapping = mapping_for(&mappings, &path)
        .with_context(|| format!("No mapping rule matches {}", file.display()))?
        .clone();

    let pipeline = build_pipeline(config)?;
    let outcome = pipeline.process_now(&path, &mapping);
    pipeline.shutdown(Duration::from_secs(1));

    match outcome {
        TaskOutcome::Transferred { remote } => {
            println!("Transferred {} -> {}", path.display(), remote);
            Ok(ExitCode::SUCCESS)
        }
        TaskOutcome::AlreadyProcessed => {
            println!("Already transferred: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        TaskOutcome::Failed { error } => {
            eprintln!("Transfer failed: {}", error);
            Ok(ExitCode::FAILURE)
        }
        other => {
            eprintln!("Not transferred ({:?}): {}", other, path.display());
            Ok(ExitCode::FAILURE)
        }
    }
}
