//! Connection-Harvest main entry point
//!
//! Command-line interface for the resumable connection harvesting pipeline.

use clap::Parser;
use connection_harvest::checkpoint::SqliteCheckpointStore;
use connection_harvest::config::{load_config_with_hash, Config};
use connection_harvest::monitor::{print_checkpoint_progress, print_statistics, TracingMonitor};
use connection_harvest::pipeline::PipelineSettings;
use connection_harvest::recovery::{FailureClass, RecoveryController};
use connection_harvest::state::{
    build_initial, clear_run_state, load_run_state, parse_category, ActionBudgetGuard,
    BudgetCeilings, InitialParams,
};
use connection_harvest::supervisor::{HttpSessionFactory, SupervisedOutcome, Supervisor};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Connection-Harvest: a resumable connection harvester
///
/// Enumerates connections category by category, processes them in
/// checkpointed batches under a sliding-window action budget, and heals
/// itself after session failures by restarting from the last committed item.
#[derive(Parser, Debug)]
#[command(name = "connection-harvest")]
#[command(version)]
#[command(about = "A resumable connection harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Start a fresh run, discarding any saved run state
    #[arg(long)]
    fresh: bool,

    /// Category to start at on a fresh run (mutual, incoming-request, outgoing-request)
    #[arg(long, value_name = "CATEGORY")]
    category: Option<String>,

    /// Override the run state file from the configuration
    #[arg(long, value_name = "FILE")]
    state: Option<PathBuf>,

    /// Validate config and show the effective settings without running
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show checkpoint progress from the database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else {
        handle_run(config, config_hash, &cli).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("connection_harvest=info,warn"),
            1 => EnvFilter::new("connection_harvest=debug,info"),
            2 => EnvFilter::new("connection_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the settings a run would use
fn handle_dry_run(config: &Config) {
    println!("=== Connection-Harvest Dry Run ===\n");

    println!("Pipeline:");
    println!("  Batch size: {}", config.pipeline.batch_size);
    println!(
        "  Inter-batch delay: {}-{}ms",
        config.pipeline.inter_batch_delay_min_ms, config.pipeline.inter_batch_delay_max_ms
    );
    println!("  Max heal attempts: {}", config.pipeline.max_heal_attempts);

    let ceilings = BudgetCeilings::LOCAL.tightened_by(&config.budget);
    println!("\nAction budget:");
    println!("  Per minute: {}", ceilings.per_minute);
    println!("  Per hour: {}", ceilings.per_hour);
    println!("  Per day: {}", ceilings.per_day);

    let controller = RecoveryController::from_config(config);
    println!("\nRecovery:");
    println!(
        "  Rate-limit cooling-off: at least {}s",
        controller.cooling_off(FailureClass::AdmissionDenied).as_secs()
    );
    println!("  Session cooling-off: {}s", config.recovery.session_cooldown_secs);

    println!("\nCheckpoint:");
    println!("  Database: {}", config.checkpoint.database_path.display());
    println!("  Run state: {}", config.checkpoint.state_path.display());

    println!("\nCollaborators:");
    println!("  Driver: {}", config.driver.base_url);
    println!("  Store: {}", config.store.base_url);
    match &config.ingest {
        Some(ingest) => println!("  Ingest: {}", ingest.endpoint.base_url),
        None => println!("  Ingest: disabled"),
    }
    println!(
        "  History sweep: {}",
        if config.history.enabled { "enabled" } else { "disabled" }
    );

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows checkpoint progress from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.checkpoint.database_path.display());

    let store = SqliteCheckpointStore::new(&config.checkpoint.database_path)?;
    print_checkpoint_progress(&store)?;

    Ok(())
}

/// Handles the main run: resume or start, then supervise to the end
async fn handle_run(config: Config, config_hash: String, cli: &Cli) -> anyhow::Result<()> {
    let state_path = cli
        .state
        .clone()
        .unwrap_or_else(|| config.checkpoint.state_path.clone());

    if cli.fresh {
        tracing::info!("Starting fresh run (discarding saved run state)");
        clear_run_state(&state_path)?;
    }

    let initial = match load_run_state(&state_path)? {
        Some(saved) => {
            tracing::info!(
                "Resuming run {} at {} batch {} item {} (attempt {})",
                saved.request_id,
                saved
                    .current_category
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "start".to_string()),
                saved.current_batch,
                saved.current_index,
                saved.attempt_count
            );
            saved
        }
        None => {
            let category = cli.category.as_deref().map(parse_category).transpose()?;
            build_initial(InitialParams {
                credentials_ref: Some(config.credentials.credentials_ref.clone()),
                session_token: config.credentials.session_token.clone(),
                category,
                batch_size: Some(config.pipeline.batch_size),
                ..Default::default()
            })
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after the current item");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let monitor = Arc::new(TracingMonitor::new());
    let mut store = SqliteCheckpointStore::new(&config.checkpoint.database_path)?;
    let guard = ActionBudgetGuard::with_advisory(config.budget);
    let settings = PipelineSettings::from_config(&config, Some(config_hash));
    let controller = RecoveryController::from_config(&config);
    let factory = HttpSessionFactory::new(config, monitor.clone())?;

    let mut supervisor = Supervisor::new(&factory, &mut store, guard, settings, controller, stop)
        .with_state_file(state_path.clone());

    let result = supervisor.run(initial).await;
    print_statistics(&monitor.statistics());

    match result {
        Ok(SupervisedOutcome::Completed(report)) => {
            tracing::info!(
                "Run completed: {} processed, {} skipped, {} errors, {} ingested",
                report.processed(),
                report.skipped(),
                report.errors(),
                report.ingested
            );
            Ok(())
        }
        Ok(SupervisedOutcome::Stopped(state)) => {
            tracing::info!(
                "Run stopped at {} batch {} item {}; state saved to {}",
                state
                    .current_category
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "start".to_string()),
                state.current_batch,
                state.current_index,
                state_path.display()
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("Run failed: {}", e);
            Err(e.into())
        }
    }
}
