//! Steady-Harvest main entry point
//!
//! This is the command-line interface for the Steady-Harvest sync engine.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use steady_harvest::config::{load_config_with_hash, Config};
use steady_harvest::escalation::PendingQueue;
use steady_harvest::health::{load_statistics, print_statistics};
use steady_harvest::storage::{PendingTask, SqliteStorage, Storage};
use steady_harvest::sync::{run_sync, SyncRun};
use tracing_subscriber::EnvFilter;

/// Number of pending tasks listed by --pending
const PENDING_LIST_LIMIT: usize = 50;

/// How long --claim keeps a task from being handed out again
const CLAIM_LEASE_MINUTES: i64 = 15;

/// Number of recent health entries shown per scraper type
const RECENT_HEALTH_ENTRIES: usize = 10;

/// Steady-Harvest: a resilient acquisition engine
///
/// Steady-Harvest keeps a local store in sync with a rate-limited,
/// anti-bot-protected data source. Each run refreshes the items that are
/// due, falls back to a real browser when requests get blocked and queues
/// what it could not fetch for out-of-band resolution.
#[derive(Parser, Debug)]
#[command(name = "steady-harvest")]
#[command(version = "1.0.0")]
#[command(about = "A resilient acquisition engine", long_about = None)]
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

    /// Show the admission decision for every item without fetching
    #[arg(long, conflicts_with_all = ["health", "pending", "claim"])]
    dry_run: bool,

    /// Show health statistics from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "pending", "claim"])]
    health: bool,

    /// List pending tasks awaiting resolution and exit
    #[arg(long, conflicts_with_all = ["dry_run", "health", "claim"])]
    pending: bool,

    /// Claim pending tasks of the configured kind for resolution and exit
    #[arg(long, conflicts_with_all = ["dry_run", "health", "pending"])]
    claim: bool,

    /// Extra identifiers to consider this run (comma separated)
    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(config, config_hash, &cli.ids)?;
    } else if cli.health {
        handle_health(&config)?;
    } else if cli.pending {
        handle_pending(&config)?;
    } else if cli.claim {
        handle_claim(&config)?;
    } else {
        handle_sync(config, config_hash, &cli.ids).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("steady_harvest=info,warn"),
            1 => EnvFilter::new("steady_harvest=debug,info"),
            2 => EnvFilter::new("steady_harvest=trace,debug"),
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

fn open_database(config: &Config) -> anyhow::Result<SqliteStorage> {
    let path = Path::new(&config.storage.database_path);
    SqliteStorage::new(path).with_context(|| format!("Failed to open database {}", path.display()))
}

/// Handles the --dry-run mode: prints what a run would fetch
fn handle_dry_run(config: Config, config_hash: String, ids: &[String]) -> anyhow::Result<()> {
    println!("=== Steady-Harvest Dry Run ===\n");

    println!("Source:");
    println!("  Detail URL: {}", config.source.detail_url_template);
    println!("  Task kind: {}", config.source.task_kind);
    println!("  Scraper type: {}", config.source.scraper_type);
    println!("  Seeded identifiers: {}", config.source.identifiers.len());

    println!("\nFetch:");
    println!(
        "  Lightweight attempts: {}",
        config.fetch.max_lightweight_attempts
    );
    println!(
        "  Heavyweight fallback: {}",
        if config.fetch.heavyweight_enabled { "enabled" } else { "disabled" }
    );
    println!("  Concurrency: {}", config.executor.concurrency);
    println!(
        "  Pacing: {}-{}ms",
        config.pacing.min_delay_ms, config.pacing.max_delay_ms
    );

    let storage = open_database(&config)?;
    let run = SyncRun::with_components(
        config,
        config_hash,
        storage,
        std::sync::Arc::new(steady_harvest::fetch::HttpTransport::new()?),
        None,
    );
    let plan = run.plan(ids)?;

    println!("\nAdmission ({} items):", plan.len());
    for item in &plan {
        println!(
            "  {} {:<12} {:<6} {}{}",
            if item.admission.admit { "+" } else { "-" },
            item.identifier,
            item.admission.state,
            item.admission.reason,
            if item.admission.mark_stale { " (would mark stale)" } else { "" }
        );
    }

    let admitted = plan.iter().filter(|item| item.admission.admit).count();
    println!("\n✓ Configuration is valid");
    println!("✓ Would fetch {} of {} items", admitted, plan.len());

    Ok(())
}

/// Handles the --health mode: shows health statistics from the database
fn handle_health(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);

    let storage = open_database(config)?;
    let stats = load_statistics(&storage, RECENT_HEALTH_ENTRIES)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --pending mode: lists tasks awaiting resolution
fn handle_pending(config: &Config) -> anyhow::Result<()> {
    let storage = open_database(config)?;
    let tasks = storage.list_pending_tasks(None, PENDING_LIST_LIMIT)?;

    println!("=== Pending Tasks ({}) ===\n", tasks.len());
    print_tasks(&tasks);

    Ok(())
}

/// Handles the --claim mode: hands pending tasks to a resolver
fn handle_claim(config: &Config) -> anyhow::Result<()> {
    let storage = open_database(config)?;
    let queue = PendingQueue::new(Arc::new(Mutex::new(storage)));
    let tasks = queue.claim(
        Some(&config.source.task_kind),
        PENDING_LIST_LIMIT,
        chrono::Duration::minutes(CLAIM_LEASE_MINUTES),
    )?;

    println!("=== Claimed Tasks ({}) ===\n", tasks.len());
    print_tasks(&tasks);

    Ok(())
}

fn print_tasks(tasks: &[PendingTask]) {
    for task in tasks {
        println!(
            "  #{} [{}] {} x{} {}",
            task.id, task.kind, task.identifier, task.attempts, task.reason
        );
        println!("      url: {}", task.url);
        println!(
            "      first seen {}, last attempt {}",
            task.first_seen_at.format("%Y-%m-%d %H:%M:%S"),
            task.last_attempt_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

/// Handles the main sync operation
async fn handle_sync(config: Config, config_hash: String, ids: &[String]) -> anyhow::Result<()> {
    tracing::info!(
        "Seeded identifiers: {}, extra: {}",
        config.source.identifiers.len(),
        ids.len()
    );

    let summary = run_sync(config, config_hash, ids).await?;

    println!(
        "Synced {}/{} admitted items ({} via browser), {} failed, {} escalated, {} skipped",
        summary.succeeded,
        summary.admitted,
        summary.via_heavyweight,
        summary.failed,
        summary.escalated,
        summary.skipped_fresh + summary.skipped_stale + summary.closed
    );
    for failure in &summary.failures {
        println!(
            "  ✗ {} [{}] {}{}",
            failure.identifier,
            failure.kind,
            failure.reason,
            if failure.escalated { " (queued)" } else { "" }
        );
    }

    if summary.is_failure() {
        anyhow::bail!("no admitted item could be synced");
    }

    Ok(())
}
