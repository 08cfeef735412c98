//! cadence - a dependency-aware recurring-job scheduler.
//!
//! Usage:
//!   cadence serve --db jobs.db [--config jobs.yaml]   Run the scheduler daemon
//!   cadence run --db jobs.db [--all] [--job NAME]...  Run one scheduling cycle
//!   cadence run-job <ID> --db jobs.db [--forced]      Execute a single job (worker mode)
//!   cadence validate <CONFIG>                         Validate a config file
//!   cadence list --db jobs.db                         List jobs and their state

use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cadence::config::ScheduleFile;
use cadence::core::types::JobId;
use cadence::execution::JobRunner;
use cadence::scheduler::{CycleOptions, ExeWorkerSpawner, Scheduler};
use cadence::store::{JobStore, SqliteStore};

/// cadence - a dependency-aware recurring-job scheduler
#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon
    Serve {
        /// Path to the sqlite database
        #[arg(long)]
        db: PathBuf,

        /// Job definitions to sync into the database at startup
        #[arg(long)]
        config: Option<PathBuf>,

        /// Hostname to schedule as (default: this machine's hostname)
        #[arg(long)]
        hostname: Option<String>,

        /// Cycle poll interval in seconds
        #[arg(long, default_value = "1")]
        poll_interval: u64,

        /// Minutes without a heartbeat before a run is considered stale
        #[arg(long, default_value = "5")]
        stale_after: i64,
    },

    /// Run one scheduling cycle and exit
    Run {
        /// Path to the sqlite database
        #[arg(long)]
        db: PathBuf,

        /// Dispatch every enabled job regardless of schedule
        #[arg(long)]
        all: bool,

        /// Restrict the cycle to these job names (repeatable)
        #[arg(long = "job", value_name = "NAME")]
        jobs: Vec<String>,
    },

    /// Execute a single job to completion (worker mode)
    RunJob {
        /// Job id to execute
        #[arg(value_name = "ID")]
        id: i64,

        /// Path to the sqlite database
        #[arg(long)]
        db: PathBuf,

        /// Skip the schedule advance (run outside the regular slot)
        #[arg(long)]
        forced: bool,
    },

    /// Validate a config file without touching any database
    Validate {
        /// Path to the job definitions file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// List jobs and their state
    List {
        /// Path to the sqlite database
        #[arg(long)]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            db,
            config,
            hostname,
            poll_interval,
            stale_after,
        } => {
            serve(db, config, hostname, poll_interval, stale_after).await?;
        }
        Commands::Run { db, all, jobs } => {
            run_once(db, all, jobs).await?;
        }
        Commands::RunJob { id, db, forced } => {
            run_job(db, JobId::new(id), forced).await?;
        }
        Commands::Validate { config } => {
            validate(config)?;
        }
        Commands::List { db } => {
            list(db).await?;
        }
    }

    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

async fn open_store(db: &PathBuf) -> Result<Arc<SqliteStore>, Box<dyn std::error::Error>> {
    Ok(Arc::new(SqliteStore::open(db).await?))
}

/// Run the scheduler daemon until interrupted.
async fn serve(
    db: PathBuf,
    config: Option<PathBuf>,
    hostname: Option<String>,
    poll_interval: u64,
    stale_after: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&db).await?;

    if let Some(path) = config {
        info!("Syncing job definitions from: {}", path.display());
        let file = ScheduleFile::load(&path)?;
        let report = file.sync_to_store(store.as_ref(), chrono::Utc::now()).await?;
        info!(
            "Config synced: {} created, {} updated",
            report.created, report.updated
        );
    }

    let hostname = hostname.unwrap_or_else(local_hostname);
    let scheduler = Scheduler::new(store, Arc::new(ExeWorkerSpawner::new(db)), hostname)
        .with_poll_interval(std::time::Duration::from_secs(poll_interval.max(1)))
        .with_stale_after(chrono::Duration::minutes(stale_after.max(1)));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal.cancel();
        }
    });

    scheduler.run_forever(shutdown).await?;
    Ok(())
}

/// Run one cycle against the database and report what happened.
async fn run_once(
    db: PathBuf,
    all: bool,
    job_names: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&db).await?;
    let hostname = local_hostname();

    let only = if job_names.is_empty() {
        None
    } else {
        let mut ids = HashSet::new();
        for name in &job_names {
            match store.find_job_by_name(name).await? {
                Some(job) => {
                    ids.insert(job.id);
                }
                None => warn!("No job named '{}'", name),
            }
        }
        Some(ids)
    };

    let scheduler = Scheduler::new(
        store,
        Arc::new(ExeWorkerSpawner::new(db)),
        hostname,
    );
    let options = CycleOptions {
        force_all: all,
        only,
    };
    let report = scheduler.run_cycle(chrono::Utc::now(), &options).await?;
    info!(
        "Cycle complete: {} dispatched, {} reaped",
        report.dispatched(),
        report.reaped
    );
    Ok(())
}

/// Worker mode: execute one job and exit non-zero on failure.
async fn run_job(
    db: PathBuf,
    id: JobId,
    forced: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&db).await?;
    let runner = JobRunner::new(store, local_hostname());
    let outcome = runner.execute(id, forced).await?;
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

/// Validate a config file without touching any database.
fn validate(config: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let file = ScheduleFile::load(&config)?;
    println!("OK: {} job(s) in {}", file.jobs.len(), config.display());
    for def in &file.jobs {
        let deps = if def.dependencies.is_empty() {
            String::new()
        } else {
            format!(
                " (after: {})",
                def.dependencies
                    .iter()
                    .map(|d| d.job.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        println!("  {}{}", def.name, deps);
    }
    Ok(())
}

/// Print every job with its schedule and last outcome.
async fn list(db: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&db).await?;
    let jobs = store.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<5} {:<24} {:<10} {:<8} {:<20} {:<8} command",
        "id", "name", "frequency", "enabled", "next run", "last"
    );
    for job in jobs {
        let next_run = job
            .next_run
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let last = match job.last_run_successful {
            Some(true) => "ok",
            Some(false) => "failed",
            None => "-",
        };
        let state = if job.is_running { "running" } else { last };
        println!(
            "{:<5} {:<24} {:<10} {:<8} {:<20} {:<8} {}",
            job.id,
            job.name,
            job.frequency,
            job.enabled,
            next_run,
            state,
            job.command.describe()
        );
    }
    Ok(())
}
