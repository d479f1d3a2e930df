//! Marquee ETL - load the movie-metadata dumps and publish performer statistics

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marquee_common::logging::{init_logging, LogConfig, LogLevel};
use marquee_etl::models::{Dataset, RoleCategory, RunRecord, StatsQuery};
use marquee_etl::store::{self, PgStore};
use marquee_etl::{EtlConfig, EtlService, RunHandle, RunRequest, StoreBackend};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "marquee-etl")]
#[command(author, version, about = "Movie-metadata ETL and performer statistics")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load all datasets and recompute, or load a single dataset
    Run {
        /// Load only this dataset (people, titles, ratings, participations)
        #[arg(short, long)]
        dataset: Option<Dataset>,

        /// Supersede a run that is still marked running
        #[arg(short, long)]
        force: bool,

        /// Recompute statistics after a single-dataset run
        #[arg(long)]
        recompute: bool,
    },

    /// Recompute statistics from the loaded tables
    Recompute {
        #[arg(short, long)]
        force: bool,
    },

    /// Show the latest run, or a specific one
    Status {
        #[arg(long)]
        run_id: Option<i64>,
    },

    /// List recent runs, newest first
    History {
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },

    /// Stop a running run and mark it failed
    Cancel {
        run_id: i64,
    },

    /// Read the published statistics
    Top {
        #[arg(short, long)]
        profession: Option<RoleCategory>,

        /// Case-insensitive substring of the performer name
        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Apply the bundled database migrations
    Migrate,
}

/// A run record with its one-line status message
#[derive(Serialize)]
struct RunStatusView {
    #[serde(flatten)]
    run: RunRecord,
    message: String,
}

impl From<RunRecord> for RunStatusView {
    fn from(run: RunRecord) -> Self {
        let message = run.status_message();
        Self { run, message }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a background run, cancelling it on Ctrl-C
async fn wait_for_run(service: &EtlService, handle: RunHandle) -> Result<()> {
    let run_id = handle.run_id();
    info!(run_id, "Run started, press Ctrl-C to cancel");

    let wait = handle.wait();
    tokio::pin!(wait);

    let result = tokio::select! {
        result = &mut wait => result,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id, "Interrupt received, cancelling run");
            service.cancel(run_id).await?;
            wait.await
        }
    };

    match result {
        Ok(report) => print_json(&report),
        Err(e) => {
            if let Some(record) = service.status(Some(run_id)).await? {
                print_json(&RunStatusView::from(record))?;
            }
            Err(e).with_context(|| format!("Run {} failed", run_id))
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("marquee-etl")
        .filter_directives("sqlx=warn,hyper=info,reqwest=info")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let config = EtlConfig::load().context("Failed to load configuration")?;

    if let Command::Migrate = cli.command {
        if config.store != StoreBackend::Postgres {
            anyhow::bail!("migrate requires ETL_STORE=postgres");
        }
        PgStore::connect(&config.database).await?.migrate().await?;
        return Ok(());
    }

    let store = store::connect(&config)
        .await
        .context("Failed to open store")?;
    let service = EtlService::new(&config, store)?;

    match cli.command {
        Command::Run {
            dataset,
            force,
            recompute,
        } => {
            let request = RunRequest::for_dataset(dataset)
                .with_force(force)
                .with_recompute(recompute);
            let handle = service.trigger_run(request).await?;
            wait_for_run(&service, handle).await?;
        },
        Command::Recompute { force } => {
            let handle = service.trigger_recompute(force).await?;
            wait_for_run(&service, handle).await?;
        },
        Command::Status { run_id } => match service.status(run_id).await? {
            Some(record) => print_json(&RunStatusView::from(record))?,
            None => info!("No runs recorded yet"),
        },
        Command::History { limit } => {
            let runs: Vec<RunStatusView> = service
                .history(limit)
                .await?
                .into_iter()
                .map(RunStatusView::from)
                .collect();
            print_json(&runs)?;
        },
        Command::Cancel { run_id } => {
            let record = service.cancel(run_id).await?;
            print_json(&RunStatusView::from(record))?;
        },
        Command::Top {
            profession,
            name,
            limit,
            offset,
        } => {
            let mut query = StatsQuery::default().with_limit(limit).with_offset(offset);
            if let Some(profession) = profession {
                query = query.with_profession(profession);
            }
            if let Some(name) = name {
                query = query.with_name(name);
            }
            print_json(&service.top(&query).await?)?;
        },
        Command::Migrate => {},
    }

    Ok(())
}
