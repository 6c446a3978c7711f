//! Snowstorm - operator entry point
//!
//! Ships data from external sources into a PostgreSQL database for
//! downstream consumption. `job` subcommands run as scheduled batch
//! jobs; `deploy` subcommands run as long-lived deployments.

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use snowstorm_common::logging::{init_logging, LogConfig, LogLevel};
use snowstorm_core::jobs::apistats::{ApiStatsJob, LogAnalyticsClient};
use snowstorm_core::jobs::cleanup::RetentionSweeper;
use snowstorm_core::jobs::freshservice::{FreshServiceClient, FreshServiceJob};
use snowstorm_core::jobs::seed::EventSeeder;
use snowstorm_core::{Config, EventConsumer, LeaderElection, Store};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "snowstorm")]
#[command(
    author,
    version,
    about = "Ships operational data into PostgreSQL for downstream reporting"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tasks designed to run as scheduled batch jobs
    #[command(subcommand)]
    Job(JobCommand),

    /// Tasks designed to run as long-lived deployments
    #[command(subcommand)]
    Deploy(DeployCommand),
}

#[derive(Subcommand, Debug)]
enum JobCommand {
    /// Collect API stats from the log-analytics service
    Apistats {
        /// Number of query attempts on failure
        #[arg(short, long, default_value_t = 10)]
        retries: u32,

        /// Number of days worth of logs to collect
        #[arg(short, long, default_value_t = 1)]
        days: i64,

        /// Domain to use for log collection
        #[arg(long, default_value = "api.gb.bink.com")]
        domain: String,
    },

    /// Collect ticket data from FreshService
    Freshservice {
        /// Days worth of tickets to collect
        #[arg(short, long, default_value_t = 1)]
        days: i64,

        /// Seconds to sleep after a rate limit
        #[arg(short = 's', long, default_value_t = 60)]
        rate_limit_timeout: u64,
    },

    /// Remove old records from the database
    Cleanup {
        /// Days to keep
        #[arg(short, long, default_value_t = 35)]
        days: i64,
    },

    /// Create fake events on the broker
    CreateEvents {
        /// Queue name to add events to
        #[arg(short, long, default_value = "snowstorm_test")]
        queue: String,

        /// Number of events to create
        #[arg(short, long, default_value_t = 100)]
        count: u32,
    },
}

#[derive(Subcommand, Debug)]
enum DeployCommand {
    /// Collect application events from the broker
    Events {
        /// Queues to process, comma separated
        #[arg(short, long, default_value = "snowstorm_test")]
        queues: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Environment configuration first; the verbose flag raises the level
    let mut log_config = LogConfig::from_env()?;
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    init_logging(&log_config)?;

    let config = Config::load()?;

    match cli.command {
        Command::Job(job) => run_job(job, config).await,
        Command::Deploy(deploy) => run_deploy(deploy, config).await,
    }
}

async fn run_job(job: JobCommand, config: Config) -> Result<()> {
    match job {
        JobCommand::Apistats {
            retries,
            days,
            domain,
        } => {
            let store = connect_store(&config).await?;
            let election = LeaderElection::from_config(&config.lock)?;
            let client = LogAnalyticsClient::new(
                &config.collectors.log_analytics_workspace,
                &config.collectors.log_analytics_token,
                &domain,
                retries,
            );
            ApiStatsJob::new(client, days).run(&election, &store).await
        }
        JobCommand::Freshservice {
            days,
            rate_limit_timeout,
        } => {
            let store = connect_store(&config).await?;
            let election = LeaderElection::from_config(&config.lock)?;
            let client = FreshServiceClient::new(
                &config.collectors.freshservice_domain,
                &config.collectors.freshservice_api_key,
            );
            FreshServiceJob::new(client, days, Duration::from_secs(rate_limit_timeout))
                .run(&election, &store)
                .await
        }
        JobCommand::Cleanup { days } => {
            let store = connect_store(&config).await?;
            let election = LeaderElection::from_config(&config.lock)?;
            RetentionSweeper::new(days).run(&election, &store).await;
            Ok(())
        }
        JobCommand::CreateEvents { queue, count } => {
            EventSeeder::new(&config.amqp, &queue, count).run().await?;
            Ok(())
        }
    }
}

async fn run_deploy(deploy: DeployCommand, config: Config) -> Result<()> {
    match deploy {
        DeployCommand::Events { queues } => {
            let store = connect_store(&config).await?;
            let consumer = EventConsumer::new(&config.amqp, &config.pipeline, &queues, store);

            let shutdown = CancellationToken::new();
            tokio::spawn(watch_for_shutdown(shutdown.clone()));

            consumer.run(shutdown).await;
            Ok(())
        }
    }
}

/// Connect the database pool and apply any pending migrations
async fn connect_store(config: &Config) -> Result<Store> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    Ok(Store::new(pool))
}

/// Cancel the token on ctrl-c or SIGTERM; consumption stops between
/// messages and unacknowledged deliveries return to the broker.
async fn watch_for_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }

    shutdown.cancel();
}
