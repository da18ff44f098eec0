use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use osc_cutover::config::{self, Config};
use osc_cutover::db::{self, MonitorScheduler, SqliteStore};
use osc_cutover::handler::{ConfiguredConnections, OscTaskHandler};
use osc_cutover::model::{OscParameters, RateLimiterConfig};
use osc_cutover::oms::OmsClient;
use osc_cutover::pipeline::create_project::ConsoleRequestStrategy;
use osc_cutover::session::MySqlSessionFactory;

#[derive(Debug, Parser)]
#[command(author, version, about = "Online schema change cutover orchestrator")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile every armed job until interrupted
    Run,
    /// Submit a schema change described by a YAML or JSON parameters file
    Submit {
        #[arg(long)]
        connection: String,
        #[arg(long)]
        parameters: PathBuf,
    },
    /// Approve the swap of a job waiting at the manual gate
    Swap {
        #[arg(long)]
        task: i64,
    },
    /// Change the throttle of a running job; omitted limits are removed
    RateLimit {
        #[arg(long)]
        task: i64,
        /// Rows per second
        #[arg(long)]
        row_limit: Option<i32>,
        /// Bytes per second
        #[arg(long)]
        data_size_limit: Option<i64>,
    },
    /// Print the state of a job
    Status {
        #[arg(long)]
        task: i64,
    },
    /// Print an example config file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.app.database_url.clone());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));
    let handler = build_handler(&cfg, store.clone())?;

    match args.command {
        Command::Run => run(&handler, store.as_ref(), cfg.tick_interval()).await,
        Command::Submit {
            connection,
            parameters,
        } => {
            let content = std::fs::read_to_string(&parameters)
                .with_context(|| format!("read {}", parameters.display()))?;
            let parameters: OscParameters =
                serde_yaml::from_str(&content).context("malformed job parameters")?;
            let task = handler.submit(&connection, parameters).await?;
            info!(task_id = task.id, schedule_id = task.schedule_id, "submitted");
            println!("{}", task.id);
            Ok(())
        }
        Command::Swap { task } => {
            handler.request_manual_swap(task).await?;
            println!("swap requested for task {task}");
            Ok(())
        }
        Command::RateLimit {
            task,
            row_limit,
            data_size_limit,
        } => {
            let config = RateLimiterConfig {
                row_limit,
                data_size_limit,
            };
            handler.update_rate_limit(task, config).await?;
            println!("rate limit updated for task {task}");
            Ok(())
        }
        Command::Status { task } => {
            let (task, result) = handler.status(task).await?;
            println!(
                "task {} {} {:.1}%",
                task.id,
                task.status.as_str(),
                task.progress_percentage
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::ExampleConfig => Ok(()),
    }
}

fn build_handler(cfg: &Config, store: Arc<SqliteStore>) -> Result<OscTaskHandler> {
    let properties = cfg.properties();
    let api = OmsClient::new(&cfg.oms.url, cfg.oms.authorization.clone())?;
    Ok(OscTaskHandler::new(
        store,
        Arc::new(api),
        Arc::new(MySqlSessionFactory),
        Arc::new(ConfiguredConnections::new(cfg.connections.clone())),
        Arc::new(ConsoleRequestStrategy::new(properties.clone())),
        properties,
    ))
}

/// Ticks every armed job once per interval. Jobs run one after another, so a
/// job never has two invocations in flight.
async fn run(
    handler: &OscTaskHandler,
    monitor: &dyn MonitorScheduler,
    interval: Duration,
) -> Result<()> {
    info!(?interval, "starting reconcile loop");
    loop {
        match monitor.armed().await {
            Ok(triggers) => {
                for trigger in triggers {
                    if let Err(err) = handler.tick(&trigger).await {
                        warn!(schedule_id = trigger.schedule_id, %err, "tick failed");
                    }
                }
            }
            Err(err) => error!(?err, "failed to list armed monitors"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
                return Ok(());
            }
        }
    }
}
