use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use triggerd::config::EngineConfig;
use triggerd::credentials::http::HttpCredentialStore;
use triggerd::notifications::NoopNotificationHandler;
use triggerd::storage::Storage;
use triggerd::tools::http::HttpToolRegistry;
use triggerd::AppContext;

#[derive(Parser)]
#[command(name = "triggerd", about = "Trigger-driven automation engine", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP bind port for the webhook/scheduler/execute surface.
    #[arg(long, env = "TRIGGERD_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite database and config.toml.
    #[arg(long, env = "TRIGGERD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level filter, e.g. "info", "debug", "triggerd=trace,info".
    #[arg(long, env = "TRIGGERD_LOG")]
    log: Option<String>,

    /// Emit logs as JSON instead of the compact human-readable format.
    #[arg(long, env = "TRIGGERD_LOG_JSON")]
    log_json: bool,

    /// Base URL of the tool-registry RPC collaborator (§6 "Tool-registry contract").
    #[arg(long, env = "TRIGGERD_TOOL_REGISTRY_URL", default_value = "http://localhost:8080")]
    tool_registry_url: String,

    /// Base URL of the OAuth credential-store collaborator (§5).
    #[arg(long, env = "TRIGGERD_CREDENTIAL_STORE_URL", default_value = "http://localhost:8081")]
    credential_store_url: String,

    /// Seconds between poller ticks (§4.5 "on a cadence, every 5 minutes is typical").
    #[arg(long, env = "TRIGGERD_POLL_INTERVAL_SECS", default_value_t = 300)]
    poll_interval_secs: u64,

    /// Seconds between scheduler sweeps across all cadence buckets (§4.6).
    #[arg(long, env = "TRIGGERD_SCHEDULER_INTERVAL_SECS", default_value_t = 60)]
    scheduler_interval_secs: u64,

    /// Seconds between event-queue dispatcher claim batches (§4.3).
    #[arg(long, env = "TRIGGERD_DISPATCH_INTERVAL_SECS", default_value_t = 2)]
    dispatch_interval_secs: u64,

    /// Events claimed per dispatcher batch.
    #[arg(long, env = "TRIGGERD_DISPATCH_BATCH_SIZE", default_value_t = 20)]
    dispatch_batch_size: i64,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook/scheduler/poller/execute HTTP surface (default).
    Serve,
    /// Run pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.log.as_deref().unwrap_or("info"), args.log_json);

    match args.command {
        Some(Command::Migrate) => {
            let config = Arc::new(EngineConfig::new(args.port, args.data_dir.clone(), args.log.clone()));
            Storage::new(&config.data_dir).await.context("running migrations")?;
            info!(data_dir = %config.data_dir.display(), "migrations applied");
        }
        None | Some(Command::Serve) => {
            run_server(args).await?;
        }
    }

    Ok(())
}

fn setup_logging(log_level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.compact().init();
    }
}

async fn run_server(args: Args) -> Result<()> {
    let config = Arc::new(EngineConfig::new(args.port, args.data_dir.clone(), args.log.clone()));

    let storage = Arc::new(
        Storage::new(&config.data_dir)
            .await
            .context("opening storage")?,
    );
    let registry = Arc::new(HttpToolRegistry::new(args.tool_registry_url.clone()));
    let credential_store = Arc::new(HttpCredentialStore::new(args.credential_store_url.clone()));
    let notifications = Arc::new(NoopNotificationHandler);

    let ctx = Arc::new(AppContext::new(
        config.clone(),
        storage,
        registry,
        credential_store,
        notifications,
        None,
    ));

    info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        tool_registry = %args.tool_registry_url,
        "starting triggerd"
    );

    spawn_poller_loop(ctx.clone(), Duration::from_secs(args.poll_interval_secs));
    spawn_scheduler_loop(ctx.clone(), Duration::from_secs(args.scheduler_interval_secs));
    spawn_dispatcher_loop(
        ctx.clone(),
        Duration::from_secs(args.dispatch_interval_secs),
        args.dispatch_batch_size,
    );

    triggerd::http::start_server(ctx).await
}

/// Background poller loop (C5, §4.5): every tick, poll every due
/// `trigger_type=polling` automation.
fn spawn_poller_loop(ctx: Arc<AppContext>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match ctx.poller.run_due().await {
                Ok(metrics) => {
                    if metrics.automations_polled > 0 {
                        info!(?metrics, "poller tick complete");
                    }
                }
                Err(e) => error!(error = %e, "poller tick failed"),
            }
        }
    });
}

/// Background scheduler loop (C6, §4.6): sweep every cadence bucket each
/// tick. §9 Open Question 2 notes a priority-queued delayed-dispatch
/// channel would be cheaper at scale than this fixed-interval sweep — kept
/// simple here since the `once` bucket is the only one that needs sub-tick
/// precision, and it already re-checks every tick.
fn spawn_scheduler_loop(ctx: Arc<AppContext>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match ctx.scheduler.run_all().await {
                Ok(dispatched) => {
                    if dispatched > 0 {
                        info!(dispatched, "scheduler sweep complete");
                    }
                }
                Err(e) => error!(error = %e, "scheduler sweep failed"),
            }
        }
    });
}

/// Background dispatcher loop: claims queued events (C3) and runs them
/// through the executor (C2). Webhook ingress only enqueues; this loop is
/// the "separate consumer" described in §4.3.
fn spawn_dispatcher_loop(ctx: Arc<AppContext>, interval: Duration, batch_size: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match ctx.dispatcher.run_batch(batch_size).await {
                Ok(claimed) => {
                    if claimed > 0 {
                        info!(claimed, "dispatcher batch complete");
                    }
                }
                Err(e) => warn!(error = %e, "dispatcher batch failed"),
            }
        }
    });
}
