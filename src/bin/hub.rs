use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fleetwatch::{
    config::read_config_file,
    notifications::Notifier,
    scheduler::{Scheduler, SchedulerHandle, SubmissionListener, TaskSink},
    storage::{StorageBackend, sqlite::SqliteBackend},
    workers::{self, Services},
};
use tracing::{debug, error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Attempts at opening the database before giving up
const STORAGE_CONNECT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = filter::Targets::new().with_targets(vec![
        ("fleetwatch", level),
        ("fleetwatch_hub", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let backend =
        SqliteBackend::connect_with_retry(&config.storage.path, STORAGE_CONNECT_ATTEMPTS)
            .await
            .with_context(|| format!("failed to open {}", config.storage.path.display()))?;
    let storage: Arc<dyn StorageBackend> = Arc::new(backend);

    storage
        .sync_inventory(&config.instances, &config.roles)
        .await
        .context("failed to load the inventory")?;
    info!(
        "{} instances and {} roles in inventory",
        config.instances.len(),
        config.roles.len()
    );

    let (handle, command_rx) = SchedulerHandle::channel();

    let sink = match &config.scheduler.listener {
        Some(path) => TaskSink::Socket(path.clone()),
        None => TaskSink::Local(handle.clone()),
    };
    let notifier =
        Notifier::from_config(&config.notifications).context("invalid notification settings")?;
    if !notifier.is_enabled() {
        debug!("no notification transport configured");
    }

    let services = Services::new(&config, storage.clone(), sink, notifier)?;
    let registry = workers::build_registry(&services).context("failed to register workers")?;
    workers::check_bootstrap(&registry)?;

    // bind before the first collector batch needs the socket
    let listener = match &config.scheduler.listener {
        Some(path) => Some(SubmissionListener::bind(path).await?),
        None => None,
    };

    let scheduler = Scheduler::spawn(
        registry,
        command_rx,
        Duration::from_millis(config.scheduler.tick_ms),
    );

    if let Some(listener) = listener {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run(handle).await {
                error!("submission listener stopped: {e:#}");
            }
        });
    }

    workers::bootstrap(&handle).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    handle.shutdown().await.ok();
    if let Err(e) = scheduler.await {
        error!("scheduler task failed: {e}");
    }
    storage.close().await?;

    Ok(())
}
