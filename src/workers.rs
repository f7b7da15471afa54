//! Wiring of the hub workers into the scheduler
//!
//! | worker               | pool | bootstrap             |
//! |----------------------|------|-----------------------|
//! | `aggregate_data`     | 1    | every 30 minutes      |
//! | `history_tables`     | 1    | every 3 hours         |
//! | `purge_data`         | 1    | every 24 hours        |
//! | `schedule_collector` | 1    | every 60 seconds      |
//! | `collector_batch`    | 20   | from the fan-out      |
//! | `collector`          | 20   | from the batches      |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::agent::{AgentClient, AgentEndpoint};
use crate::alerting::AlertEvaluator;
use crate::collector::{CollectorFanout, CollectorPipeline};
use crate::config::Config;
use crate::maintenance::Maintenance;
use crate::notifications::Notifier;
use crate::scheduler::{
    ScheduleOutcome, SchedulerError, SchedulerHandle, Task, TaskSink, WorkerKind, WorkerRegistry,
    worker_fn,
};
use crate::storage::StorageBackend;

pub const POOL_SIZES: &[(WorkerKind, usize)] = &[
    (WorkerKind::AggregateData, 1),
    (WorkerKind::HistoryTables, 1),
    (WorkerKind::PurgeData, 1),
    (WorkerKind::ScheduleCollector, 1),
    (WorkerKind::CollectorBatch, 20),
    (WorkerKind::Collector, 20),
];

fn pool_size(kind: WorkerKind) -> usize {
    POOL_SIZES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, size)| *size)
        .unwrap_or(1)
}

/// Periodic tasks created at start-up
pub fn bootstrap_tasks() -> Vec<Task> {
    vec![
        Task::periodic(
            WorkerKind::AggregateData,
            "aggregate_data",
            Duration::from_secs(30 * 60),
        ),
        Task::periodic(
            WorkerKind::HistoryTables,
            "history_tables",
            Duration::from_secs(3 * 60 * 60),
        ),
        Task::periodic(
            WorkerKind::PurgeData,
            "purge_data",
            Duration::from_secs(24 * 60 * 60),
        ),
        Task::periodic(
            WorkerKind::ScheduleCollector,
            "schedule_collector",
            Duration::from_secs(60),
        ),
    ]
}

/// Everything the workers run on
pub struct Services {
    pub pipeline: Arc<CollectorPipeline>,
    pub fanout: Arc<CollectorFanout>,
    pub maintenance: Arc<Maintenance>,
}

impl Services {
    pub fn new(
        config: &Config,
        storage: Arc<dyn StorageBackend>,
        sink: TaskSink,
        notifier: Notifier,
    ) -> Result<Self> {
        let monitoring = &config.monitoring;

        let client = AgentClient::new(Duration::from_secs(monitoring.agent_timeout))
            .context("failed to build agent client")?;
        let evaluator = Arc::new(AlertEvaluator::new(storage.clone(), notifier));

        let pipeline = CollectorPipeline::new(
            storage.clone(),
            client,
            evaluator,
            monitoring.history_limit,
            Duration::from_secs(monitoring.collect_max_duration),
        );

        Ok(Self {
            pipeline: Arc::new(pipeline),
            fanout: Arc::new(CollectorFanout::new(storage.clone(), sink)),
            maintenance: Arc::new(Maintenance::new(storage, monitoring.purge_after)),
        })
    }
}

/// Register a handler for every worker
pub fn build_registry(services: &Services) -> Result<WorkerRegistry, SchedulerError> {
    let mut registry = WorkerRegistry::new();

    let maintenance = services.maintenance.clone();
    registry.register(
        WorkerKind::AggregateData,
        pool_size(WorkerKind::AggregateData),
        worker_fn(move |_| {
            let maintenance = maintenance.clone();
            async move { maintenance.aggregate_data().await.map(|_| ()) }
        }),
    )?;

    let maintenance = services.maintenance.clone();
    registry.register(
        WorkerKind::HistoryTables,
        pool_size(WorkerKind::HistoryTables),
        worker_fn(move |_| {
            let maintenance = maintenance.clone();
            async move { maintenance.history_tables().await.map(|_| ()) }
        }),
    )?;

    let maintenance = services.maintenance.clone();
    registry.register(
        WorkerKind::PurgeData,
        pool_size(WorkerKind::PurgeData),
        worker_fn(move |_| {
            let maintenance = maintenance.clone();
            async move { maintenance.purge_data().await.map(|_| ()) }
        }),
    )?;

    let fanout = services.fanout.clone();
    registry.register(
        WorkerKind::ScheduleCollector,
        pool_size(WorkerKind::ScheduleCollector),
        worker_fn(move |_| {
            let fanout = fanout.clone();
            async move { fanout.schedule_collector().await.map(|_| ()) }
        }),
    )?;

    let fanout = services.fanout.clone();
    registry.register(
        WorkerKind::CollectorBatch,
        pool_size(WorkerKind::CollectorBatch),
        worker_fn(move |options| {
            let fanout = fanout.clone();
            async move { fanout.collector_batch(options).await.map(|_| ()) }
        }),
    )?;

    let pipeline = services.pipeline.clone();
    registry.register(
        WorkerKind::Collector,
        pool_size(WorkerKind::Collector),
        worker_fn(move |options| {
            let pipeline = pipeline.clone();
            async move {
                let agent: AgentEndpoint =
                    serde_json::from_value(options).context("invalid collector options")?;
                pipeline.collect(&agent).await.map(|_| ())
            }
        }),
    )?;

    Ok(registry)
}

/// Fail when a bootstrap task names a worker without handler
pub fn check_bootstrap(registry: &WorkerRegistry) -> Result<(), SchedulerError> {
    let kinds: Vec<WorkerKind> = bootstrap_tasks().iter().map(|task| task.worker).collect();
    registry.ensure_registered(&kinds)
}

/// Schedule the periodic tasks
pub async fn bootstrap(handle: &SchedulerHandle) -> Result<()> {
    for task in bootstrap_tasks() {
        let id = task.id.clone();
        match handle
            .schedule(task)
            .await
            .with_context(|| format!("failed to schedule {id}"))?
        {
            ScheduleOutcome::Scheduled => info!("scheduled {id}"),
            ScheduleOutcome::Duplicate => debug!("{id} is already scheduled"),
        }
    }

    Ok(())
}
