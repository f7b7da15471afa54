//! Worker kinds, handlers and the registry holding their pools

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use super::error::SchedulerError;

/// Every worker the hub knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerKind {
    AggregateData,
    HistoryTables,
    PurgeData,
    ScheduleCollector,
    CollectorBatch,
    Collector,
}

/// Names used on the wire and in task ids
const WORKER_NAMES: &[(WorkerKind, &str)] = &[
    (WorkerKind::AggregateData, "aggregate_data"),
    (WorkerKind::HistoryTables, "history_tables"),
    (WorkerKind::PurgeData, "purge_data"),
    (WorkerKind::ScheduleCollector, "schedule_collector"),
    (WorkerKind::CollectorBatch, "collector_batch"),
    (WorkerKind::Collector, "collector"),
];

impl WorkerKind {
    pub fn all() -> impl Iterator<Item = WorkerKind> {
        WORKER_NAMES.iter().map(|(kind, _)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        WORKER_NAMES
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WORKER_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| SchedulerError::UnknownWorker(s.to_string()))
    }
}

/// Code run for a task
///
/// Errors are logged by the scheduler; they never stop a periodic task.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, options: serde_json::Value) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`Worker`]
pub struct FnWorker<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, options: serde_json::Value) -> anyhow::Result<()> {
        (self.f)(options).await
    }
}

/// Wrap a closure as a shareable worker
///
/// ```
/// # use fleetwatch::scheduler::worker_fn;
/// let worker = worker_fn(|_options| async { Ok(()) });
/// ```
pub fn worker_fn<F, Fut>(f: F) -> Arc<dyn Worker>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnWorker { f })
}

/// A registered worker and its pool
#[derive(Clone)]
pub(crate) struct Registration {
    pub handler: Arc<dyn Worker>,
    pub pool: Arc<Semaphore>,
    pub pool_size: usize,
}

/// Workers the scheduler may dispatch to
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerKind, Registration>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of a worker with its pool size
    pub fn register(
        &mut self,
        kind: WorkerKind,
        pool_size: usize,
        handler: Arc<dyn Worker>,
    ) -> Result<(), SchedulerError> {
        if pool_size == 0 {
            return Err(SchedulerError::InvalidPoolSize(kind));
        }
        if self.workers.contains_key(&kind) {
            return Err(SchedulerError::AlreadyRegistered(kind));
        }

        debug!("registering worker {kind} with pool size {pool_size}");
        self.workers.insert(
            kind,
            Registration {
                handler,
                pool: Arc::new(Semaphore::new(pool_size)),
                pool_size,
            },
        );
        Ok(())
    }

    /// Remove a worker; returns whether it was registered
    pub fn unregister(&mut self, kind: WorkerKind) -> bool {
        self.workers.remove(&kind).is_some()
    }

    pub fn contains(&self, kind: WorkerKind) -> bool {
        self.workers.contains_key(&kind)
    }

    pub fn pool_size(&self, kind: WorkerKind) -> Option<usize> {
        self.workers.get(&kind).map(|r| r.pool_size)
    }

    /// Fail when one of `kinds` has no handler
    pub fn ensure_registered(&self, kinds: &[WorkerKind]) -> Result<(), SchedulerError> {
        match kinds.iter().find(|kind| !self.contains(**kind)) {
            Some(kind) => Err(SchedulerError::NotRegistered(*kind)),
            None => Ok(()),
        }
    }

    pub(crate) fn get(&self, kind: WorkerKind) -> Option<&Registration> {
        self.workers.get(&kind)
    }
}
