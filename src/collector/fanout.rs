//! Spreading collection over the worker pools
//!
//! `schedule_collector` cuts the agent list into batches and submits one
//! `collector_batch` task per batch. A batch submits one `collector` task per
//! agent and returns without waiting for them.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::agent::AgentEndpoint;
use crate::scheduler::{ScheduleOutcome, Task, TaskSink, WorkerKind};
use crate::storage::StorageBackend;

/// Agents per `collector_batch` task
pub const BATCH_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    pub agents: Vec<AgentEndpoint>,
}

pub fn batch_task(agents: &[AgentEndpoint]) -> Task {
    let first = agents.first().map(AgentEndpoint::id).unwrap_or_default();
    Task::once(WorkerKind::CollectorBatch, format!("collector_batch:{first}")).with_options(
        serde_json::json!({
            "agents": agents,
        }),
    )
}

pub fn collector_task(agent: &AgentEndpoint) -> Task {
    Task::once(WorkerKind::Collector, format!("collector:{}", agent.id()))
        .with_options(serde_json::json!(agent))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub scheduled: usize,
    pub duplicates: usize,
}

impl FanoutReport {
    fn record(&mut self, outcome: ScheduleOutcome) {
        match outcome {
            ScheduleOutcome::Scheduled => self.scheduled += 1,
            ScheduleOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

pub struct CollectorFanout {
    storage: Arc<dyn StorageBackend>,
    sink: TaskSink,
}

impl CollectorFanout {
    pub fn new(storage: Arc<dyn StorageBackend>, sink: TaskSink) -> Self {
        Self { storage, sink }
    }

    /// Submit one batch task per [`BATCH_SIZE`] agents
    #[instrument(skip(self))]
    pub async fn schedule_collector(&self) -> Result<FanoutReport> {
        let agents = self
            .storage
            .list_agents()
            .await
            .context("failed to list agents")?;

        let mut report = FanoutReport::default();
        for batch in agents.chunks(BATCH_SIZE) {
            let outcome = self.sink.submit(batch_task(batch)).await?;
            report.record(outcome);
        }

        debug!(
            "{} agents in {} new batches ({} still queued)",
            agents.len(),
            report.scheduled,
            report.duplicates
        );
        Ok(report)
    }

    /// Submit one collector task per agent of the batch
    #[instrument(skip_all)]
    pub async fn collector_batch(&self, options: serde_json::Value) -> Result<FanoutReport> {
        let options: BatchOptions =
            serde_json::from_value(options).context("invalid collector_batch options")?;

        let mut report = FanoutReport::default();
        for agent in &options.agents {
            match self.sink.submit(collector_task(agent)).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => warn!("failed to submit collector for {}: {e:#}", agent.id()),
            }
        }

        Ok(report)
    }
}
