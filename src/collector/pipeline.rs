//! Collection of one agent
//!
//! ## Steps
//!
//! ```text
//! discover → resolve cursor → fetch history → for each row: ingest → status → alerts
//! ```
//!
//! - a discovery failure aborts the run without touching the collector status
//! - a fetch failure marks a known instance FAIL and keeps its cursor
//! - an invalid row is skipped: it is rolled back on its own, the instance is
//!   marked FAIL and the next row is processed
//! - storage failures other than invalid data abort the run
//!
//! Rows are processed in the order the agent returned them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::cursor;
use crate::agent::{AgentClient, AgentEndpoint};
use crate::alerting::{AlertEvaluator, rules};
use crate::storage::schema::{CollectorState, InstanceIdentity, MetricRow};
use crate::storage::{IngestedRow, StorageBackend, StorageResult};

/// Outcome of one history row
#[derive(Debug)]
pub enum RowOutcome {
    Committed { row: MetricRow, ingested: IngestedRow },
    Skipped {
        /// Datetime of the row when it could be read
        datetime: Option<DateTime<Utc>>,
        reason: String,
    },
}

/// Summary of one collection run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub fetched: usize,
    pub committed: usize,
    pub skipped: usize,
    pub transitions: usize,
}

pub struct CollectorPipeline {
    storage: Arc<dyn StorageBackend>,
    client: AgentClient,
    evaluator: Arc<AlertEvaluator>,
    history_limit: usize,
    slow_row: Duration,
}

impl CollectorPipeline {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        client: AgentClient,
        evaluator: Arc<AlertEvaluator>,
        history_limit: usize,
        slow_row: Duration,
    ) -> Self {
        Self {
            storage,
            client,
            evaluator,
            history_limit,
            slow_row,
        }
    }

    #[instrument(skip_all, fields(agent = %agent.id()))]
    pub async fn collect(&self, agent: &AgentEndpoint) -> Result<CollectionReport> {
        let discovery = self
            .client
            .discover(agent)
            .await
            .context("discovery failed")?;

        self.storage
            .record_discovery(agent, &discovery)
            .await
            .context("failed to record discovery")?;

        let mut identity = self
            .storage
            .find_instance(&discovery.hostname, discovery.pg_port)
            .await?;

        let status = match identity {
            Some(identity) => self.storage.collector_status(identity.instance_id).await?,
            None => None,
        };
        let start = cursor::fetch_start(status.as_ref());
        debug!("fetching history from {:?}", start);

        let rows = match self.client.history(agent, start, self.history_limit).await {
            Ok(rows) => rows,
            Err(e) => {
                if let Some(identity) = identity {
                    self.storage
                        .update_collector_status(
                            identity.instance_id,
                            CollectorState::Fail,
                            Utc::now(),
                            None,
                        )
                        .await?;
                }
                return Err(e).context("history fetch failed");
            }
        };

        let mut report = CollectionReport {
            fetched: rows.len(),
            ..Default::default()
        };

        for value in &rows {
            let started = Instant::now();
            let outcome = self.ingest(value).await?;
            let elapsed = started.elapsed();
            if elapsed > self.slow_row {
                warn!("row ingest took {:?}", elapsed);
            }

            match outcome {
                RowOutcome::Committed { row, ingested } => {
                    identity = Some(ingested.identity);
                    report.committed += 1;

                    self.storage
                        .update_collector_status(
                            ingested.identity.instance_id,
                            CollectorState::Ok,
                            Utc::now(),
                            Some(row.datetime),
                        )
                        .await?;

                    match self.evaluator.evaluate(ingested.identity.instance_id, &row).await {
                        Ok(changes) => report.transitions += changes.len(),
                        Err(e) => warn!("alert evaluation failed: {e:#}"),
                    }
                }

                RowOutcome::Skipped { datetime, reason } => {
                    warn!("skipping row: {reason}");
                    report.skipped += 1;

                    if let Some(InstanceIdentity { instance_id, .. }) = identity {
                        self.storage
                            .update_collector_status(
                                instance_id,
                                CollectorState::Fail,
                                Utc::now(),
                                Some(datetime.unwrap_or_else(Utc::now)),
                            )
                            .await?;
                    }
                }
            }
        }

        info!(
            "collected {} rows ({} stored, {} skipped)",
            report.fetched, report.committed, report.skipped
        );
        Ok(report)
    }

    /// Validate and store one row
    async fn ingest(&self, value: &serde_json::Value) -> StorageResult<RowOutcome> {
        let row = match MetricRow::from_value(value) {
            Ok(row) => row,
            Err(e) => {
                return Ok(RowOutcome::Skipped {
                    datetime: MetricRow::raw_datetime(value),
                    reason: e.to_string(),
                });
            }
        };

        let checks = rules::default_checks(row.hostinfo.cpu_count);
        match self.storage.ingest_row(&row, &checks).await {
            Ok(ingested) => Ok(RowOutcome::Committed { row, ingested }),
            Err(e) if e.is_data_error() => Ok(RowOutcome::Skipped {
                datetime: Some(row.datetime),
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}
