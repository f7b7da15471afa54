//! Periodic maintenance of the metric tables
//!
//! Every step works table by table: a failing table is logged and the next
//! one still runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tracing::{debug, error, info, instrument};

use crate::storage::{AggregateLevel, StorageBackend};
use crate::storage::schema::TableReport;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub tables: Vec<TableReport>,
    /// Tables whose step failed
    pub failed: Vec<String>,
}

impl MaintenanceReport {
    pub fn rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }

    fn record(&mut self, table: String, result: Result<TableReport, impl std::fmt::Display>) {
        match result {
            Ok(report) => {
                debug!("{}: {} rows", report.table, report.rows);
                self.tables.push(report);
            }
            Err(e) => {
                error!("maintenance of {table} failed: {e}");
                self.failed.push(table);
            }
        }
    }
}

pub struct Maintenance {
    storage: Arc<dyn StorageBackend>,
    /// Retention in days, `None` keeps everything
    purge_after: Option<u32>,
}

impl Maintenance {
    pub fn new(storage: Arc<dyn StorageBackend>, purge_after: Option<u32>) -> Self {
        Self {
            storage,
            purge_after,
        }
    }

    /// Compact recent metrics into 30 minute and 6 hour buckets
    #[instrument(skip(self))]
    pub async fn aggregate_data(&self) -> Result<MaintenanceReport> {
        let configs = self
            .storage
            .metric_tables_config()
            .await
            .context("failed to read metric tables")?;

        let mut report = MaintenanceReport::default();
        for config in &configs {
            for level in AggregateLevel::ALL {
                let result = self.storage.aggregate_data_single(config, level).await;
                report.record(config.aggregate_table(level), result);
            }
        }

        info!("aggregated {} buckets", report.rows());
        Ok(report)
    }

    /// Move current metrics to the history tables
    #[instrument(skip(self))]
    pub async fn history_tables(&self) -> Result<MaintenanceReport> {
        let configs = self
            .storage
            .metric_tables_config()
            .await
            .context("failed to read metric tables")?;

        let mut report = MaintenanceReport::default();
        for config in &configs {
            let result = self.storage.archive_current_metrics(config).await;
            report.record(config.history_table(), result);
        }

        info!("archived {} series", report.rows());
        Ok(report)
    }

    /// Delete data older than the retention
    #[instrument(skip(self))]
    pub async fn purge_data(&self) -> Result<MaintenanceReport> {
        let Some(days) = self.purge_after else {
            debug!("purge is disabled");
            return Ok(MaintenanceReport::default());
        };

        let before = Utc::now() - Duration::days(i64::from(days));
        let tables = self
            .storage
            .purge_tables()
            .await
            .context("failed to list tables to purge")?;

        let mut report = MaintenanceReport::default();
        for table in tables {
            let result = self.storage.purge_table(&table, before).await;
            report.record(table, result);
        }

        info!("purged {} rows older than {days} days", report.rows());
        Ok(report)
    }
}
