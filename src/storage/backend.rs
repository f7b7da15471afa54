//! Storage backend trait definition
//!
//! This module defines the `StorageBackend` trait the collector, the alert
//! evaluator and the maintenance workers talk to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use super::schema::{
    AggregateLevel, Check, CollectorState, CollectorStatus, InstanceIdentity, MetricRow,
    MetricTableConfig, NotificationTarget, StateChange, TableReport,
};
use crate::agent::{AgentEndpoint, Discovery};
use crate::config::{InstanceConfig, RoleConfig};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,
}

/// What a committed row touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestedRow {
    pub identity: InstanceIdentity,
    /// Number of probe records written to the metric tables
    pub records: usize,
}

/// Check a newly seen instance starts with
#[derive(Debug, Clone, PartialEq)]
pub struct CheckDefinition {
    pub name: String,
    pub warning: f64,
    pub critical: f64,
    pub description: String,
}

/// Trait for the monitoring database
///
/// ## Transactions
///
/// Every method is its own unit of work. [`StorageBackend::ingest_row`] wraps
/// one agent row in a single transaction: when it returns an error nothing of
/// that row was kept.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared by every worker.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert or update the agents and roles listed in the configuration
    async fn sync_inventory(
        &self,
        instances: &[InstanceConfig],
        roles: &[RoleConfig],
    ) -> StorageResult<()>;

    /// Agents to collect from, ordered by address and port
    async fn list_agents(&self) -> StorageResult<Vec<AgentEndpoint>>;

    /// Remember which host name and port an agent reported
    async fn record_discovery(
        &self,
        agent: &AgentEndpoint,
        discovery: &Discovery,
    ) -> StorageResult<()>;

    /// Look up the monitoring identity of an instance
    async fn find_instance(
        &self,
        hostname: &str,
        port: u16,
    ) -> StorageResult<Option<InstanceIdentity>>;

    async fn collector_status(&self, instance_id: i64) -> StorageResult<Option<CollectorStatus>>;

    /// Write the outcome of a collection attempt.
    ///
    /// `last_insert = None` keeps the stored value; a value older than the
    /// stored one is ignored so the cursor never moves backwards.
    async fn update_collector_status(
        &self,
        instance_id: i64,
        status: CollectorState,
        last_pull: DateTime<Utc>,
        last_insert: Option<DateTime<Utc>>,
    ) -> StorageResult<()>;

    /// Store one agent row atomically: identity, availability, metrics and checks
    async fn ingest_row(
        &self,
        row: &MetricRow,
        checks: &[CheckDefinition],
    ) -> StorageResult<IngestedRow>;

    async fn instance_checks(&self, instance_id: i64) -> StorageResult<Vec<Check>>;

    /// Persist a state transition together with the new check state
    async fn record_transition(&self, change: &StateChange) -> StorageResult<()>;

    async fn notification_target(
        &self,
        instance_id: i64,
    ) -> StorageResult<Option<NotificationTarget>>;

    async fn metric_tables_config(&self) -> StorageResult<Vec<MetricTableConfig>>;

    /// Fold the not yet aggregated `_current` rows of one metric into the
    /// buckets of `level`
    async fn aggregate_data_single(
        &self,
        config: &MetricTableConfig,
        level: AggregateLevel,
    ) -> StorageResult<TableReport>;

    /// Move `_current` rows of one metric into its history table
    async fn archive_current_metrics(
        &self,
        config: &MetricTableConfig,
    ) -> StorageResult<TableReport>;

    /// Existing tables subject to the retention policy
    async fn purge_tables(&self) -> StorageResult<Vec<String>>;

    /// Delete rows older than `before` from one table
    async fn purge_table(&self, table: &str, before: DateTime<Utc>) -> StorageResult<TableReport>;

    async fn health_check(&self) -> StorageResult<HealthStatus>;

    async fn close(&self) -> StorageResult<()>;
}

impl CheckDefinition {
    pub fn new(name: &str, warning: f64, critical: f64, description: &str) -> Self {
        Self {
            name: name.to_string(),
            warning,
            critical,
            description: description.to_string(),
        }
    }
}

