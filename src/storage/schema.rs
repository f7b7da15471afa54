//! Records read from and written to the monitoring database
//!
//! ## Metric rows
//!
//! Agents return their history as loosely typed JSON. [`MetricRow::from_value`]
//! checks the row envelope (datetime, host and instance blocks) and
//! [`MetricRow::validate_records`] checks the records of the probes that are
//! actually stored (lists of objects, no negative counters). Both report
//! [`StorageError::InvalidData`] so the collector can skip exactly that row.
//! Probes without a metric table are kept as sent.
//!
//! Each probe keeps its records as JSON in `metric_<probe>_current`. Only the
//! alert preprocessing and the maintenance aggregation look inside them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StorageError;

/// Datetime format used by the agents
pub const AGENT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// Parse a datetime as sent by an agent.
///
/// The agent format (`2024-01-01 00:00:11 +0000`) is tried first, then RFC 3339.
pub fn parse_agent_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, AGENT_DATETIME_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Host description embedded in every history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default)]
    pub cpu_arch: Option<String>,
    #[serde(default)]
    pub memory_size: Option<u64>,
}

/// Instance description embedded in every history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub port: u16,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub data_directory: Option<String>,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub max_connections: Option<u64>,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawRow {
    datetime: String,
    hostinfo: HostInfo,
    instances: Vec<InstanceInfo>,
    data: serde_json::Map<String, serde_json::Value>,
}

/// One validated unit of agent history
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub datetime: DateTime<Utc>,
    pub hostinfo: HostInfo,
    pub instance: InstanceInfo,
    /// Probe name → list of records
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl MetricRow {
    /// Validate a raw history row
    pub fn from_value(value: &serde_json::Value) -> Result<Self, StorageError> {
        let raw: RawRow = serde_json::from_value(value.clone())
            .map_err(|e| StorageError::InvalidData(format!("malformed row: {}", e)))?;

        let datetime = parse_agent_datetime(&raw.datetime).ok_or_else(|| {
            StorageError::InvalidData(format!("unparseable datetime {:?}", raw.datetime))
        })?;

        let instance = raw
            .instances
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::InvalidData("row has no instance".to_string()))?;

        let mut data = raw.data;

        // session usage needs the connection limit next to the session counts
        if let Some(max_connections) = instance.max_connections {
            data.insert(
                "max_connections".to_string(),
                serde_json::Value::from(max_connections),
            );
        }

        Ok(Self {
            datetime,
            hostinfo: raw.hostinfo,
            instance,
            data,
        })
    }

    /// Best-effort datetime of a row that failed validation
    pub fn raw_datetime(value: &serde_json::Value) -> Option<DateTime<Utc>> {
        value
            .get("datetime")
            .and_then(|dt| dt.as_str())
            .and_then(parse_agent_datetime)
    }

    /// Check the records of every probe that has a metric table
    pub fn validate_records(&self, configs: &[MetricTableConfig]) -> Result<(), StorageError> {
        for config in configs {
            if let Some(records) = self.data.get(&config.name) {
                validate_records(&config.name, records)?;
            }
        }
        Ok(())
    }

    /// Records of one probe, empty if the probe is absent
    pub fn records(&self, probe: &str) -> &[serde_json::Value] {
        self.data
            .get(probe)
            .and_then(|records| records.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn validate_records(probe: &str, records: &serde_json::Value) -> Result<(), StorageError> {
    let records = records.as_array().ok_or_else(|| {
        StorageError::InvalidData(format!("probe {probe} does not hold a list of records"))
    })?;

    for record in records {
        let fields = record.as_object().ok_or_else(|| {
            StorageError::InvalidData(format!("probe {probe} holds a non-object record"))
        })?;

        for (field, value) in fields {
            if let Some(number) = value.as_f64()
                && (number < 0.0 || !number.is_finite())
            {
                return Err(StorageError::InvalidData(format!(
                    "{probe}.{field} is out of range: {number}"
                )));
            }
        }
    }

    Ok(())
}

/// Identity of a monitored instance in the monitoring inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub host_id: i64,
    pub instance_id: i64,
}

/// Outcome of the last collection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CollectorState {
    Ok,
    Fail,
}

impl CollectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorState::Ok => "OK",
            CollectorState::Fail => "FAIL",
        }
    }
}

impl FromStr for CollectorState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(CollectorState::Ok),
            "FAIL" => Ok(CollectorState::Fail),
            other => Err(StorageError::SerializationError(format!(
                "unknown collector status {other:?}"
            ))),
        }
    }
}

/// Row of `collector_status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorStatus {
    pub instance_id: i64,
    pub status: CollectorState,
    pub last_pull: DateTime<Utc>,
    pub last_insert: Option<DateTime<Utc>>,
}

/// State of an alerting check
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckState {
    Ok,
    Warning,
    Critical,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckState::Ok => "OK",
            CheckState::Warning => "WARNING",
            CheckState::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(CheckState::Ok),
            "WARNING" => Ok(CheckState::Warning),
            "CRITICAL" => Ok(CheckState::Critical),
            other => Err(StorageError::SerializationError(format!(
                "unknown check state {other:?}"
            ))),
        }
    }
}

/// Alerting check bound to an instance
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub check_id: i64,
    pub instance_id: i64,
    pub name: String,
    pub enabled: bool,
    pub warning: f64,
    pub critical: f64,
    pub description: String,
    pub state: CheckState,
}

/// Audit record of a check state transition
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub check_id: i64,
    pub old_state: CheckState,
    pub new_state: CheckState,
    pub at: DateTime<Utc>,
    pub key: Option<String>,
    pub value: f64,
}

impl StateChange {
    /// Transition of `check` from its current state to `new_state`
    pub fn for_check(
        check: &Check,
        new_state: CheckState,
        at: DateTime<Utc>,
        key: Option<String>,
        value: f64,
    ) -> Self {
        Self {
            check_id: check.check_id,
            old_state: check.state,
            new_state,
            at,
            key,
            value,
        }
    }
}

/// Resolution of an aggregated metric table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateLevel {
    HalfHour,
    SixHours,
}

impl AggregateLevel {
    pub const ALL: [AggregateLevel; 2] = [AggregateLevel::HalfHour, AggregateLevel::SixHours];

    pub fn suffix(&self) -> &'static str {
        match self {
            AggregateLevel::HalfHour => "30m",
            AggregateLevel::SixHours => "6h",
        }
    }

    /// Width of one bucket
    pub fn bucket_millis(&self) -> i64 {
        match self {
            AggregateLevel::HalfHour => 30 * 60 * 1000,
            AggregateLevel::SixHours => 6 * 60 * 60 * 1000,
        }
    }
}

/// Entry of `metric_tables`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricTableConfig {
    pub name: String,
    pub record_type: String,
    /// Record field distinguishing series of the same instance (cpu, mount point, database)
    pub key_field: Option<String>,
}

impl MetricTableConfig {
    pub fn current_table(&self) -> String {
        format!("metric_{}_current", self.name)
    }

    pub fn aggregate_table(&self, level: AggregateLevel) -> String {
        format!("metric_{}_{}_current", self.name, level.suffix())
    }

    pub fn history_table(&self) -> String {
        format!("metric_{}_history", self.name)
    }

    /// Key of a record, empty when the metric has no key field
    pub fn record_key(&self, record: &serde_json::Value) -> String {
        self.key_field
            .as_deref()
            .and_then(|field| record.get(field))
            .map(|key| match key {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    }
}

/// Result of one per-table maintenance step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    pub rows: u64,
}

/// Someone to notify about an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub role_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Everything needed to notify about one monitored instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTarget {
    pub hostname: String,
    pub port: u16,
    pub agent_address: Option<String>,
    pub agent_port: Option<u16>,
    pub notify: bool,
    pub recipients: Vec<Recipient>,
}
