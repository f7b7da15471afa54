use std::path::PathBuf;

use anyhow::Context;
use tracing::trace;

/// Storage configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./fleetwatch.db")
}

/// Scheduler configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    /// How often the dispatch loop looks for due tasks, in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Unix socket accepting task submissions.
    ///
    /// When set, the collector fan-out hands its batches to the scheduler
    /// through this socket instead of the in-process handle.
    pub listener: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            listener: None,
        }
    }
}

fn default_tick_ms() -> u64 {
    500
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MonitoringConfig {
    /// Days of data to keep. `None` disables the purge.
    pub purge_after: Option<u32>,

    /// Seconds a single row ingest may take before it is reported as slow
    #[serde(default = "default_collect_max_duration")]
    pub collect_max_duration: u64,

    /// Maximum number of history rows requested per collection
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Timeout of every agent request, in seconds
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            purge_after: None,
            collect_max_duration: default_collect_max_duration(),
            history_limit: default_history_limit(),
            agent_timeout: default_agent_timeout(),
        }
    }
}

fn default_collect_max_duration() -> u64 {
    30
}

fn default_history_limit() -> usize {
    100
}

fn default_agent_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub login: Option<String>,
    pub password: Option<String>,
    pub from_addr: String,
}

fn default_smtp_port() -> u16 {
    25
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from: String,
    /// Base URL of the provider API, overridable for testing
    #[serde(default = "default_sms_api_url")]
    pub api_url: String,
}

fn default_sms_api_url() -> String {
    "https://api.twilio.com".to_string()
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NotificationsConfig {
    pub smtp: Option<SmtpConfig>,
    pub sms: Option<SmsConfig>,
}

/// An agent the hub pulls from
#[derive(Debug, Clone, serde::Deserialize)]
pub struct InstanceConfig {
    pub address: String,
    #[serde(default = "crate::util::get_default_agent_port")]
    pub port: u16,
    pub key: Option<String>,
    #[serde(default = "default_notify")]
    pub notify: bool,
    /// Role names notified about this instance
    #[serde(default)]
    pub subscribers: Vec<String>,
}

fn default_notify() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RoleConfig {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    #[serde(default)]
    pub roles: Vec<RoleConfig>,
}

impl Config {
    /// Apply environment overrides on top of the file contents
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(path) = crate::util::get_database_path() {
            self.storage.path = path;
        }
        if let Some(socket) = crate::util::get_socket_path() {
            self.scheduler.listener = Some(socket);
        }
        self
    }

    /// Reject values the hub cannot run with
    pub fn validate(self) -> anyhow::Result<Self> {
        anyhow::ensure!(
            self.scheduler.tick_ms > 0,
            "scheduler.tick_ms must be greater than 0"
        );
        Ok(self)
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    serde_json::from_str::<Config>(content)
        .context("Invalid configuration file provided!")
        .map(Config::with_env_overrides)
        .and_then(Config::validate)
        .inspect(|config| trace!("loaded config: {config:?}"))
}
