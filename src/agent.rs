//! HTTP client for the per-host agents
//!
//! The hub only consumes two endpoints:
//!
//! - `GET /discover` returns the host name and the port of the monitored instance
//! - `GET /monitoring/history?limit=N&start=YYYY-MM-DDTHH:MM:SSZ` returns the
//!   collected history, oldest first
//!
//! Connection failures (including timeouts), non-2xx responses and bodies that
//! cannot be decoded are reported as distinct [`AgentError`] kinds.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

/// Header carrying the agent key
pub const AGENT_KEY_HEADER: &str = "X-Agent-Key";

/// Format of the `start` query parameter
pub const START_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Address of an agent, as listed in the application inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub key: Option<String>,
}

impl AgentEndpoint {
    pub fn new(address: impl Into<String>, port: u16, key: Option<String>) -> Self {
        Self {
            address: address.into(),
            port,
            key,
        }
    }

    /// Identifier used in logs and task ids (format: "address:port")
    pub fn id(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// Response of `GET /discover`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Discovery {
    pub hostname: String,
    pub pg_port: u16,
}

/// Errors raised while talking to an agent
#[derive(Debug)]
pub enum AgentError {
    /// The agent could not be reached or did not answer in time
    Connection(reqwest::Error),

    /// The agent answered with a non-2xx status
    Status(reqwest::StatusCode),

    /// The body could not be decoded
    Decode(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Connection(err) => write!(f, "agent unreachable: {}", err),
            AgentError::Status(status) => write!(f, "agent answered with HTTP {}", status),
            AgentError::Decode(msg) => write!(f, "invalid agent response: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Connection(err) => Some(err),
            _ => None,
        }
    }
}

/// Client shared by all collector runs
///
/// The underlying `reqwest::Client` keeps a connection pool, so one instance
/// is built at start-up and cloned into the pipeline.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AgentError::Connection)?;

        Ok(Self { client })
    }

    #[instrument(skip(self, agent), fields(agent = %agent.id()))]
    pub async fn discover(&self, agent: &AgentEndpoint) -> Result<Discovery, AgentError> {
        let url = format!("{}/discover", agent.base_url());
        let body = self.get(agent, &url, &[]).await?;

        serde_json::from_str(&body).map_err(|e| AgentError::Decode(e.to_string()))
    }

    /// Fetch the history rows collected after `start` (inclusive)
    ///
    /// Rows are returned as raw JSON values so a single malformed row can be
    /// skipped without discarding the rest of the page.
    #[instrument(skip(self, agent), fields(agent = %agent.id()))]
    pub async fn history(
        &self,
        agent: &AgentEndpoint,
        start: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, AgentError> {
        let url = format!("{}/monitoring/history", agent.base_url());

        let mut query = vec![("limit", limit.to_string())];
        if let Some(start) = start {
            query.push(("start", start.format(START_FORMAT).to_string()));
        }

        let body = self.get(agent, &url, &query).await?;

        serde_json::from_str(&body).map_err(|e| AgentError::Decode(e.to_string()))
    }

    async fn get(
        &self,
        agent: &AgentEndpoint,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, AgentError> {
        trace!("requesting {url}");

        let mut request = self.client.get(url).query(query);
        if let Some(key) = &agent.key {
            request = request.header(AGENT_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(AgentError::Connection)?;

        if !response.status().is_success() {
            return Err(AgentError::Status(response.status()));
        }

        response.text().await.map_err(AgentError::Connection)
    }
}
