//! Helper functions for integration tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetwatch::agent::{AgentClient, AgentEndpoint};
use fleetwatch::alerting::AlertEvaluator;
use fleetwatch::collector::CollectorPipeline;
use fleetwatch::notifications::{EmailMessage, EmailTransport, Notifier};
use fleetwatch::storage::sqlite::SqliteBackend;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const HOSTNAME: &str = "db1.example.com";
pub const PG_PORT: u16 = 5432;

pub async fn temp_backend() -> (TempDir, Arc<SqliteBackend>) {
    let dir = tempfile::tempdir().unwrap();
    let backend = SqliteBackend::new(dir.path().join("fleetwatch.db"))
        .await
        .unwrap();
    (dir, Arc::new(backend))
}

pub fn endpoint_for(server: &MockServer) -> AgentEndpoint {
    let url = url::Url::parse(&server.uri()).unwrap();
    AgentEndpoint::new(
        url.host_str().unwrap(),
        url.port().unwrap(),
        Some("test-key".to_string()),
    )
}

/// History row as an agent returns it
pub fn history_row(datetime: &str, data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "datetime": datetime,
        "hostinfo": {
            "hostname": HOSTNAME,
            "os": "Linux",
            "os_version": "6.1",
            "cpu_count": 2,
            "cpu_arch": "x86_64",
            "memory_size": 8_000_000_000u64,
        },
        "instances": [{
            "port": PG_PORT,
            "version": "16.2",
            "data_directory": "/var/lib/postgresql/16/main",
            "available": true,
            "max_connections": 100,
        }],
        "data": data,
    })
}

pub async fn mount_discover(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/discover"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "hostname": HOSTNAME,
            "pg_port": PG_PORT,
        })))
        .mount(server)
        .await;
}

pub fn pipeline(storage: Arc<SqliteBackend>, notifier: Notifier) -> CollectorPipeline {
    let evaluator = Arc::new(AlertEvaluator::new(storage.clone(), notifier));
    CollectorPipeline::new(
        storage,
        AgentClient::new(Duration::from_secs(5)).unwrap(),
        evaluator,
        100,
        Duration::from_secs(30),
    )
}

/// Email transport keeping what it was asked to send
#[derive(Default)]
pub struct RecordingEmail {
    pub sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl EmailTransport for RecordingEmail {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
