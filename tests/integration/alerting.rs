//! Integration tests for check transitions raised during collection
//!
//! These tests verify that:
//! - a threshold crossing is recorded and notified once
//! - staying in the same state produces nothing
//! - instances with notifications disabled are never notified

use std::sync::Arc;

use fleetwatch::agent::AgentEndpoint;
use fleetwatch::config::{InstanceConfig, RoleConfig};
use fleetwatch::notifications::{EmailTransport, Notifier};
use fleetwatch::storage::StorageBackend;
use fleetwatch::storage::schema::CheckState;
use fleetwatch::storage::sqlite::SqliteBackend;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn sync_inventory(backend: &SqliteBackend, agent: &AgentEndpoint, notify: bool) {
    let instances = vec![InstanceConfig {
        address: agent.address.clone(),
        port: agent.port,
        key: agent.key.clone(),
        notify,
        subscribers: vec!["dba".to_string()],
    }];
    let roles = vec![RoleConfig {
        name: "dba".to_string(),
        email: Some("dba@example.com".to_string()),
        phone: None,
    }];
    backend.sync_inventory(&instances, &roles).await.unwrap();
}

async fn mount_history(server: &MockServer, loads: &[(&str, f64)]) {
    let rows: Vec<_> = loads
        .iter()
        .map(|(datetime, load1)| {
            history_row(
                datetime,
                json!({"loadavg": [{"load1": load1, "load5": 1.0, "load15": 1.0}]}),
            )
        })
        .collect();

    Mock::given(method("GET"))
        .and(path("/monitoring/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_transitions_are_recorded_and_notified() {
    let server = MockServer::start().await;
    mount_discover(&server).await;
    // thresholds are 4 and 8 with two cpus
    mount_history(
        &server,
        &[
            ("2024-01-01 00:00:10 +0000", 50.0),
            ("2024-01-01 00:00:11 +0000", 60.0),
            ("2024-01-01 00:00:12 +0000", 5.0),
        ],
    )
    .await;

    let (_dir, backend) = temp_backend().await;
    let agent = endpoint_for(&server);
    sync_inventory(&backend, &agent, true).await;

    let email = Arc::new(RecordingEmail::default());
    let notifier = Notifier::new(Some(email.clone() as Arc<dyn EmailTransport>), None);

    let report = pipeline(backend.clone(), notifier)
        .collect(&agent)
        .await
        .unwrap();

    // OK → CRITICAL, CRITICAL stays, CRITICAL → WARNING
    assert_eq!(report.transitions, 2);
    assert_eq!(backend.count_rows("state_changes").await.unwrap(), 2);

    let identity = backend.find_instance(HOSTNAME, PG_PORT).await.unwrap().unwrap();
    let checks = backend.instance_checks(identity.instance_id).await.unwrap();
    let load1 = checks.iter().find(|c| c.name == "load1").unwrap();
    assert_eq!(load1.state, CheckState::Warning);

    let sent = email.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].recipients, vec!["dba@example.com".to_string()]);
    assert_eq!(
        sent[0].subject,
        format!("[fleetwatch] CRITICAL {HOSTNAME} - Loadaverage")
    );
    assert_eq!(
        sent[1].subject,
        format!("[fleetwatch] WARNING {HOSTNAME} - Loadaverage")
    );
}

#[tokio::test]
async fn test_transitions_without_transport_are_still_recorded() {
    let server = MockServer::start().await;
    mount_discover(&server).await;
    mount_history(&server, &[("2024-01-01 00:00:10 +0000", 50.0)]).await;

    let (_dir, backend) = temp_backend().await;
    let agent = endpoint_for(&server);
    sync_inventory(&backend, &agent, true).await;

    let report = pipeline(backend.clone(), Notifier::disabled())
        .collect(&agent)
        .await
        .unwrap();

    assert_eq!(report.transitions, 1);
    assert_eq!(backend.count_rows("state_changes").await.unwrap(), 1);
}

#[tokio::test]
async fn test_notify_disabled_instance_is_silent() {
    let server = MockServer::start().await;
    mount_discover(&server).await;
    mount_history(&server, &[("2024-01-01 00:00:10 +0000", 50.0)]).await;

    let (_dir, backend) = temp_backend().await;
    let agent = endpoint_for(&server);
    sync_inventory(&backend, &agent, false).await;

    let email = Arc::new(RecordingEmail::default());
    let notifier = Notifier::new(Some(email.clone() as Arc<dyn EmailTransport>), None);

    let report = pipeline(backend.clone(), notifier)
        .collect(&agent)
        .await
        .unwrap();

    assert_eq!(report.transitions, 1);
    assert!(email.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_quiet_rows_raise_nothing() {
    let server = MockServer::start().await;
    mount_discover(&server).await;
    mount_history(
        &server,
        &[
            ("2024-01-01 00:00:10 +0000", 0.5),
            ("2024-01-01 00:00:11 +0000", 1.5),
        ],
    )
    .await;

    let (_dir, backend) = temp_backend().await;
    let agent = endpoint_for(&server);
    sync_inventory(&backend, &agent, true).await;

    let email = Arc::new(RecordingEmail::default());
    let notifier = Notifier::new(Some(email.clone() as Arc<dyn EmailTransport>), None);

    let report = pipeline(backend.clone(), notifier)
        .collect(&agent)
        .await
        .unwrap();

    assert_eq!(report.transitions, 0);
    assert_eq!(backend.count_rows("state_changes").await.unwrap(), 0);
    assert!(email.sent.lock().unwrap().is_empty());
}
