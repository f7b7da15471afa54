//! Integration tests for the collector pipeline against a mocked agent
//!
//! These tests verify that:
//! - the fetch cursor starts one second after the last stored row
//! - an invalid row is skipped without undoing the rows before it
//! - fetch and discovery failures leave the cursor untouched

use chrono::{DateTime, Utc};
use fleetwatch::agent::AGENT_KEY_HEADER;
use fleetwatch::notifications::Notifier;
use fleetwatch::storage::StorageBackend;
use fleetwatch::storage::schema::CollectorState;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn at(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap()
}

fn load(load1: f64) -> serde_json::Value {
    json!({"loadavg": [{"load1": load1, "load5": 0.1, "load15": 0.1}]})
}

#[tokio::test]
async fn test_incremental_collection() {
    let server = MockServer::start().await;
    mount_discover(&server).await;

    Mock::given(method("GET"))
        .and(path("/monitoring/history"))
        .and(query_param("start", "2024-01-01T00:00:11Z"))
        .and(query_param("limit", "100"))
        .and(header(AGENT_KEY_HEADER, "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            history_row("2024-01-01 00:00:11 +0000", load(0.2)),
            history_row("2024-01-01 00:00:12 +0000", load(0.3)),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/monitoring/history"))
        .and(query_param_is_missing("start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            history_row("2024-01-01 00:00:10 +0000", load(0.1)),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let (_dir, backend) = temp_backend().await;
    let pipeline = pipeline(backend.clone(), Notifier::disabled());
    let agent = endpoint_for(&server);

    // first contact: no lower bound
    let report = pipeline.collect(&agent).await.unwrap();
    assert_eq!(report.committed, 1);

    let identity = backend.find_instance(HOSTNAME, PG_PORT).await.unwrap().unwrap();
    let status = backend
        .collector_status(identity.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, CollectorState::Ok);
    assert_eq!(status.last_insert, Some(at("2024-01-01T00:00:10Z")));

    // second run resumes one second after the last row
    let report = pipeline.collect(&agent).await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.committed, 2);
    assert_eq!(report.skipped, 0);

    let status = backend
        .collector_status(identity.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, CollectorState::Ok);
    assert_eq!(status.last_insert, Some(at("2024-01-01T00:00:12Z")));
    assert_eq!(backend.count_rows("metric_loadavg_current").await.unwrap(), 3);

    // checks are created once with the instance
    let checks = backend.instance_checks(identity.instance_id).await.unwrap();
    let load1 = checks.iter().find(|c| c.name == "load1").unwrap();
    assert_eq!((load1.warning, load1.critical), (4.0, 8.0));
}

#[tokio::test]
async fn test_invalid_row_is_skipped_alone() {
    let server = MockServer::start().await;
    mount_discover(&server).await;

    Mock::given(method("GET"))
        .and(path("/monitoring/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            history_row("2024-01-01 00:00:10 +0000", load(0.1)),
            history_row("2024-01-01 00:00:11 +0000", load(0.2)),
            history_row(
                "2024-01-01 00:00:12 +0000",
                json!({"xacts": [{"dbname": "app", "n_commit": -1}]}),
            ),
        ])))
        .mount(&server)
        .await;

    let (_dir, backend) = temp_backend().await;
    let report = pipeline(backend.clone(), Notifier::disabled())
        .collect(&endpoint_for(&server))
        .await
        .unwrap();

    assert_eq!(report.committed, 2);
    assert_eq!(report.skipped, 1);

    // rows before the bad one are kept
    assert_eq!(backend.count_rows("metric_loadavg_current").await.unwrap(), 2);
    assert_eq!(backend.count_rows("metric_xacts_current").await.unwrap(), 0);

    let identity = backend.find_instance(HOSTNAME, PG_PORT).await.unwrap().unwrap();
    let status = backend
        .collector_status(identity.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, CollectorState::Fail);
    assert_eq!(status.last_insert, Some(at("2024-01-01T00:00:12Z")));
}

#[tokio::test]
async fn test_valid_row_after_invalid_one_restores_ok() {
    let server = MockServer::start().await;
    mount_discover(&server).await;

    Mock::given(method("GET"))
        .and(path("/monitoring/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            history_row("2024-01-01 00:00:10 +0000", load(0.1)),
            history_row("2024-01-01 00:00:11 +0000", json!({"memory": "garbage"})),
            history_row("2024-01-01 00:00:12 +0000", load(0.3)),
        ])))
        .mount(&server)
        .await;

    let (_dir, backend) = temp_backend().await;
    let report = pipeline(backend.clone(), Notifier::disabled())
        .collect(&endpoint_for(&server))
        .await
        .unwrap();

    assert_eq!((report.committed, report.skipped), (2, 1));

    let identity = backend.find_instance(HOSTNAME, PG_PORT).await.unwrap().unwrap();
    let status = backend
        .collector_status(identity.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, CollectorState::Ok);
    assert_eq!(status.last_insert, Some(at("2024-01-01T00:00:12Z")));
}

#[tokio::test]
async fn test_fetch_failure_keeps_cursor() {
    let server = MockServer::start().await;
    mount_discover(&server).await;

    Mock::given(method("GET"))
        .and(path("/monitoring/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            history_row("2024-01-01 00:00:10 +0000", load(0.1)),
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/monitoring/history"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (_dir, backend) = temp_backend().await;
    let pipeline = pipeline(backend.clone(), Notifier::disabled());
    let agent = endpoint_for(&server);

    pipeline.collect(&agent).await.unwrap();
    assert!(pipeline.collect(&agent).await.is_err());

    let identity = backend.find_instance(HOSTNAME, PG_PORT).await.unwrap().unwrap();
    let status = backend
        .collector_status(identity.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, CollectorState::Fail);
    assert_eq!(status.last_insert, Some(at("2024-01-01T00:00:10Z")));
}

#[tokio::test]
async fn test_discovery_failure_writes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/discover"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/monitoring/history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let (_dir, backend) = temp_backend().await;
    let result = pipeline(backend.clone(), Notifier::disabled())
        .collect(&endpoint_for(&server))
        .await;

    assert!(result.is_err());
    assert_eq!(backend.count_rows("collector_status").await.unwrap(), 0);
    assert_eq!(backend.count_rows("hosts").await.unwrap(), 0);
}
