//! Integration tests for collector fan-out through a running scheduler
//!
//! These tests verify that:
//! - the agent list is cut into batches of fixed size
//! - batches and collectors still queued are not submitted twice

use std::sync::{Arc, Mutex};

use fleetwatch::agent::AgentEndpoint;
use fleetwatch::collector::{BATCH_SIZE, BatchOptions, CollectorFanout};
use fleetwatch::config::InstanceConfig;
use fleetwatch::scheduler::{Scheduler, SchedulerHandle, TaskSink, WorkerKind, WorkerRegistry, worker_fn};
use fleetwatch::storage::StorageBackend;
use pretty_assertions::assert_eq;
use tokio::sync::Semaphore;

use crate::helpers::*;

type Seen = Vec<(WorkerKind, serde_json::Value)>;

/// Registry whose workers record their options and wait for `gate`
fn gated_registry(gate: Arc<Semaphore>, seen: Arc<Mutex<Seen>>) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    for kind in [WorkerKind::CollectorBatch, WorkerKind::Collector] {
        let gate = gate.clone();
        let seen = seen.clone();
        registry
            .register(
                kind,
                4,
                worker_fn(move |options| {
                    let gate = gate.clone();
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push((kind, options));
                        gate.acquire().await?.forget();
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }
    registry
}

fn start(registry: WorkerRegistry) -> SchedulerHandle {
    let (handle, command_rx) = SchedulerHandle::channel();
    Scheduler::spawn(registry, command_rx, std::time::Duration::from_millis(10));
    handle
}

async fn wait_until_idle(handle: &SchedulerHandle) {
    for _ in 0..300 {
        if handle.snapshot().await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("scheduler still busy");
}

fn agents(count: usize) -> Vec<AgentEndpoint> {
    (0..count)
        .map(|i| AgentEndpoint::new(format!("10.0.0.{}", i + 1), 2345, None))
        .collect()
}

#[tokio::test]
async fn test_agents_are_cut_into_batches() {
    let gate = Arc::new(Semaphore::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = start(gated_registry(gate.clone(), seen.clone()));

    let (_dir, backend) = temp_backend().await;
    let instances: Vec<InstanceConfig> = agents(BATCH_SIZE + 1)
        .into_iter()
        .map(|agent| InstanceConfig {
            address: agent.address,
            port: agent.port,
            key: None,
            notify: true,
            subscribers: Vec::new(),
        })
        .collect();
    backend.sync_inventory(&instances, &[]).await.unwrap();

    let fanout = CollectorFanout::new(backend.clone(), TaskSink::Local(handle.clone()));

    let report = fanout.schedule_collector().await.unwrap();
    assert_eq!((report.scheduled, report.duplicates), (2, 0));

    // both batches are still held by the gate
    let report = fanout.schedule_collector().await.unwrap();
    assert_eq!((report.scheduled, report.duplicates), (0, 2));

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    let mut sizes: Vec<usize> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|(kind, options)| {
            assert_eq!(*kind, WorkerKind::CollectorBatch);
            serde_json::from_value::<BatchOptions>(options.clone())
                .unwrap()
                .agents
                .len()
        })
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec![1, BATCH_SIZE]);

    gate.add_permits(2);
    wait_until_idle(&handle).await;
}

#[tokio::test]
async fn test_batch_submits_one_collector_per_agent() {
    let gate = Arc::new(Semaphore::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = start(gated_registry(gate.clone(), seen.clone()));

    let (_dir, backend) = temp_backend().await;
    let fanout = CollectorFanout::new(backend, TaskSink::Local(handle.clone()));
    let options = serde_json::json!({ "agents": agents(3) });

    let report = fanout.collector_batch(options.clone()).await.unwrap();
    assert_eq!((report.scheduled, report.duplicates), (3, 0));

    let report = fanout.collector_batch(options).await.unwrap();
    assert_eq!((report.scheduled, report.duplicates), (0, 3));

    wait_until(|| seen.lock().unwrap().len() == 3).await;
    let mut addresses: Vec<String> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|(kind, options)| {
            assert_eq!(*kind, WorkerKind::Collector);
            serde_json::from_value::<AgentEndpoint>(options.clone())
                .unwrap()
                .address
        })
        .collect();
    addresses.sort();
    assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

    // once released the ids are free again
    gate.add_permits(3);
    wait_until_idle(&handle).await;
    let report = fanout
        .collector_batch(serde_json::json!({ "agents": agents(1) }))
        .await
        .unwrap();
    assert_eq!(report.scheduled, 1);
    gate.add_permits(1);
}

#[tokio::test]
async fn test_invalid_batch_options_are_rejected() {
    let (_dir, backend) = temp_backend().await;
    let (handle, _command_rx) = SchedulerHandle::channel();
    let fanout = CollectorFanout::new(backend, TaskSink::Local(handle));

    assert!(
        fanout
            .collector_batch(serde_json::json!({"agents": "none"}))
            .await
            .is_err()
    );
}
