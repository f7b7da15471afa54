//! Integration tests for the scheduler
//!
//! These tests verify that:
//! - re-submitted ids are suppressed while pending or running
//! - a worker never runs more executions than its pool size
//! - periodic tasks survive handler errors and panics
//! - removed tasks and unregistered workers stop firing

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fleetwatch::scheduler::{
    ScheduleOutcome, Scheduler, SchedulerHandle, Task, TaskState, WorkerKind, WorkerRegistry,
    worker_fn,
};
use tokio::sync::Notify;

use crate::helpers::wait_until;

const TICK: Duration = Duration::from_millis(10);

fn start(registry: WorkerRegistry) -> SchedulerHandle {
    let (handle, command_rx) = SchedulerHandle::channel();
    Scheduler::spawn(registry, command_rx, TICK);
    handle
}

#[tokio::test]
async fn test_duplicate_ids_are_suppressed_while_running() {
    let release = Arc::new(Notify::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let mut registry = WorkerRegistry::new();
    {
        let release = release.clone();
        let runs = runs.clone();
        registry
            .register(
                WorkerKind::Collector,
                20,
                worker_fn(move |_| {
                    let release = release.clone();
                    let runs = runs.clone();
                    async move {
                        release.notified().await;
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }
    let handle = start(registry);

    let task = Task::once(WorkerKind::Collector, "collector:db1:2345");
    assert_eq!(
        handle.schedule(task.clone()).await.unwrap(),
        ScheduleOutcome::Scheduled
    );

    // wait for the execution to start, then submit the same id again
    let snapshot_handle = handle.clone();
    loop {
        let snapshot = snapshot_handle.snapshot().await.unwrap();
        if snapshot.first().map(|s| s.state) == Some(TaskState::Running) {
            break;
        }
        tokio::time::sleep(TICK).await;
    }
    assert_eq!(
        handle.schedule(task.clone()).await.unwrap(),
        ScheduleOutcome::Duplicate
    );

    release.notify_one();
    wait_until(|| runs.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(TICK * 3).await;

    // the one-shot task is gone, the id can be used again
    assert_eq!(
        handle.schedule(task).await.unwrap(),
        ScheduleOutcome::Scheduled
    );
    release.notify_one();
    wait_until(|| runs.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn test_pool_size_bounds_concurrency() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let mut registry = WorkerRegistry::new();
    {
        let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
        registry
            .register(
                WorkerKind::Collector,
                2,
                worker_fn(move |_| {
                    let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }
    let handle = start(registry);

    for i in 0..6 {
        let outcome = handle
            .schedule(Task::once(WorkerKind::Collector, format!("collector:{i}")))
            .await
            .unwrap();
        assert_eq!(outcome, ScheduleOutcome::Scheduled);
    }

    wait_until(|| done.load(Ordering::SeqCst) == 6).await;
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_periodic_task_survives_errors_and_panics() {
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = WorkerRegistry::new();
    {
        let calls = calls.clone();
        registry
            .register(
                WorkerKind::ScheduleCollector,
                1,
                worker_fn(move |_| {
                    let calls = calls.clone();
                    async move {
                        match calls.fetch_add(1, Ordering::SeqCst) {
                            0 => anyhow::bail!("agent list unavailable"),
                            1 => panic!("handler bug"),
                            _ => Ok(()),
                        }
                    }
                }),
            )
            .unwrap();
    }
    let handle = start(registry);

    handle
        .schedule(Task::periodic(
            WorkerKind::ScheduleCollector,
            "schedule_collector",
            Duration::from_millis(20),
        ))
        .await
        .unwrap();

    wait_until(|| calls.load(Ordering::SeqCst) >= 4).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "schedule_collector");
    assert!(snapshot[0].runs >= 3);
}

#[tokio::test]
async fn test_removed_task_stops_firing() {
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registry = WorkerRegistry::new();
    {
        let calls = calls.clone();
        registry
            .register(
                WorkerKind::AggregateData,
                1,
                worker_fn(move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }
    let handle = start(registry);

    handle
        .schedule(Task::periodic(
            WorkerKind::AggregateData,
            "aggregate_data",
            Duration::from_millis(20),
        ))
        .await
        .unwrap();
    wait_until(|| calls.load(Ordering::SeqCst) >= 2).await;

    assert!(handle.remove("aggregate_data").await.unwrap());
    tokio::time::sleep(TICK * 5).await;
    let after_removal = calls.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_removal);
    assert!(handle.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unregistered_worker_rejects_new_tasks() {
    let mut registry = WorkerRegistry::new();
    registry
        .register(WorkerKind::PurgeData, 1, worker_fn(|_| async { Ok(()) }))
        .unwrap();
    let handle = start(registry);

    assert!(handle.unregister(WorkerKind::PurgeData).await.unwrap());
    assert!(!handle.unregister(WorkerKind::PurgeData).await.unwrap());
    assert!(
        handle
            .schedule(Task::once(WorkerKind::PurgeData, "purge_data"))
            .await
            .is_err()
    );
}
