//! Integration tests for task submission over the Unix socket
//!
//! These tests verify that:
//! - submissions reach the scheduler and get its de-duplication
//! - unknown workers and malformed lines get an error reply
//! - a stale socket file does not prevent binding

use std::sync::Arc;
use std::time::Duration;

use fleetwatch::scheduler::listener;
use fleetwatch::scheduler::{
    ReplyStatus, ScheduleOutcome, Scheduler, SchedulerHandle, SubmissionListener, Task, TaskReply,
    TaskRequest, TaskSink, WorkerKind, WorkerRegistry, worker_fn,
};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Semaphore;

struct Hub {
    _dir: tempfile::TempDir,
    socket: std::path::PathBuf,
    gate: Arc<Semaphore>,
}

/// Scheduler with a gated collector worker behind a bound socket
async fn hub() -> Hub {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("fleetwatch.sock");
    let gate = Arc::new(Semaphore::new(0));

    let mut registry = WorkerRegistry::new();
    {
        let gate = gate.clone();
        registry
            .register(
                WorkerKind::Collector,
                2,
                worker_fn(move |_| {
                    let gate = gate.clone();
                    async move {
                        gate.acquire().await?.forget();
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }

    let (handle, command_rx) = SchedulerHandle::channel();
    Scheduler::spawn(registry, command_rx, Duration::from_millis(10));

    let listener = SubmissionListener::bind(&socket).await.unwrap();
    assert_eq!(listener.path(), socket.as_path());
    tokio::spawn(listener.run(handle));

    Hub {
        _dir: dir,
        socket,
        gate,
    }
}

fn request(worker_name: &str, id: &str) -> TaskRequest {
    TaskRequest {
        worker_name: worker_name.to_string(),
        id: id.to_string(),
        options: serde_json::json!({"address": "10.0.0.1", "port": 2345}),
        expire: 0,
    }
}

#[tokio::test]
async fn test_submission_round_trip() {
    let hub = hub().await;

    let submission = request("collector", "collector:10.0.0.1:2345");

    let reply = listener::submit(&hub.socket, &submission).await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Scheduled);

    let reply = listener::submit(&hub.socket, &submission).await.unwrap();
    assert_eq!(reply.status, ReplyStatus::Duplicate);

    hub.gate.add_permits(1);
}

#[tokio::test]
async fn test_unknown_worker_is_rejected() {
    let hub = hub().await;

    let reply = listener::submit(&hub.socket, &request("vacuum", "vacuum:1"))
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);
    assert!(reply.message.unwrap().contains("vacuum"));
}

#[tokio::test]
async fn test_unregistered_worker_is_rejected() {
    let hub = hub().await;

    // known name, but this scheduler has no pool for it
    let reply = listener::submit(&hub.socket, &request("purge_data", "purge_data"))
        .await
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);
}

#[tokio::test]
async fn test_connection_carries_several_lines() {
    let hub = hub().await;

    let stream = UnixStream::connect(&hub.socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"this is not json\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    let reply: TaskReply = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply.status, ReplyStatus::Error);
    assert!(reply.message.unwrap().starts_with("malformed request"));

    let mut line = serde_json::to_vec(&request("collector", "collector:10.0.0.2:2345")).unwrap();
    line.push(b'\n');
    writer.write_all(&line).await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    let reply: TaskReply = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply.status, ReplyStatus::Scheduled);

    hub.gate.add_permits(1);
}

#[tokio::test]
async fn test_socket_sink() {
    let hub = hub().await;
    let sink = TaskSink::Socket(hub.socket.clone());

    let task = Task::once(WorkerKind::Collector, "collector:10.0.0.3:2345");
    assert_eq!(
        sink.submit(task.clone()).await.unwrap(),
        ScheduleOutcome::Scheduled
    );
    assert_eq!(
        sink.submit(task.clone()).await.unwrap(),
        ScheduleOutcome::Duplicate
    );

    // unregistered worker comes back as an error
    assert!(
        sink.submit(Task::once(WorkerKind::PurgeData, "purge_data"))
            .await
            .is_err()
    );

    // the id is free again once the execution completed
    hub.gate.add_permits(1);
    let mut outcome = ScheduleOutcome::Duplicate;
    for _ in 0..100 {
        outcome = sink.submit(task.clone()).await.unwrap();
        if outcome == ScheduleOutcome::Scheduled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(outcome, ScheduleOutcome::Scheduled);
    hub.gate.add_permits(1);
}

#[tokio::test]
async fn test_missing_socket_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let sink = TaskSink::Socket(dir.path().join("absent.sock"));

    assert!(
        sink.submit(Task::once(WorkerKind::Collector, "collector:x"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("fleetwatch.sock");
    std::fs::write(&socket, b"left over").unwrap();

    let listener = SubmissionListener::bind(&socket).await.unwrap();
    let (handle, _command_rx) = SchedulerHandle::channel();
    tokio::spawn(listener.run(handle));

    assert!(UnixStream::connect(&socket).await.is_ok());
}
