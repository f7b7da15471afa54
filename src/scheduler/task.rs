//! Task entries and their wire format

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SchedulerError;
use super::worker::WorkerKind;

/// A unit of work for one worker
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub worker: WorkerKind,
    /// Unique id of the logical job, used for de-duplication
    pub id: String,
    pub options: serde_json::Value,
    /// Re-enqueue delay after each run; `None` runs the task once
    pub redo_interval: Option<Duration>,
    /// Drop the task if it was not dispatched before this instant
    pub expire: Option<DateTime<Utc>>,
}

impl Task {
    /// One-shot task without options
    pub fn once(worker: WorkerKind, id: impl Into<String>) -> Self {
        Self {
            worker,
            id: id.into(),
            options: serde_json::Value::Null,
            redo_interval: None,
            expire: None,
        }
    }

    /// Task re-run every `interval` after it completes
    pub fn periodic(worker: WorkerKind, id: impl Into<String>, interval: Duration) -> Self {
        Self {
            redo_interval: Some(interval).filter(|interval| !interval.is_zero()),
            ..Self::once(worker, id)
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn expires_at(mut self, expire: DateTime<Utc>) -> Self {
        self.expire = Some(expire);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire.is_some_and(|expire| expire <= now)
    }
}

/// Result of submitting a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    /// A task with the same id is already pending or running
    Duplicate,
}

/// Task submission as sent over the listener socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub worker_name: String,
    pub id: String,
    #[serde(default)]
    pub options: serde_json::Value,
    /// UNIX timestamp in seconds, 0 means never
    #[serde(default)]
    pub expire: i64,
}

impl TaskRequest {
    /// Resolve the worker name and build a one-shot task
    pub fn into_task(self) -> Result<Task, SchedulerError> {
        let worker = self.worker_name.parse()?;
        let mut task = Task::once(worker, self.id).with_options(self.options);
        if self.expire > 0 {
            task.expire = DateTime::from_timestamp(self.expire, 0);
        }
        Ok(task)
    }
}

impl From<&Task> for TaskRequest {
    fn from(task: &Task) -> Self {
        Self {
            worker_name: task.worker.as_str().to_string(),
            id: task.id.clone(),
            options: task.options.clone(),
            expire: task.expire.map(|expire| expire.timestamp()).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Scheduled,
    Duplicate,
    Error,
}

/// Reply written back for every submission line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskReply {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: Some(message.into()),
        }
    }
}

impl From<ScheduleOutcome> for TaskReply {
    fn from(outcome: ScheduleOutcome) -> Self {
        let status = match outcome {
            ScheduleOutcome::Scheduled => ReplyStatus::Scheduled,
            ScheduleOutcome::Duplicate => ReplyStatus::Duplicate,
        };
        Self {
            status,
            message: None,
        }
    }
}
