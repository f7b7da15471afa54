//! Where workers send the tasks they create

use std::path::PathBuf;

use anyhow::{Result, anyhow};

use super::dispatch::SchedulerHandle;
use super::listener;
use super::task::{ReplyStatus, ScheduleOutcome, Task, TaskRequest};

/// Destination of follow-up tasks
#[derive(Debug, Clone)]
pub enum TaskSink {
    /// The scheduler of this process
    Local(SchedulerHandle),

    /// A scheduler reachable through its submission socket
    Socket(PathBuf),
}

impl TaskSink {
    pub async fn submit(&self, task: Task) -> Result<ScheduleOutcome> {
        match self {
            TaskSink::Local(handle) => Ok(handle.schedule(task).await?),
            TaskSink::Socket(path) => {
                let reply = listener::submit(path, &TaskRequest::from(&task)).await?;
                match reply.status {
                    ReplyStatus::Scheduled => Ok(ScheduleOutcome::Scheduled),
                    ReplyStatus::Duplicate => Ok(ScheduleOutcome::Duplicate),
                    ReplyStatus::Error => Err(anyhow!(
                        "submission of {} rejected: {}",
                        task.id,
                        reply.message.unwrap_or_default()
                    )),
                }
            }
        }
    }
}
