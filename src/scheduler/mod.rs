//! Process-local task scheduler
//!
//! ## Components
//!
//! - **WorkerRegistry**: handler and bounded pool per [`WorkerKind`]
//! - **Scheduler**: single task owning the task table, started through
//!   [`Scheduler::spawn`] and driven through a [`SchedulerHandle`]
//! - **SubmissionListener**: Unix socket feeding the same handle
//!
//! ## Guarantees
//!
//! - a task id that is pending or running is never queued twice
//! - a worker never runs more executions than its pool size
//! - errors and panics of a handler are logged and a periodic task keeps firing

pub mod dispatch;
pub mod error;
pub mod listener;
pub mod sink;
pub mod task;
pub mod worker;

pub use dispatch::{Scheduler, SchedulerHandle, TaskSnapshot, TaskState};
pub use error::SchedulerError;
pub use listener::SubmissionListener;
pub use sink::TaskSink;
pub use task::{ReplyStatus, ScheduleOutcome, Task, TaskReply, TaskRequest};
pub use worker::{Worker, WorkerKind, WorkerRegistry, worker_fn};
