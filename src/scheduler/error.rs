//! Error types for the task scheduler

use std::fmt;

use super::worker::WorkerKind;

/// Errors raised by the registry, the scheduler handle and the submission socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The worker name does not match any known worker
    UnknownWorker(String),

    /// A handler is already registered for this worker
    AlreadyRegistered(WorkerKind),

    /// Pool sizes start at 1
    InvalidPoolSize(WorkerKind),

    /// No handler is registered for this worker
    NotRegistered(WorkerKind),

    /// The scheduler loop is gone
    Closed,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::UnknownWorker(name) => write!(f, "unknown worker {:?}", name),
            SchedulerError::AlreadyRegistered(kind) => {
                write!(f, "worker {} is already registered", kind)
            }
            SchedulerError::InvalidPoolSize(kind) => {
                write!(f, "worker {} needs a pool size of at least 1", kind)
            }
            SchedulerError::NotRegistered(kind) => write!(f, "worker {} is not registered", kind),
            SchedulerError::Closed => write!(f, "scheduler is not running"),
        }
    }
}

impl std::error::Error for SchedulerError {}
