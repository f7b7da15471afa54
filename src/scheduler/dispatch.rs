//! Scheduler actor - Dispatches due tasks to worker pools
//!
//! ## Message Flow
//!
//! ```text
//! SchedulerHandle ──commands──▶ Scheduler ──spawn──▶ worker task (holds a pool permit)
//!                                   ▲                        │
//!                                   └──────completion────────┘
//! ```
//!
//! The scheduler task is the only owner of the task table. Worker executions
//! report back through the completion channel, which is where periodic tasks
//! are re-armed and one-shot tasks forgotten.
//!
//! A due task is started only when a permit of its worker pool is available
//! right away; otherwise it stays pending until the next pass.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, instrument, trace, warn};

use super::error::SchedulerError;
use super::task::{ScheduleOutcome, Task};
use super::worker::{WorkerKind, WorkerRegistry};

/// Commands that can be sent to the scheduler
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Add a task unless its id is already pending or running
    Schedule {
        task: Task,
        respond_to: oneshot::Sender<Result<ScheduleOutcome, SchedulerError>>,
    },

    /// Forget a task; a running execution is left to finish
    Remove {
        id: String,
        respond_to: oneshot::Sender<bool>,
    },

    /// Stop dispatching to a worker
    Unregister {
        worker: WorkerKind,
        respond_to: oneshot::Sender<bool>,
    },

    /// List the task table
    Snapshot {
        respond_to: oneshot::Sender<Vec<TaskSnapshot>>,
    },

    /// Stop the dispatch loop
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
}

/// View of one task table entry
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: String,
    pub worker: WorkerKind,
    pub state: TaskState,
    /// Completed executions, successful or not
    pub runs: u64,
}

struct Entry {
    task: Task,
    state: TaskState,
    next_run: Instant,
    runs: u64,
    /// Removed while running; dropped when the execution completes
    removed: bool,
}

enum RunOutcome {
    Success,
    Failed(String),
    Panicked,
}

struct Completion {
    id: String,
    outcome: RunOutcome,
}

/// Shortest dispatch period, `interval` panics on zero
const MIN_TICK: Duration = Duration::from_millis(1);

/// Task scheduler owning the registry and the task table
pub struct Scheduler {
    registry: WorkerRegistry,
    entries: HashMap<String, Entry>,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(
        registry: WorkerRegistry,
        command_rx: mpsc::Receiver<SchedulerCommand>,
        tick: Duration,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        Self {
            registry,
            entries: HashMap::new(),
            command_rx,
            completion_tx,
            completion_rx,
            tick: tick.max(MIN_TICK),
        }
    }

    /// Spawn the dispatch loop
    pub fn spawn(
        registry: WorkerRegistry,
        command_rx: mpsc::Receiver<SchedulerCommand>,
        tick: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(registry, command_rx, tick).run())
    }

    /// Run the dispatch loop until a Shutdown command arrives or every handle is dropped
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting scheduler");

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(completion) = self.completion_rx.recv() => {
                    self.complete(completion);
                }

                _ = ticker.tick() => {}
            }

            self.dispatch_due();
        }

        debug!("scheduler stopped with {} tasks in table", self.entries.len());
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Schedule { task, respond_to } => {
                let _ = respond_to.send(self.schedule(task));
            }

            SchedulerCommand::Remove { id, respond_to } => {
                let _ = respond_to.send(self.remove(&id));
            }

            SchedulerCommand::Unregister { worker, respond_to } => {
                let known = self.registry.unregister(worker);
                if known {
                    debug!("unregistered worker {worker}");
                    let ids: Vec<String> = self
                        .entries
                        .iter()
                        .filter(|(_, entry)| entry.task.worker == worker)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in ids {
                        self.remove(&id);
                    }
                }
                let _ = respond_to.send(known);
            }

            SchedulerCommand::Snapshot { respond_to } => {
                let mut snapshot: Vec<TaskSnapshot> = self
                    .entries
                    .iter()
                    .filter(|(_, entry)| !entry.removed)
                    .map(|(id, entry)| TaskSnapshot {
                        id: id.clone(),
                        worker: entry.task.worker,
                        state: entry.state,
                        runs: entry.runs,
                    })
                    .collect();
                snapshot.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = respond_to.send(snapshot);
            }

            SchedulerCommand::Shutdown => {}
        }
    }

    fn schedule(&mut self, task: Task) -> Result<ScheduleOutcome, SchedulerError> {
        if !self.registry.contains(task.worker) {
            return Err(SchedulerError::NotRegistered(task.worker));
        }

        if self.entries.contains_key(&task.id) {
            trace!("task {} is already scheduled", task.id);
            return Ok(ScheduleOutcome::Duplicate);
        }

        trace!("scheduling task {} on {}", task.id, task.worker);
        self.entries.insert(
            task.id.clone(),
            Entry {
                task,
                state: TaskState::Pending,
                next_run: Instant::now(),
                runs: 0,
                removed: false,
            },
        );
        Ok(ScheduleOutcome::Scheduled)
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.state == TaskState::Running => {
                let was_removed = entry.removed;
                entry.removed = true;
                !was_removed
            }
            Some(_) => self.entries.remove(id).is_some(),
            None => false,
        }
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { id, outcome } = completion;

        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        match outcome {
            RunOutcome::Success => trace!("task {id} completed"),
            RunOutcome::Failed(e) => error!("task {id} failed: {e}"),
            RunOutcome::Panicked => error!("task {id} panicked"),
        }

        entry.runs += 1;

        match (entry.removed, entry.task.redo_interval) {
            (false, Some(redo)) => {
                entry.state = TaskState::Pending;
                entry.next_run = Instant::now() + redo;
            }
            _ => {
                self.entries.remove(&id);
            }
        }
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();
        let wall_clock = Utc::now();

        let mut due: Vec<(Instant, String)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == TaskState::Pending && entry.next_run <= now)
            .map(|(id, entry)| (entry.next_run, id.clone()))
            .collect();
        due.sort();

        for (_, id) in due {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };

            if entry.task.is_expired(wall_clock) {
                debug!("task {id} expired before dispatch");
                self.entries.remove(&id);
                continue;
            }

            let Some(registration) = self.registry.get(entry.task.worker) else {
                warn!("dropping task {id}: worker {} is not registered", entry.task.worker);
                self.entries.remove(&id);
                continue;
            };

            let Ok(permit) = registration.pool.clone().try_acquire_owned() else {
                trace!("pool of {} is full, task {id} stays pending", entry.task.worker);
                continue;
            };

            entry.state = TaskState::Running;

            let handler = registration.handler.clone();
            let options = entry.task.options.clone();
            let completion_tx = self.completion_tx.clone();

            trace!("dispatching task {id}");
            tokio::spawn(async move {
                let outcome = match AssertUnwindSafe(handler.run(options)).catch_unwind().await {
                    Ok(Ok(())) => RunOutcome::Success,
                    Ok(Err(e)) => RunOutcome::Failed(format!("{e:#}")),
                    Err(_) => RunOutcome::Panicked,
                };

                // the permit goes back before the scheduler learns about the completion
                drop(permit);
                let _ = completion_tx.send(Completion { id, outcome });
            });
        }
    }
}

/// Handle for talking to the scheduler
///
/// Cheap to clone; workers that submit follow-up tasks keep one.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Create a handle and the receiver the scheduler is built from
    ///
    /// The handle exists before the scheduler so workers holding it can be
    /// put in the registry the scheduler then takes ownership of.
    pub fn channel() -> (Self, mpsc::Receiver<SchedulerCommand>) {
        let (sender, receiver) = mpsc::channel(256);
        (Self { sender }, receiver)
    }

    pub async fn schedule(&self, task: Task) -> Result<ScheduleOutcome, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Schedule {
                task,
                respond_to: tx,
            })
            .await
            .map_err(|_| SchedulerError::Closed)?;

        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    /// Returns whether the task was known
    pub async fn remove(&self, id: impl Into<String>) -> Result<bool, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Remove {
                id: id.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SchedulerError::Closed)?;

        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// Returns whether the worker was registered
    pub async fn unregister(&self, worker: WorkerKind) -> Result<bool, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Unregister {
                worker,
                respond_to: tx,
            })
            .await
            .map_err(|_| SchedulerError::Closed)?;

        rx.await.map_err(|_| SchedulerError::Closed)
    }

    pub async fn snapshot(&self) -> Result<Vec<TaskSnapshot>, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| SchedulerError::Closed)?;

        rx.await.map_err(|_| SchedulerError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.sender
            .send(SchedulerCommand::Shutdown)
            .await
            .map_err(|_| SchedulerError::Closed)
    }
}
