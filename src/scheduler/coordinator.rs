//! Overlap guard and asynchronous batch dispatch.

use super::{SchedulerError, SchedulerResult};
use crate::runner::{BatchOutcome, TaskRunner};
use crate::storage::{TaskId, TaskStatus, TaskStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// What triggered a dispatch; only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Schedule,
    Manual,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Schedule => write!(f, "schedule"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

/// Result of asking the coordinator to run a task.
#[derive(Debug)]
pub enum Dispatch {
    /// A batch was spawned.
    Started(BatchHandle),
    /// The task was already running; nothing was spawned.
    AlreadyRunning,
}

impl Dispatch {
    pub fn is_started(&self) -> bool {
        matches!(self, Dispatch::Started(_))
    }
}

/// Handle to a spawned batch. Dropping it detaches the batch.
#[derive(Debug)]
pub struct BatchHandle {
    pub task_id: TaskId,
    handle: JoinHandle<Option<BatchOutcome>>,
}

impl BatchHandle {
    /// Wait for the batch. `None` if it aborted; the error was logged.
    pub async fn wait(self) -> Option<BatchOutcome> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(category = "SCHEDULER", task_id = self.task_id, error = %e, "Batch task panicked");
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct ExecutionCoordinator {
    store: Arc<dyn TaskStore>,
    runner: Arc<TaskRunner>,
}

impl ExecutionCoordinator {
    pub fn new(store: Arc<dyn TaskStore>, runner: Arc<TaskRunner>) -> Self {
        Self { store, runner }
    }

    /// Called by the timer loop when a job is due.
    pub async fn on_due(&self, task_id: TaskId) -> SchedulerResult<Dispatch> {
        self.dispatch(task_id, Trigger::Schedule)
    }

    /// Manual trigger. Same guard as `on_due`; errors go back to the caller.
    pub async fn run_now(&self, task_id: TaskId) -> SchedulerResult<Dispatch> {
        self.dispatch(task_id, Trigger::Manual)
    }

    /// Mark a running task as finished. The in-flight batch is not
    /// interrupted and will overwrite this status when it completes.
    pub async fn stop(&self, task_id: TaskId) -> SchedulerResult<()> {
        let task = self
            .store
            .find_task(task_id)?
            .ok_or(SchedulerError::NotFound(task_id))?;

        if task.status != TaskStatus::Running {
            return Err(SchedulerError::InvalidState(format!(
                "task {} is not running (status: {})",
                task_id, task.status
            )));
        }

        self.store.set_task_status(task_id, TaskStatus::Done)?;
        info!(category = "TASK_STOP", task_id, "Task stopped");
        Ok(())
    }

    fn dispatch(&self, task_id: TaskId, trigger: Trigger) -> SchedulerResult<Dispatch> {
        info!(category = "SCHEDULER", task_id, %trigger, "Starting task");

        let task = self
            .store
            .find_task(task_id)?
            .filter(|t| !t.is_deleted)
            .ok_or(SchedulerError::NotFound(task_id))?;

        if task.status == TaskStatus::Running {
            info!(category = "SCHEDULER", task_id, %trigger, "Task already running, skipping");
            return Ok(Dispatch::AlreadyRunning);
        }

        // Single-statement compare-and-swap; a concurrent trigger that read
        // the same idle status loses here.
        if !self.store.claim_task(task_id)? {
            info!(category = "SCHEDULER", task_id, %trigger, "Task claimed by another trigger, skipping");
            return Ok(Dispatch::AlreadyRunning);
        }

        let runner = self.runner.clone();
        let handle = tokio::spawn(async move {
            match runner.run(task_id).await {
                Ok(outcome) => {
                    info!(
                        category = "SCHEDULER",
                        task_id,
                        %trigger,
                        status = outcome.status.as_str(),
                        duration = %outcome.duration_text(),
                        "Task batch finished"
                    );
                    Some(outcome)
                }
                Err(e) => {
                    error!(category = "SCHEDULER", task_id, %trigger, error = %e, "Task batch failed");
                    None
                }
            }
        });

        Ok(Dispatch::Started(BatchHandle { task_id, handle }))
    }
}
