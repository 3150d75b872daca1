//! Job scheduling and execution coordination.
//!
//! [`Scheduler`] is the handle the rest of the process uses: it owns the job
//! registry, the execution coordinator and the statistics aggregator, and is
//! cheap to clone.

pub mod coordinator;
pub mod cron;
pub mod engine;
pub mod history;
pub mod registry;

pub use self::coordinator::{BatchHandle, Dispatch, ExecutionCoordinator};
pub use self::history::{StatisticsAggregator, TaskStats};
pub use self::registry::{JobInfo, JobRegistry};

use crate::runner::executor::CaseExecutor;
use crate::runner::TaskRunner;
use crate::storage::{ReportStatus, TaskId, TaskReport, TaskStatus, TaskStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid trigger expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("case execution failed: {0}")]
    Execution(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Current state of a task as seen by callers. `last_outcome` comes from
/// the newest report, since the persisted status does not separate success
/// from failure.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub scheduled: bool,
    pub armed: bool,
    pub last_outcome: Option<ReportStatus>,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    registry: Arc<JobRegistry>,
    coordinator: ExecutionCoordinator,
    stats: StatisticsAggregator,
    tick_interval: Duration,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn CaseExecutor>,
        tick_interval: Duration,
    ) -> Self {
        let runner = Arc::new(TaskRunner::new(store.clone(), executor));
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Arc::new(JobRegistry::new(store.clone())),
            coordinator: ExecutionCoordinator::new(store.clone(), runner),
            stats: StatisticsAggregator::new(store.clone()),
            store,
            tick_interval,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Arm every scheduled task and spawn the timer loop.
    pub async fn start(&self) -> SchedulerResult<JoinHandle<()>> {
        self.registry.load_all().await?;
        let rx = self.shutdown.subscribe();
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            engine::run_scheduler_loop(engine, rx).await;
        }))
    }

    /// Ask the timer loop to exit. In-flight batches keep running.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Arm a task that has scheduling enabled. Returns its next fire instant.
    pub async fn add_task(&self, task_id: TaskId) -> SchedulerResult<DateTime<Utc>> {
        let task = self
            .store
            .find_task(task_id)?
            .filter(|t| !t.is_deleted)
            .ok_or(SchedulerError::NotFound(task_id))?;
        if !task.is_scheduled {
            return Err(SchedulerError::Validation(format!(
                "task {} does not have scheduling enabled",
                task_id
            )));
        }
        self.registry.add(&task).await
    }

    pub async fn remove_task(&self, task_id: TaskId) -> bool {
        self.registry.remove(task_id).await
    }

    /// Re-arm from the task's stored trigger. Returns whether it is armed.
    pub async fn update_task(&self, task_id: TaskId) -> SchedulerResult<bool> {
        self.registry.update(task_id).await
    }

    pub async fn run_now(&self, task_id: TaskId) -> SchedulerResult<Dispatch> {
        self.coordinator.run_now(task_id).await
    }

    pub async fn stop(&self, task_id: TaskId) -> SchedulerResult<()> {
        self.coordinator.stop(task_id).await
    }

    pub async fn get_status(&self, task_id: TaskId) -> SchedulerResult<TaskStatusView> {
        let task = self
            .store
            .find_task(task_id)?
            .ok_or(SchedulerError::NotFound(task_id))?;
        let latest = self.store.list_reports(task_id, 1)?.into_iter().next();

        Ok(TaskStatusView {
            task_id,
            status: task.status,
            scheduled: task.is_scheduled && !task.is_deleted,
            armed: self.registry.contains(task_id).await,
            last_outcome: latest.as_ref().map(|r| r.status),
            last_run_at: latest.map(|r| r.created_at),
        })
    }

    pub async fn get_stats(&self, task_id: TaskId, days: u32) -> SchedulerResult<TaskStats> {
        self.stats.stats(task_id, days)
    }

    pub async fn history(&self, task_id: TaskId, limit: usize) -> SchedulerResult<Vec<TaskReport>> {
        self.stats.history(task_id, limit)
    }

    pub async fn running_tasks(&self) -> SchedulerResult<Vec<crate::storage::Task>> {
        Ok(self.store.list_running_tasks()?)
    }

    pub async fn jobs(&self) -> Vec<JobInfo> {
        self.registry.jobs().await
    }

    pub async fn preview(&self, hours: u64) -> Vec<(DateTime<Utc>, JobInfo)> {
        self.registry.preview(hours).await
    }
}
