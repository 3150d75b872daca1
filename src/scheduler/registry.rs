//! In-memory table of armed jobs keyed by task id.
//!
//! Jobs sit in a min-heap ordered by next fire instant. Removing a job only
//! drops its map entry; heap entries carry a generation number and stale
//! ones are discarded when they surface. Re-adding a task bumps the
//! generation, so a task is never armed twice.

use super::cron::{self, TriggerExpression};
use super::{SchedulerError, SchedulerResult};
use crate::storage::{Task, TaskId, TaskStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Most fires a preview returns, across all jobs.
pub const PREVIEW_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    at: DateTime<Utc>,
    task_id: TaskId,
    generation: u64,
}

#[derive(Debug, Clone)]
struct ArmedJob {
    task_name: String,
    trigger: TriggerExpression,
    next_fire: DateTime<Utc>,
    generation: u64,
}

/// Snapshot of one armed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub task_id: TaskId,
    pub task_name: String,
    pub cron_expr: String,
    pub next_fire: DateTime<Utc>,
}

/// The timing structure itself, without any store access.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: HashMap<TaskId, ArmedJob>,
    heap: BinaryHeap<Reverse<QueueEntry>>,
    generation: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) `task`. Returns the first fire instant after `now`.
    pub fn arm(&mut self, task: &Task, now: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
        if task.cron_expr.trim().is_empty() {
            return Err(SchedulerError::Validation(format!(
                "task {} has no trigger expression",
                task.id
            )));
        }
        if !cron::validate(&task.cron_expr) {
            return Err(SchedulerError::Validation(format!(
                "task {} has an invalid trigger expression: {}",
                task.id, task.cron_expr
            )));
        }

        let trigger = TriggerExpression::parse(&task.cron_expr)
            .map_err(|e| SchedulerError::Validation(format!("task {}: {}", task.id, e)))?;
        let next_fire = trigger.next_after(now).ok_or_else(|| {
            SchedulerError::Validation(format!("task {}: trigger never fires", task.id))
        })?;

        self.generation += 1;
        let generation = self.generation;
        self.heap.push(Reverse(QueueEntry {
            at: next_fire,
            task_id: task.id,
            generation,
        }));
        self.jobs.insert(
            task.id,
            ArmedJob {
                task_name: task.name.clone(),
                trigger,
                next_fire,
                generation,
            },
        );

        Ok(next_fire)
    }

    pub fn disarm(&mut self, task_id: TaskId) -> bool {
        self.jobs.remove(&task_id).is_some()
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.heap.clear();
    }

    /// Pop every job due at or before `now` and re-arm it for its next fire
    /// after `now`. Each armed task appears at most once in the result.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut due = Vec::new();

        while let Some(Reverse(top)) = self.heap.peek() {
            if top.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };

            let Some(job) = self.jobs.get_mut(&entry.task_id) else {
                continue; // removed
            };
            if job.generation != entry.generation {
                continue; // superseded by a later arm
            }

            due.push(entry.task_id);

            match job.trigger.next_after(now) {
                Some(next) => {
                    job.next_fire = next;
                    self.heap.push(Reverse(QueueEntry {
                        at: next,
                        task_id: entry.task_id,
                        generation: entry.generation,
                    }));
                }
                None => {
                    self.jobs.remove(&entry.task_id);
                }
            }
        }

        due
    }

    /// Earliest pending fire instant, if any job is armed.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.jobs.values().map(|j| j.next_fire).min()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.jobs.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Armed jobs ordered by next fire.
    pub fn snapshot(&self) -> Vec<JobInfo> {
        let mut list: Vec<JobInfo> = self
            .jobs
            .iter()
            .map(|(id, job)| JobInfo {
                task_id: *id,
                task_name: job.task_name.clone(),
                cron_expr: job.trigger.expression().to_string(),
                next_fire: job.next_fire,
            })
            .collect();
        list.sort_by(|a, b| a.next_fire.cmp(&b.next_fire).then(a.task_id.cmp(&b.task_id)));
        list
    }

    /// Earliest fires of every armed job in `(after, until]`, ordered by
    /// time and capped at [`PREVIEW_LIMIT`] entries.
    pub fn preview(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Vec<(DateTime<Utc>, JobInfo)> {
        let mut out = Vec::new();
        for (id, job) in &self.jobs {
            for at in job.trigger.fires_between(after, until, PREVIEW_LIMIT) {
                out.push((
                    at,
                    JobInfo {
                        task_id: *id,
                        task_name: job.task_name.clone(),
                        cron_expr: job.trigger.expression().to_string(),
                        next_fire: at,
                    },
                ));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.task_id.cmp(&b.1.task_id)));
        out.truncate(PREVIEW_LIMIT);
        out
    }
}

/// Store-aware registry: bulk load, add, remove, update.
pub struct JobRegistry {
    store: Arc<dyn TaskStore>,
    queue: Mutex<JobQueue>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            queue: Mutex::new(JobQueue::new()),
        }
    }

    /// Replace the table with every scheduled, non-deleted task. A task that
    /// fails validation is logged and skipped. Returns the number armed.
    pub async fn load_all(&self) -> SchedulerResult<usize> {
        let tasks = self.store.list_scheduled_tasks()?;
        let now = Utc::now();

        let mut queue = self.queue.lock().await;
        queue.clear();
        for task in &tasks {
            if let Err(e) = queue.arm(task, now) {
                error!(
                    category = "SCHEDULER",
                    task_id = task.id,
                    task_name = %task.name,
                    error = %e,
                    "Failed to add scheduled task"
                );
            }
        }

        let armed = queue.len();
        info!(category = "SCHEDULER", armed, total = tasks.len(), "Loaded scheduled tasks");
        Ok(armed)
    }

    /// Arm `task`. Fails with `Validation` if its trigger is empty or invalid.
    pub async fn add(&self, task: &Task) -> SchedulerResult<DateTime<Utc>> {
        let next_fire = self.queue.lock().await.arm(task, Utc::now())?;
        info!(
            category = "SCHEDULER",
            task_id = task.id,
            task_name = %task.name,
            cron_expression = %task.cron_expr,
            next_fire = %next_fire,
            "Added scheduled task"
        );
        Ok(next_fire)
    }

    /// Disarm one task; other jobs are untouched.
    pub async fn remove(&self, task_id: TaskId) -> bool {
        let removed = self.queue.lock().await.disarm(task_id);
        if removed {
            info!(category = "SCHEDULER", task_id, "Removed scheduled task");
        }
        removed
    }

    /// Re-read the task's trigger from the store and re-arm it if it is
    /// still scheduled. Returns whether the task ended up armed.
    pub async fn update(&self, task_id: TaskId) -> SchedulerResult<bool> {
        self.remove(task_id).await;

        let Some(task) = self.store.find_task(task_id)? else {
            return Ok(false);
        };
        if !task.is_scheduled || task.is_deleted {
            return Ok(false);
        }

        self.add(&task).await?;
        Ok(true)
    }

    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        self.queue.lock().await.pop_due(now)
    }

    pub async fn contains(&self, task_id: TaskId) -> bool {
        self.queue.lock().await.contains(task_id)
    }

    pub async fn jobs(&self) -> Vec<JobInfo> {
        self.queue.lock().await.snapshot()
    }

    pub async fn preview(&self, hours: u64) -> Vec<(DateTime<Utc>, JobInfo)> {
        let now = Utc::now();
        let until = i64::try_from(hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.queue.lock().await.preview(now, until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TaskStatus;
    use chrono::TimeZone;

    fn task(id: TaskId, cron_expr: &str) -> Task {
        Task {
            id,
            project_id: 1,
            name: format!("task-{}", id),
            status: TaskStatus::Idle,
            is_scheduled: true,
            cron_expr: cron_expr.to_string(),
            is_deleted: false,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_arm_rejects_empty_and_malformed() {
        let mut q = JobQueue::new();
        assert!(matches!(q.arm(&task(1, ""), t0()), Err(SchedulerError::Validation(_))));
        assert!(matches!(q.arm(&task(2, "* * * *"), t0()), Err(SchedulerError::Validation(_))));
        assert!(matches!(q.arm(&task(3, "99 * * * * *"), t0()), Err(SchedulerError::Validation(_))));
        assert!(q.is_empty());
    }

    #[test]
    fn test_pop_due_fires_once_per_tick() {
        let mut q = JobQueue::new();
        q.arm(&task(1, "* * * * * *"), t0()).unwrap();

        assert!(q.pop_due(t0()).is_empty());
        let tick = t0() + chrono::Duration::seconds(1);
        assert_eq!(q.pop_due(tick), vec![1]);
        assert!(q.pop_due(tick).is_empty());
    }

    #[test]
    fn test_missed_fires_collapse_into_one() {
        let mut q = JobQueue::new();
        q.arm(&task(1, "* * * * * *"), t0()).unwrap();

        let later = t0() + chrono::Duration::seconds(30);
        assert_eq!(q.pop_due(later), vec![1]);
        assert_eq!(q.next_wakeup(), Some(later + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_remove_leaves_other_jobs_armed() {
        let mut q = JobQueue::new();
        q.arm(&task(1, "* * * * * *"), t0()).unwrap();
        q.arm(&task(2, "* * * * * *"), t0()).unwrap();

        assert!(q.disarm(1));
        assert!(!q.disarm(1));
        assert_eq!(q.pop_due(t0() + chrono::Duration::seconds(1)), vec![2]);
    }

    #[test]
    fn test_remove_then_readd_does_not_duplicate() {
        let mut q = JobQueue::new();
        q.arm(&task(1, "* * * * * *"), t0()).unwrap();
        q.disarm(1);
        q.arm(&task(1, "* * * * * *"), t0()).unwrap();
        // Arming twice without removal also replaces the job.
        q.arm(&task(1, "* * * * * *"), t0()).unwrap();

        for s in 1..=5 {
            let tick = t0() + chrono::Duration::seconds(s);
            assert_eq!(q.pop_due(tick), vec![1], "tick {}", s);
        }
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_snapshot_and_preview_order() {
        let mut q = JobQueue::new();
        q.arm(&task(1, "0 0 12 * * *"), t0()).unwrap();
        q.arm(&task(2, "0 0 6 * * *"), t0()).unwrap();

        let jobs = q.snapshot();
        assert_eq!(jobs[0].task_id, 2);
        assert_eq!(jobs[1].task_id, 1);

        let preview = q.preview(t0(), t0() + chrono::Duration::hours(48));
        let ids: Vec<_> = preview.iter().map(|(_, j)| j.task_id).collect();
        assert_eq!(ids, vec![2, 1, 2, 1]);
    }

    #[test]
    fn test_preview_is_capped() {
        let mut q = JobQueue::new();
        q.arm(&task(1, "* * * * * *"), t0()).unwrap();
        q.arm(&task(2, "* * * * * *"), t0()).unwrap();

        let preview = q.preview(t0(), DateTime::<Utc>::MAX_UTC);
        assert_eq!(preview.len(), PREVIEW_LIMIT);
        assert_eq!(preview[0].0, t0() + chrono::Duration::seconds(1));
        assert_eq!(preview[1].0, t0() + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_registry_preview_accepts_huge_window() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cadence.db");
        let store = Arc::new(crate::storage::SqliteStore::open(path.to_str().unwrap()).unwrap());
        let registry = JobRegistry::new(store);
        registry.add(&task(1, "* * * * * *")).await.unwrap();

        let fires = registry.preview(u64::MAX).await;
        assert_eq!(fires.len(), PREVIEW_LIMIT);
    }
}
