//! End-to-end scheduling tests against a real SQLite file.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use cadence::runner::executor::{CaseExecutor, CaseOutcome, StubExecutor};
use cadence::scheduler::{Dispatch, Scheduler, SchedulerError, SchedulerResult};
use cadence::storage::*;

struct Fixture {
    _dir: TempDir,
    store: Arc<SqliteStore>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cadence.db");
    let store = Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap());
    let project = store.insert_project("web regression").unwrap();
    assert_eq!(project, PROJECT_ID);
    Fixture { _dir: dir, store }
}

const PROJECT_ID: i64 = 1;

fn task(store: &SqliteStore, name: &str, cron_expr: &str) -> TaskId {
    store
        .insert_task(&NewTask {
            project_id: PROJECT_ID,
            name: name.to_string(),
            is_scheduled: !cron_expr.is_empty(),
            cron_expr: cron_expr.to_string(),
        })
        .unwrap()
}

fn case(store: &SqliteStore, hash: &str) {
    store
        .insert_case(&TestCase {
            project_id: PROJECT_ID,
            file_name: "test_login.py".into(),
            class_name: "LoginTest".into(),
            case_name: format!("test_{}", hash),
            case_hash: hash.into(),
            ..Default::default()
        })
        .unwrap();
}

fn report(task_id: TaskId, status: ReportStatus, run_time: &str, at: DateTime<Utc>) -> TaskReport {
    TaskReport {
        id: 0,
        task_id,
        name: format!("Task {} Execution Report", task_id),
        status,
        report: String::new(),
        passed: 1,
        failure: 0,
        skipped: 0,
        tests: 1,
        run_time: run_time.into(),
        created_at: at,
    }
}

fn scheduler(store: Arc<dyn TaskStore>, executor: Arc<dyn CaseExecutor>) -> Scheduler {
    Scheduler::new(store, executor, Duration::from_millis(50))
}

fn stub() -> Arc<dyn CaseExecutor> {
    Arc::new(StubExecutor::new(Duration::from_millis(1)))
}

/// Counts how many cases it was asked to run.
#[derive(Default)]
struct CountingExecutor {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl CaseExecutor for CountingExecutor {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn execute(&self, _case: &TestCase) -> SchedulerResult<CaseOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CaseOutcome::Passed)
    }
}

/// Wraps the real store and injects faults.
struct FaultyStore {
    inner: Arc<SqliteStore>,
    /// Report every task as running and refuse every claim.
    always_running: bool,
    /// Fail `set_task_status(.., Running)`.
    fail_mark_running: bool,
    /// Fail `find_task` from this call on (0-based).
    fail_find_from: Option<usize>,
    finds: AtomicUsize,
}

impl FaultyStore {
    fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            always_running: false,
            fail_mark_running: false,
            fail_find_from: None,
            finds: AtomicUsize::new(0),
        }
    }
}

impl TaskStore for FaultyStore {
    fn find_task(&self, id: TaskId) -> Result<Option<Task>> {
        let call = self.finds.fetch_add(1, Ordering::SeqCst);
        if self.fail_find_from.is_some_and(|from| call >= from) {
            anyhow::bail!("database is locked");
        }
        let task = self.inner.find_task(id)?;
        if self.always_running {
            return Ok(task.map(|mut t| {
                t.status = TaskStatus::Running;
                t
            }));
        }
        Ok(task)
    }
    fn save_task(&self, task: &Task) -> Result<()> {
        self.inner.save_task(task)
    }
    fn set_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        if self.fail_mark_running && status == TaskStatus::Running {
            anyhow::bail!("disk I/O error");
        }
        self.inner.set_task_status(id, status)
    }
    fn claim_task(&self, id: TaskId) -> Result<bool> {
        if self.always_running {
            return Ok(false);
        }
        self.inner.claim_task(id)
    }
    fn list_scheduled_tasks(&self) -> Result<Vec<Task>> {
        self.inner.list_scheduled_tasks()
    }
    fn list_running_tasks(&self) -> Result<Vec<Task>> {
        self.inner.list_running_tasks()
    }
    fn list_case_bindings(&self, task_id: TaskId) -> Result<Vec<CaseBinding>> {
        self.inner.list_case_bindings(task_id)
    }
    fn find_case_by_hash(&self, hash: &str) -> Result<Option<TestCase>> {
        self.inner.find_case_by_hash(hash)
    }
    fn insert_case_result(&self, row: &CaseResultRow) -> Result<i64> {
        self.inner.insert_case_result(row)
    }
    fn insert_task_report(&self, row: &TaskReport) -> Result<i64> {
        self.inner.insert_task_report(row)
    }
    fn insert_report_details(&self, rows: &[ReportDetail]) -> Result<()> {
        self.inner.insert_report_details(rows)
    }
    fn list_reports_in_window(
        &self,
        task_id: TaskId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskReport>> {
        self.inner.list_reports_in_window(task_id, start, end)
    }
    fn list_reports(&self, task_id: TaskId, limit: usize) -> Result<Vec<TaskReport>> {
        self.inner.list_reports(task_id, limit)
    }
}

async fn run_to_completion(s: &Scheduler, task_id: TaskId) -> cadence::runner::BatchOutcome {
    match s.run_now(task_id).await.unwrap() {
        Dispatch::Started(handle) => handle.wait().await.expect("batch aborted"),
        Dispatch::AlreadyRunning => panic!("task {} unexpectedly running", task_id),
    }
}

#[tokio::test]
async fn test_task_without_cases_reports_empty_success() {
    let fx = fixture();
    let id = task(&fx.store, "empty", "");
    let s = scheduler(fx.store.clone(), stub());

    let outcome = run_to_completion(&s, id).await;
    assert_eq!(outcome.summary.total, 0);
    assert_eq!(outcome.summary.pass_rate, 0.0);
    assert_eq!(outcome.status, ReportStatus::Success);

    let reports = fx.store.list_reports(id, 0).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].tests, 0);
    assert_eq!(reports[0].status, ReportStatus::Success);

    let t = fx.store.find_task(id).unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Done);
}

#[tokio::test]
async fn test_unresolved_case_fails_without_aborting_batch() {
    let fx = fixture();
    let id = task(&fx.store, "login suite", "");
    case(&fx.store, "hashA");
    fx.store.bind_case(id, "hashA").unwrap();
    fx.store.bind_case(id, "hashB").unwrap();
    let s = scheduler(fx.store.clone(), stub());

    let outcome = run_to_completion(&s, id).await;
    assert_eq!(outcome.summary.total, 2);
    assert_eq!(outcome.summary.passed, 1);
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(outcome.summary.pass_rate, 50.0);
    assert_eq!(outcome.status, ReportStatus::Failed);

    let rows = fx.store.list_case_results(id).unwrap();
    assert_eq!(rows.len(), 2);
    let missing = rows.iter().find(|r| r.case_hash == "hashB").unwrap();
    assert_eq!(missing.status, CaseStatus::Failed);
    assert!(missing.error_message.as_deref().unwrap_or("").contains("not found"));

    let report_id = outcome.report_id.unwrap();
    let details = fx.store.list_report_details(report_id).unwrap();
    assert_eq!(details.len(), 2);

    let view = s.get_status(id).await.unwrap();
    assert_eq!(view.status, TaskStatus::Done);
    assert_eq!(view.last_outcome, Some(ReportStatus::Failed));
}

#[tokio::test]
async fn test_running_task_is_never_dispatched() {
    let fx = fixture();
    let id = task(&fx.store, "busy", "0 12 * * *");
    case(&fx.store, "hashA");
    fx.store.bind_case(id, "hashA").unwrap();

    let counter = Arc::new(CountingExecutor::default());
    let store = FaultyStore {
        always_running: true,
        ..FaultyStore::new(fx.store.clone())
    };
    let s = scheduler(Arc::new(store), counter.clone());

    for _ in 0..3 {
        let d = s.coordinator().on_due(id).await.unwrap();
        assert!(!d.is_started());
    }
    assert!(!s.run_now(id).await.unwrap().is_started());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    assert!(fx.store.list_reports(id, 0).unwrap().is_empty());
}

#[tokio::test]
async fn test_second_trigger_while_running_is_skipped() {
    let fx = fixture();
    let id = task(&fx.store, "slow", "");
    case(&fx.store, "hashA");
    fx.store.bind_case(id, "hashA").unwrap();
    let s = scheduler(
        fx.store.clone(),
        Arc::new(StubExecutor::new(Duration::from_millis(300))),
    );

    let first = s.run_now(id).await.unwrap();
    assert!(first.is_started());
    assert!(!s.run_now(id).await.unwrap().is_started());
    assert_eq!(s.running_tasks().await.unwrap().len(), 1);

    if let Dispatch::Started(handle) = first {
        handle.wait().await.unwrap();
    }
    assert_eq!(fx.store.list_reports(id, 0).unwrap().len(), 1);
    assert!(s.running_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stats_only_count_reports_inside_window() {
    let fx = fixture();
    let id = task(&fx.store, "nightly", "0 2 * * *");
    let now = Utc::now();
    let day = chrono::Duration::days(1);

    for (i, run_time) in ["2.00s", "4.00s", "6.00s"].iter().enumerate() {
        let status = if i == 2 { ReportStatus::Failed } else { ReportStatus::Success };
        fx.store
            .insert_task_report(&report(id, status, run_time, now - day * (i as i32 + 1)))
            .unwrap();
    }
    fx.store
        .insert_task_report(&report(id, ReportStatus::Success, "1.00s", now - day * 10))
        .unwrap();
    fx.store
        .insert_task_report(&report(id, ReportStatus::Failed, "1.00s", now - day * 30))
        .unwrap();

    let s = scheduler(fx.store.clone(), stub());
    let stats = s.get_stats(id, 7).await.unwrap();
    assert_eq!(stats.period_days, 7);
    assert_eq!(stats.total_runs, 3);
    assert_eq!(stats.success_runs, 2);
    assert_eq!(stats.failed_runs, 1);
    assert!((stats.success_rate - 200.0 / 3.0).abs() < 1e-9);
    assert!((stats.avg_duration_secs - 4.0).abs() < 1e-9);

    let wide = s.get_stats(id, 60).await.unwrap();
    assert_eq!(wide.total_runs, 5);

    let unbounded = s.get_stats(id, u32::MAX).await.unwrap();
    assert_eq!(unbounded.period_days, u32::MAX);
    assert_eq!(unbounded.total_runs, 5);

    let history = s.history(id, 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].created_at > history[1].created_at);
}

#[tokio::test]
async fn test_stats_for_task_without_reports() {
    let fx = fixture();
    let id = task(&fx.store, "fresh", "");
    let s = scheduler(fx.store.clone(), stub());

    let stats = s.get_stats(id, 7).await.unwrap();
    assert_eq!(stats.total_runs, 0);
    assert_eq!(stats.success_rate, 0.0);
    assert_eq!(stats.avg_duration_secs, 0.0);
}

#[tokio::test]
async fn test_remove_then_add_arms_exactly_once() {
    let fx = fixture();
    let id = task(&fx.store, "hourly", "0 * * * *");
    let s = scheduler(fx.store.clone(), stub());

    s.add_task(id).await.unwrap();
    assert!(s.remove_task(id).await);
    assert!(!s.remove_task(id).await);
    s.add_task(id).await.unwrap();
    s.add_task(id).await.unwrap();

    let jobs = s.jobs().await;
    assert_eq!(jobs.iter().filter(|j| j.task_id == id).count(), 1);

    let fires = s.preview(3).await;
    assert_eq!(fires.iter().filter(|(_, j)| j.task_id == id).count(), 3);
}

#[tokio::test]
async fn test_add_rejects_manual_and_deleted_tasks() {
    let fx = fixture();
    let manual = task(&fx.store, "manual", "");
    let deleted = task(&fx.store, "gone", "0 * * * *");
    fx.store.delete_task(deleted).unwrap();
    let s = scheduler(fx.store.clone(), stub());

    assert!(matches!(s.add_task(manual).await, Err(SchedulerError::Validation(_))));
    assert!(matches!(s.add_task(deleted).await, Err(SchedulerError::NotFound(_))));
    assert!(matches!(s.add_task(9999).await, Err(SchedulerError::NotFound(9999))));
    assert!(matches!(s.run_now(deleted).await, Err(SchedulerError::NotFound(_))));
}

#[tokio::test]
async fn test_update_follows_stored_trigger() {
    let fx = fixture();
    let id = task(&fx.store, "changing", "0 * * * *");
    let s = scheduler(fx.store.clone(), stub());
    s.add_task(id).await.unwrap();

    let mut t = fx.store.find_task(id).unwrap().unwrap();
    t.cron_expr = "30 6 * * 1-5".into();
    fx.store.save_task(&t).unwrap();
    assert!(s.update_task(id).await.unwrap());
    let job = s.jobs().await.into_iter().find(|j| j.task_id == id).unwrap();
    assert_eq!(job.cron_expr, "30 6 * * 1-5");

    t.is_scheduled = false;
    fx.store.save_task(&t).unwrap();
    assert!(!s.update_task(id).await.unwrap());
    assert!(s.jobs().await.is_empty());
}

#[tokio::test]
async fn test_stop_requires_running_task() {
    let fx = fixture();
    let id = task(&fx.store, "idle", "");
    let s = scheduler(fx.store.clone(), stub());

    assert!(matches!(s.stop(id).await, Err(SchedulerError::InvalidState(_))));
    assert!(matches!(s.stop(4242).await, Err(SchedulerError::NotFound(4242))));

    fx.store.set_task_status(id, TaskStatus::Running).unwrap();
    s.stop(id).await.unwrap();
    assert_eq!(fx.store.find_task(id).unwrap().unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn test_timer_loop_fires_due_task() {
    let fx = fixture();
    let id = task(&fx.store, "every second", "* * * * * *");
    let s = scheduler(fx.store.clone(), stub());

    let engine = s.start().await.unwrap();
    assert!(s.get_status(id).await.unwrap().armed);

    let mut fired = false;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !fx.store.list_reports(id, 1).unwrap().is_empty() {
            fired = true;
            break;
        }
    }

    s.shutdown();
    tokio::time::timeout(Duration::from_secs(2), engine)
        .await
        .expect("timer loop did not stop")
        .unwrap();
    assert!(fired, "scheduled task never fired");
}

#[tokio::test]
async fn test_stop_does_not_interrupt_running_batch() {
    let fx = fixture();
    let id = task(&fx.store, "long suite", "");
    for hash in ["hashA", "hashB"] {
        case(&fx.store, hash);
        fx.store.bind_case(id, hash).unwrap();
    }
    let s = scheduler(
        fx.store.clone(),
        Arc::new(StubExecutor::new(Duration::from_millis(200))),
    );

    let Dispatch::Started(handle) = s.run_now(id).await.unwrap() else {
        panic!("batch did not start");
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    s.stop(id).await.unwrap();
    assert_eq!(fx.store.find_task(id).unwrap().unwrap().status, TaskStatus::Done);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.summary.total, 2);
    assert_eq!(outcome.summary.passed, 2);
    assert_eq!(fx.store.list_case_results(id).unwrap().len(), 2);
    assert_eq!(fx.store.list_reports(id, 0).unwrap().len(), 1);
    assert_eq!(fx.store.find_task(id).unwrap().unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn test_failed_running_write_does_not_lock_task() {
    let fx = fixture();
    let id = task(&fx.store, "flaky disk", "");
    case(&fx.store, "hashA");
    fx.store.bind_case(id, "hashA").unwrap();
    let store = FaultyStore {
        fail_mark_running: true,
        ..FaultyStore::new(fx.store.clone())
    };
    let s = scheduler(Arc::new(store), stub());

    let outcome = run_to_completion(&s, id).await;
    assert_eq!(outcome.summary.passed, 1);
    assert_eq!(fx.store.list_reports(id, 0).unwrap().len(), 1);
    assert_eq!(fx.store.find_task(id).unwrap().unwrap().status, TaskStatus::Done);

    for _ in 0..2 {
        let Dispatch::Started(handle) = s.coordinator().on_due(id).await.unwrap() else {
            panic!("task stayed locked after a failed status write");
        };
        handle.wait().await.unwrap();
    }
    assert_eq!(fx.store.list_reports(id, 0).unwrap().len(), 3);
}

#[tokio::test]
async fn test_failed_lookup_after_claim_releases_task() {
    let fx = fixture();
    let id = task(&fx.store, "vanishing", "");
    // The coordinator's own lookup succeeds; the runner's fails.
    let store = FaultyStore {
        fail_find_from: Some(1),
        ..FaultyStore::new(fx.store.clone())
    };
    let s = scheduler(Arc::new(store), stub());

    let Dispatch::Started(handle) = s.run_now(id).await.unwrap() else {
        panic!("batch did not start");
    };
    assert!(handle.wait().await.is_none());

    assert_eq!(fx.store.find_task(id).unwrap().unwrap().status, TaskStatus::Done);
    assert!(fx.store.list_reports(id, 0).unwrap().is_empty());
    assert!(fx.store.claim_task(id).unwrap());
}
