//! Batch execution: run every case bound to a task and record the outcome.

pub mod executor;
pub mod report;

use self::executor::{CaseExecutor, CaseOutcome};
use self::report::ReportWriter;
use crate::scheduler::{SchedulerError, SchedulerResult};
use crate::storage::{CaseBinding, CaseStatus, ReportStatus, TaskId, TaskStatus, TaskStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Result of one case within a batch. Lives only for the batch.
#[derive(Debug, Clone, Serialize)]
pub struct CaseExecutionResult {
    /// `None` when the binding's hash did not resolve.
    pub case_id: Option<i64>,
    pub case_hash: String,
    pub name: String,
    pub class_name: String,
    pub status: CaseStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl CaseExecutionResult {
    pub fn duration_secs(&self) -> f64 {
        report::duration_secs(self.finished_at - self.started_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Percentage of passed cases; 0 when there are no cases.
    pub pass_rate: f64,
}

impl ExecutionSummary {
    pub fn from_results(results: &[CaseExecutionResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };

        for r in results {
            match r.status {
                CaseStatus::Passed => summary.passed += 1,
                CaseStatus::Failed => summary.failed += 1,
                CaseStatus::Skipped => summary.skipped += 1,
            }
        }

        if summary.total > 0 {
            summary.pass_rate = summary.passed as f64 / summary.total as f64 * 100.0;
        }

        summary
    }

    pub fn batch_status(&self) -> ReportStatus {
        if self.failed > 0 {
            ReportStatus::Failed
        } else {
            ReportStatus::Success
        }
    }
}

/// Everything known about a finished batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub task_id: TaskId,
    pub status: ReportStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<CaseExecutionResult>,
    pub summary: ExecutionSummary,
    /// `None` if the report write failed.
    pub report_id: Option<i64>,
}

impl BatchOutcome {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn duration_text(&self) -> String {
        report::format_duration(self.duration())
    }
}

pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn CaseExecutor>,
    reports: ReportWriter,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn TaskStore>, executor: Arc<dyn CaseExecutor>) -> Self {
        Self {
            reports: ReportWriter::new(store.clone()),
            store,
            executor,
        }
    }

    /// Execute one batch for `task_id`.
    ///
    /// Fails with `NotFound` if the task row is missing. A binding whose
    /// hash does not resolve becomes a failed case; the batch continues.
    /// Every early exit leaves the task `Done`, so a claimed task is never
    /// left `Running`.
    pub async fn run(&self, task_id: TaskId) -> SchedulerResult<BatchOutcome> {
        let task = match self.store.find_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.release(task_id);
                return Err(SchedulerError::NotFound(task_id));
            }
            Err(e) => {
                self.release(task_id);
                return Err(e.into());
            }
        };

        if let Err(e) = self.store.set_task_status(task_id, TaskStatus::Running) {
            error!(category = "TASK_EXECUTION", task_id, error = %e, "Failed to mark task running");
        }

        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            category = "TASK_EXECUTION",
            task_id,
            task_name = %task.name,
            %batch_id,
            executor = self.executor.name(),
            "Task execution started"
        );

        let bindings = match self.store.list_case_bindings(task_id) {
            Ok(b) => b,
            Err(e) => {
                self.release(task_id);
                return Err(e.into());
            }
        };

        let mut results = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            let result = self.run_case(binding).await;
            self.reports.write_case_result(task_id, &result);
            results.push(result);
        }

        let finished_at = Utc::now();
        let summary = ExecutionSummary::from_results(&results);
        let mut outcome = BatchOutcome {
            batch_id,
            task_id,
            status: summary.batch_status(),
            started_at,
            finished_at,
            results,
            summary,
            report_id: None,
        };

        // Unconditional: a stop issued mid-batch is overwritten here.
        self.release(task_id);

        outcome.report_id = self.reports.write_report(task_id, &outcome);
        if let Some(report_id) = outcome.report_id {
            self.reports.write_details(report_id, &outcome.results);
        }

        info!(
            category = "TASK_EXECUTION",
            task_id,
            %batch_id,
            status = outcome.status.as_str(),
            duration = %outcome.duration_text(),
            total_cases = outcome.summary.total,
            passed_cases = outcome.summary.passed,
            failed_cases = outcome.summary.failed,
            skipped_cases = outcome.summary.skipped,
            "Task execution finished"
        );

        Ok(outcome)
    }

    /// Best-effort move to `Done`; a failure is logged, never retried.
    fn release(&self, task_id: TaskId) {
        if let Err(e) = self.store.set_task_status(task_id, TaskStatus::Done) {
            error!(category = "TASK_EXECUTION", task_id, error = %e, "Failed to update task status");
        }
    }

    async fn run_case(&self, binding: &CaseBinding) -> CaseExecutionResult {
        let started_at = Utc::now();

        let case = match self.store.find_case_by_hash(&binding.case_hash) {
            Ok(Some(case)) => case,
            Ok(None) => {
                return unresolved(binding, started_at, "case not found".to_string());
            }
            Err(e) => {
                return unresolved(binding, started_at, format!("case not found: {:#}", e));
            }
        };

        let (status, error) = match self.executor.execute(&case).await {
            Ok(CaseOutcome::Passed) => (CaseStatus::Passed, None),
            Ok(CaseOutcome::Failed(msg)) => (CaseStatus::Failed, Some(msg)),
            Ok(CaseOutcome::Skipped(msg)) => (CaseStatus::Skipped, Some(msg)),
            Err(e) => (CaseStatus::Failed, Some(e.to_string())),
        };

        CaseExecutionResult {
            case_id: Some(case.id),
            case_hash: case.case_hash,
            name: case.case_name,
            class_name: case.class_name,
            status,
            started_at,
            finished_at: Utc::now(),
            error,
        }
    }
}

fn unresolved(binding: &CaseBinding, started_at: DateTime<Utc>, error: String) -> CaseExecutionResult {
    CaseExecutionResult {
        case_id: None,
        case_hash: binding.case_hash.clone(),
        name: binding.case_hash.clone(),
        class_name: String::new(),
        status: CaseStatus::Failed,
        started_at,
        finished_at: Utc::now(),
        error: Some(error),
    }
}
