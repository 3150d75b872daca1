//! Report formatting and persistence.
//!
//! Every write here is independent and fire-and-forget: failures are
//! logged, never retried, and never undo an earlier write.

use super::{BatchOutcome, CaseExecutionResult};
use crate::storage::{CaseResultRow, CaseStatus, ReportDetail, TaskId, TaskReport, TaskStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::error;

/// Batch or case duration as stored, e.g. `"1.23s"`.
pub fn format_duration(d: chrono::Duration) -> String {
    format!("{:.2}s", duration_secs(d))
}

pub fn duration_secs(d: chrono::Duration) -> f64 {
    d.num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or_else(|| d.num_milliseconds() as f64 / 1000.0)
}

/// Parse a stored duration as seconds. Accepts a bare number or one with a
/// trailing `s`.
pub fn parse_duration_secs(text: &str) -> Option<f64> {
    let text = text.trim();
    let number = text.strip_suffix('s').unwrap_or(text).trim();
    number.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

/// Human-readable body stored on the report row.
pub fn format_summary(outcome: &BatchOutcome) -> String {
    let s = &outcome.summary;
    format!(
        "Task executed with status: {} ({} case{}: {} passed, {} failed, {} skipped, pass rate {:.1}%, {})",
        outcome.status.as_str(),
        s.total,
        if s.total == 1 { "" } else { "s" },
        s.passed,
        s.failed,
        s.skipped,
        s.pass_rate,
        outcome.duration_text(),
    )
}

#[derive(Clone)]
pub struct ReportWriter {
    store: Arc<dyn TaskStore>,
}

impl ReportWriter {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Insert the batch report. Returns its id, or `None` if the write failed.
    pub fn write_report(&self, task_id: TaskId, outcome: &BatchOutcome) -> Option<i64> {
        let s = &outcome.summary;
        let row = TaskReport {
            id: 0,
            task_id,
            name: format!("Task {} Execution Report", task_id),
            status: outcome.status,
            report: format_summary(outcome),
            passed: s.passed as i64,
            failure: s.failed as i64,
            skipped: s.skipped as i64,
            tests: s.total as i64,
            run_time: outcome.duration_text(),
            created_at: outcome.finished_at,
        };

        match self.store.insert_task_report(&row) {
            Ok(id) => Some(id),
            Err(e) => {
                error!(category = "SAVE_TASK_REPORT", task_id, batch_id = %outcome.batch_id, error = %e, "Failed to save task report");
                None
            }
        }
    }

    pub fn write_case_result(&self, task_id: TaskId, result: &CaseExecutionResult) {
        let run_time = result.duration_secs();
        let row = CaseResultRow {
            task_id,
            case_id: result.case_id,
            case_hash: result.case_hash.clone(),
            name: result.name.clone(),
            status: result.status,
            report: format!("Status: {}, Duration: {:.2}s", result.status.as_str(), run_time),
            error_message: result.error.clone(),
            run_time,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert_case_result(&row) {
            error!(
                category = "SAVE_CASE_RESULT",
                task_id,
                case_hash = %result.case_hash,
                error = %e,
                "Failed to save case result"
            );
        }
    }

    /// One detail row per case, attached to `report_id`.
    pub fn write_details(&self, report_id: i64, results: &[CaseExecutionResult]) {
        let rows: Vec<ReportDetail> = results
            .iter()
            .map(|r| {
                let message = r.error.clone().unwrap_or_default();
                ReportDetail {
                    report_id,
                    name: r.name.clone(),
                    class_name: r.class_name.clone(),
                    status: r.status.as_str().to_string(),
                    time: format!("{:.2}", r.duration_secs()),
                    failure_message: if r.status == CaseStatus::Failed { message.clone() } else { String::new() },
                    error_out: String::new(),
                    skipped_message: if r.status == CaseStatus::Skipped { message } else { String::new() },
                }
            })
            .collect();

        if let Err(e) = self.store.insert_report_details(&rows) {
            error!(category = "SAVE_TASK_REPORT", report_id, error = %e, "Failed to save report details");
        }
    }
}
