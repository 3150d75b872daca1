//! Run history and success-rate statistics over persisted reports.

use super::SchedulerResult;
use crate::runner::report::parse_duration_secs;
use crate::storage::{ReportStatus, TaskId, TaskReport, TaskStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Aggregate statistics for one task over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStats {
    pub task_id: TaskId,
    pub period_days: u32,
    pub total_runs: usize,
    pub success_runs: usize,
    pub failed_runs: usize,
    /// Percentage, 0 when there were no runs.
    pub success_rate: f64,
    /// Mean over reports whose duration text parses; unparsable ones are
    /// left out of both sum and count.
    pub avg_duration_secs: f64,
}

#[derive(Clone)]
pub struct StatisticsAggregator {
    store: Arc<dyn TaskStore>,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn stats(&self, task_id: TaskId, days: u32) -> SchedulerResult<TaskStats> {
        self.stats_at(task_id, days, Utc::now())
    }

    /// Statistics over `[now - days, now]`. A window reaching past the
    /// earliest representable instant starts there instead.
    pub fn stats_at(&self, task_id: TaskId, days: u32, now: DateTime<Utc>) -> SchedulerResult<TaskStats> {
        let start = chrono::Duration::try_days(i64::from(days))
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reports = self.store.list_reports_in_window(task_id, start, now)?;
        Ok(summarize(task_id, days, &reports))
    }

    /// Newest reports first; `limit == 0` returns all of them.
    pub fn history(&self, task_id: TaskId, limit: usize) -> SchedulerResult<Vec<TaskReport>> {
        Ok(self.store.list_reports(task_id, limit)?)
    }
}

fn summarize(task_id: TaskId, period_days: u32, reports: &[TaskReport]) -> TaskStats {
    let total_runs = reports.len();
    let success_runs = reports
        .iter()
        .filter(|r| r.status == ReportStatus::Success)
        .count();
    let failed_runs = total_runs - success_runs;

    let success_rate = if total_runs > 0 {
        success_runs as f64 / total_runs as f64 * 100.0
    } else {
        0.0
    };

    let durations: Vec<f64> = reports
        .iter()
        .filter_map(|r| parse_duration_secs(&r.run_time))
        .collect();
    let avg_duration_secs = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    TaskStats {
        task_id,
        period_days,
        total_runs,
        success_runs,
        failed_runs,
        success_rate,
        avg_duration_secs,
    }
}
