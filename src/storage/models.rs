//! Row types shared by the store and the scheduling core.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Primary key of a task row.
pub type TaskId = i64;

/// Persisted task status. Success and failure both collapse into `Done`;
/// the latest [`TaskReport`] carries the distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Done,
}

impl TaskStatus {
    pub fn code(self) -> i64 {
        match self {
            TaskStatus::Idle => 0,
            TaskStatus::Running => 1,
            TaskStatus::Done => 2,
        }
    }

    /// Unknown codes read back as `Idle`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => TaskStatus::Running,
            2 => TaskStatus::Done,
            _ => TaskStatus::Idle,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Idle => write!(f, "idle"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Done => write!(f, "done"),
        }
    }
}

/// A schedulable unit bound to zero or more cases.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: i64,
    pub name: String,
    pub status: TaskStatus,
    pub is_scheduled: bool,
    /// Empty means manual-only.
    pub cron_expr: String,
    pub is_deleted: bool,
}

/// Fields needed to create a task row.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub project_id: i64,
    pub name: String,
    pub is_scheduled: bool,
    pub cron_expr: String,
}

/// Reference from a task to a case by content hash. The case may not exist.
#[derive(Debug, Clone, Serialize)]
pub struct CaseBinding {
    pub id: i64,
    pub task_id: TaskId,
    pub case_hash: String,
}

/// Declarative definition of one test case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub project_id: i64,
    pub file_name: String,
    pub class_name: String,
    pub case_name: String,
    pub case_doc: String,
    pub case_hash: String,
}

/// Outcome of a single case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Passed => "passed",
            CaseStatus::Failed => "failed",
            CaseStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passed" => Some(CaseStatus::Passed),
            "failed" => Some(CaseStatus::Failed),
            "skipped" => Some(CaseStatus::Skipped),
            _ => None,
        }
    }
}

/// Overall outcome of one batch, as recorded on its report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Failed,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Success => "success",
            ReportStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "failed" {
            ReportStatus::Failed
        } else {
            ReportStatus::Success
        }
    }
}

/// One per-case result row.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResultRow {
    pub task_id: TaskId,
    /// `None` when the bound hash did not resolve to a case.
    pub case_id: Option<i64>,
    pub case_hash: String,
    pub name: String,
    pub status: CaseStatus,
    pub report: String,
    pub error_message: Option<String>,
    /// Seconds.
    pub run_time: f64,
    pub created_at: DateTime<Utc>,
}

/// One row per execution batch.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: i64,
    pub task_id: TaskId,
    pub name: String,
    pub status: ReportStatus,
    pub report: String,
    pub passed: i64,
    pub failure: i64,
    pub skipped: i64,
    pub tests: i64,
    /// Batch duration as text, e.g. `"1.23s"`.
    pub run_time: String,
    pub created_at: DateTime<Utc>,
}

/// Per-case detail attached to a report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportDetail {
    pub report_id: i64,
    pub name: String,
    pub class_name: String,
    pub status: String,
    pub time: String,
    pub failure_message: String,
    pub error_out: String,
    pub skipped_message: String,
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
