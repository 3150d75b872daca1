use super::models::*;
use super::{Pool, TaskStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const TASK_COLUMNS: &str = "id, project_id, name, status, is_scheduled, cron_expr, is_deleted";
const REPORT_COLUMNS: &str =
    "id, task_id, name, status, report, passed, failure, skipped, tests, run_time, created_at";

/// `TaskStore` backed by the pooled SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(super::open_pool(path)?))
    }

    /// Owning project for tasks and cases; only its id is referenced.
    pub fn insert_project(&self, name: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute("INSERT INTO projects (name) VALUES (?1)", params![name])
            .context("Failed to insert project")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_task(&self, task: &NewTask) -> Result<TaskId> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO tasks (project_id, name, is_scheduled, cron_expr) VALUES (?1, ?2, ?3, ?4)",
            params![task.project_id, task.name, task.is_scheduled, task.cron_expr],
        )
        .context("Failed to insert task")?;
        Ok(conn.last_insert_rowid())
    }

    /// Soft delete: the row stays, scheduling ignores it.
    pub fn delete_task(&self, id: TaskId) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tasks SET is_deleted = 1, updated_at = ?2 WHERE id = ?1",
            params![id, format_ts(Utc::now())],
        )
        .context("Failed to delete task")?;
        Ok(())
    }

    pub fn insert_case(&self, case: &TestCase) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO test_cases (project_id, file_name, class_name, case_name, case_doc, case_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                case.project_id,
                case.file_name,
                case.class_name,
                case.case_name,
                case.case_doc,
                case.case_hash
            ],
        )
        .context("Failed to insert test case")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn bind_case(&self, task_id: TaskId, case_hash: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO task_case_bindings (task_id, case_hash) VALUES (?1, ?2)",
            params![task_id, case_hash],
        )
        .context("Failed to bind case")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_case_results(&self, task_id: TaskId) -> Result<Vec<CaseResultRow>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, case_id, case_hash, name, status, report, error_message, run_time, created_at
             FROM case_results WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            let status: String = row.get(4)?;
            let created_at: String = row.get(8)?;
            Ok(CaseResultRow {
                task_id: row.get(0)?,
                case_id: row.get(1)?,
                case_hash: row.get(2)?,
                name: row.get(3)?,
                status: CaseStatus::parse(&status).unwrap_or(CaseStatus::Failed),
                report: row.get(5)?,
                error_message: row.get(6)?,
                run_time: row.get(7)?,
                created_at: parse_ts(&created_at).unwrap_or_default(),
            })
        })?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    pub fn list_report_details(&self, report_id: i64) -> Result<Vec<ReportDetail>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT report_id, name, class_name, status, time, failure_message, error_out, skipped_message
             FROM report_details WHERE report_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![report_id], |row| {
            Ok(ReportDetail {
                report_id: row.get(0)?,
                name: row.get(1)?,
                class_name: row.get(2)?,
                status: row.get(3)?,
                time: row.get(4)?,
                failure_message: row.get(5)?,
                error_out: row.get(6)?,
                skipped_message: row.get(7)?,
            })
        })?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    fn query_tasks(&self, filter: &str) -> Result<Vec<Task>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE {} ORDER BY id",
            TASK_COLUMNS, filter
        ))?;
        let rows = stmt.query_map([], task_from_row)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        status: TaskStatus::from_code(row.get(3)?),
        is_scheduled: row.get(4)?,
        cron_expr: row.get(5)?,
        is_deleted: row.get(6)?,
    })
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<TaskReport> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(10)?;
    Ok(TaskReport {
        id: row.get(0)?,
        task_id: row.get(1)?,
        name: row.get(2)?,
        status: ReportStatus::parse(&status),
        report: row.get(4)?,
        passed: row.get(5)?,
        failure: row.get(6)?,
        skipped: row.get(7)?,
        tests: row.get(8)?,
        run_time: row.get(9)?,
        created_at: parse_ts(&created_at).unwrap_or_default(),
    })
}

impl TaskStore for SqliteStore {
    fn find_task(&self, id: TaskId) -> Result<Option<Task>> {
        let conn = self.pool.get()?;
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                task_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to load task {}", id))?;
        Ok(task)
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tasks SET project_id = ?2, name = ?3, status = ?4, is_scheduled = ?5,
                 cron_expr = ?6, is_deleted = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                task.id,
                task.project_id,
                task.name,
                task.status.code(),
                task.is_scheduled,
                task.cron_expr,
                task.is_deleted,
                format_ts(Utc::now())
            ],
        )
        .with_context(|| format!("Failed to save task {}", task.id))?;
        Ok(())
    }

    fn set_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.code(), format_ts(Utc::now())],
        )
        .with_context(|| format!("Failed to update status of task {}", id))?;
        Ok(())
    }

    fn claim_task(&self, id: TaskId) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND status != ?2 AND is_deleted = 0",
                params![id, TaskStatus::Running.code(), format_ts(Utc::now())],
            )
            .with_context(|| format!("Failed to claim task {}", id))?;
        Ok(changed == 1)
    }

    fn list_scheduled_tasks(&self) -> Result<Vec<Task>> {
        self.query_tasks("is_scheduled = 1 AND is_deleted = 0")
    }

    fn list_running_tasks(&self) -> Result<Vec<Task>> {
        self.query_tasks("status = 1 AND is_deleted = 0")
    }

    fn list_case_bindings(&self, task_id: TaskId) -> Result<Vec<CaseBinding>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, case_hash FROM task_case_bindings WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(CaseBinding {
                id: row.get(0)?,
                task_id: row.get(1)?,
                case_hash: row.get(2)?,
            })
        })?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    fn find_case_by_hash(&self, hash: &str) -> Result<Option<TestCase>> {
        let conn = self.pool.get()?;
        let case = conn
            .query_row(
                "SELECT id, project_id, file_name, class_name, case_name, case_doc, case_hash
                 FROM test_cases WHERE case_hash = ?1 ORDER BY id LIMIT 1",
                params![hash],
                |row| {
                    Ok(TestCase {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        file_name: row.get(2)?,
                        class_name: row.get(3)?,
                        case_name: row.get(4)?,
                        case_doc: row.get(5)?,
                        case_hash: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to look up case by hash")?;
        Ok(case)
    }

    fn insert_case_result(&self, row: &CaseResultRow) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO case_results
                (task_id, case_id, case_hash, name, status, report, error_message, run_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.task_id,
                row.case_id,
                row.case_hash,
                row.name,
                row.status.as_str(),
                row.report,
                row.error_message,
                row.run_time,
                format_ts(row.created_at)
            ],
        )
        .context("Failed to insert case result")?;
        Ok(conn.last_insert_rowid())
    }

    fn insert_task_report(&self, row: &TaskReport) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO task_reports
                (task_id, name, status, report, passed, failure, skipped, tests, run_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.task_id,
                row.name,
                row.status.as_str(),
                row.report,
                row.passed,
                row.failure,
                row.skipped,
                row.tests,
                row.run_time,
                format_ts(row.created_at)
            ],
        )
        .context("Failed to insert task report")?;
        Ok(conn.last_insert_rowid())
    }

    fn insert_report_details(&self, rows: &[ReportDetail]) -> Result<()> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "INSERT INTO report_details
                (report_id, name, class_name, status, time, failure_message, error_out, skipped_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for d in rows {
            stmt.execute(params![
                d.report_id,
                d.name,
                d.class_name,
                d.status,
                d.time,
                d.failure_message,
                d.error_out,
                d.skipped_message
            ])
            .context("Failed to insert report detail")?;
        }
        Ok(())
    }

    fn list_reports_in_window(
        &self,
        task_id: TaskId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskReport>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM task_reports
             WHERE task_id = ?1 AND created_at BETWEEN ?2 AND ?3
             ORDER BY created_at ASC",
            REPORT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![task_id, format_ts(start), format_ts(end)],
            report_from_row,
        )?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    fn list_reports(&self, task_id: TaskId, limit: usize) -> Result<Vec<TaskReport>> {
        let conn = self.pool.get()?;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM task_reports WHERE task_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
            REPORT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![task_id, limit], report_from_row)?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }
}
