//! SQLite storage layer -- schema, queries, migrations.

pub mod models;
pub mod schema;
mod sqlite;

pub use self::models::*;
pub use self::sqlite::SqliteStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Task repository consumed by the scheduling core.
///
/// Every write is independent; no operation spans a transaction with
/// another.
pub trait TaskStore: Send + Sync {
    fn find_task(&self, id: TaskId) -> Result<Option<Task>>;

    fn save_task(&self, task: &Task) -> Result<()>;

    fn set_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()>;

    /// Atomically move a live task to `Running` unless it already is.
    /// Returns `false` if the task is running, deleted, or missing.
    fn claim_task(&self, id: TaskId) -> Result<bool>;

    /// Tasks with scheduling enabled and not soft-deleted.
    fn list_scheduled_tasks(&self) -> Result<Vec<Task>>;

    fn list_running_tasks(&self) -> Result<Vec<Task>>;

    fn list_case_bindings(&self, task_id: TaskId) -> Result<Vec<CaseBinding>>;

    fn find_case_by_hash(&self, hash: &str) -> Result<Option<TestCase>>;

    fn insert_case_result(&self, row: &CaseResultRow) -> Result<i64>;

    /// Insert a report and return its id. `id` on the input is ignored.
    fn insert_task_report(&self, row: &TaskReport) -> Result<i64>;

    fn insert_report_details(&self, rows: &[ReportDetail]) -> Result<()>;

    /// Reports created within `[start, end]`, oldest first.
    fn list_reports_in_window(
        &self,
        task_id: TaskId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskReport>>;

    /// Newest first. `limit == 0` returns everything.
    fn list_reports(&self, task_id: TaskId, limit: usize) -> Result<Vec<TaskReport>>;
}
