//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version, recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL DEFAULT 0,
            is_scheduled INTEGER NOT NULL DEFAULT 0,
            cron_expr TEXT NOT NULL DEFAULT '',
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS test_cases (
            id INTEGER PRIMARY KEY,
            project_id INTEGER NOT NULL,
            file_name TEXT NOT NULL DEFAULT '',
            class_name TEXT NOT NULL DEFAULT '',
            case_name TEXT NOT NULL DEFAULT '',
            case_doc TEXT NOT NULL DEFAULT '',
            case_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS task_case_bindings (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL,
            case_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS case_results (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL,
            case_id INTEGER,
            case_hash TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            report TEXT NOT NULL DEFAULT '',
            error_message TEXT,
            run_time REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_reports (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            report TEXT NOT NULL DEFAULT '',
            passed INTEGER NOT NULL DEFAULT 0,
            failure INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            tests INTEGER NOT NULL DEFAULT 0,
            run_time TEXT NOT NULL DEFAULT '0',
            created_at TEXT NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS report_details (
            id INTEGER PRIMARY KEY,
            report_id INTEGER NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            class_name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            time TEXT NOT NULL DEFAULT '',
            failure_message TEXT NOT NULL DEFAULT '',
            error_out TEXT NOT NULL DEFAULT '',
            skipped_message TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (report_id) REFERENCES task_reports(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_scheduled ON tasks(is_scheduled, is_deleted);
        CREATE INDEX IF NOT EXISTS idx_test_cases_hash ON test_cases(case_hash);
        CREATE INDEX IF NOT EXISTS idx_bindings_task ON task_case_bindings(task_id);
        CREATE INDEX IF NOT EXISTS idx_case_results_task ON case_results(task_id);
        CREATE INDEX IF NOT EXISTS idx_task_reports_task_created ON task_reports(task_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_report_details_report ON report_details(report_id);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
