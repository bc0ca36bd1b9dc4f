//! Database schema and additive migrations
//!
//! A missing table is created in full. An existing `tasks` table is
//! migrated by inspecting its column set and adding whatever is missing;
//! there are no destructive migrations, and re-running is a no-op.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreResult;

const CREATE_TASKS: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    project_path TEXT NOT NULL,
    workflow TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    parent_id TEXT,
    subtask_ids TEXT NOT NULL DEFAULT '[]',
    priority TEXT NOT NULL DEFAULT 'normal',
    effort TEXT NOT NULL DEFAULT 'medium',
    autonomy TEXT NOT NULL DEFAULT 'autonomous',
    status TEXT NOT NULL DEFAULT 'pending',
    stage TEXT,
    stage_index INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    resume_attempts INTEGER NOT NULL DEFAULT 0,
    max_resume_attempts INTEGER NOT NULL DEFAULT 3,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    estimated_cost REAL NOT NULL DEFAULT 0,
    workspace TEXT,
    session_data TEXT,
    last_checkpoint_at TEXT,
    pause_reason TEXT,
    paused_at TEXT,
    resume_after TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
)";

/// Columns added over time; applied to databases created before the
/// column existed. (name, type-with-default)
const TASK_COLUMN_MIGRATIONS: &[(&str, &str)] = &[
    ("title", "TEXT NOT NULL DEFAULT ''"),
    ("priority", "TEXT NOT NULL DEFAULT 'normal'"),
    ("effort", "TEXT NOT NULL DEFAULT 'medium'"),
    ("autonomy", "TEXT NOT NULL DEFAULT 'autonomous'"),
    ("stage", "TEXT"),
    ("stage_index", "INTEGER NOT NULL DEFAULT 0"),
    ("retry_count", "INTEGER NOT NULL DEFAULT 0"),
    ("max_retries", "INTEGER NOT NULL DEFAULT 3"),
    ("resume_attempts", "INTEGER NOT NULL DEFAULT 0"),
    ("max_resume_attempts", "INTEGER NOT NULL DEFAULT 3"),
    ("input_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("output_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("total_tokens", "INTEGER NOT NULL DEFAULT 0"),
    ("estimated_cost", "REAL NOT NULL DEFAULT 0"),
    ("workspace", "TEXT"),
    ("session_data", "TEXT"),
    ("last_checkpoint_at", "TEXT"),
    ("pause_reason", "TEXT"),
    ("paused_at", "TEXT"),
    ("resume_after", "TEXT"),
    ("last_error", "TEXT"),
    ("completed_at", "TEXT"),
];

const CREATE_TASK_DEPENDENCIES: &str = "
CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on)
)";

const CREATE_CHECKPOINTS: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    stage TEXT NOT NULL,
    stage_index INTEGER NOT NULL DEFAULT 0,
    conversation TEXT NOT NULL,
    stage_state TEXT,
    metadata TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (task_id, sequence)
)";

const CREATE_TASK_LOGS: &str = "
CREATE TABLE IF NOT EXISTS task_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    level TEXT NOT NULL DEFAULT 'info',
    stage TEXT,
    agent TEXT,
    message TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL
)";

const CREATE_ARTIFACTS: &str = "
CREATE TABLE IF NOT EXISTS artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    path TEXT,
    content TEXT,
    created_at TEXT NOT NULL
)";

const CREATE_GATES: &str = "
CREATE TABLE IF NOT EXISTS gates (
    task_id TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    required_at TEXT NOT NULL,
    responded_at TEXT,
    approver TEXT,
    comment TEXT,
    PRIMARY KEY (task_id, name)
)";

const CREATE_IDLE_TASKS: &str = "
CREATE TABLE IF NOT EXISTS idle_tasks (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    rationale TEXT NOT NULL DEFAULT '',
    priority TEXT NOT NULL DEFAULT 'low',
    estimated_effort TEXT NOT NULL DEFAULT 'medium',
    suggested_workflow TEXT,
    implemented INTEGER NOT NULL DEFAULT 0,
    promoted_task_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks (updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks (parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_deps_depends_on ON task_dependencies (depends_on)",
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON checkpoints (task_id, sequence)",
    "CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs (task_id)",
    "CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts (task_id)",
];

/// Create missing tables and apply additive column migrations
pub fn ensure_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("BEGIN")?;
    let result = apply_schema(conn);
    match result {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(_) => conn.execute_batch("ROLLBACK")?,
    }
    result
}

fn apply_schema(conn: &Connection) -> StoreResult<()> {
    for stmt in [
        CREATE_TASKS,
        CREATE_TASK_DEPENDENCIES,
        CREATE_CHECKPOINTS,
        CREATE_TASK_LOGS,
        CREATE_ARTIFACTS,
        CREATE_GATES,
        CREATE_IDLE_TASKS,
    ] {
        conn.execute(stmt, [])?;
    }

    migrate_task_columns(conn)?;

    for stmt in CREATE_INDEXES {
        conn.execute(stmt, [])?;
    }

    Ok(())
}

/// Add columns that a pre-existing tasks table may be missing
fn migrate_task_columns(conn: &Connection) -> StoreResult<()> {
    let existing = table_columns(conn, "tasks")?;
    let mut added = 0;

    for (name, definition) in TASK_COLUMN_MIGRATIONS {
        if !existing.iter().any(|c| c == name) {
            debug!(column = name, "adding missing tasks column");
            conn.execute(
                &format!("ALTER TABLE tasks ADD COLUMN {} {}", name, definition),
                [],
            )?;
            added += 1;
        }
    }

    if added > 0 {
        info!(added, "migrated tasks table");
    }
    Ok(())
}

/// Column names of a table, in declaration order
pub fn table_columns(conn: &Connection, table: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_ensure_schema_creates_tables() {
        let conn = memory_conn();
        ensure_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN \
                 ('tasks','task_dependencies','checkpoints','task_logs','artifacts','gates','idle_tasks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 7);
    }

    #[test]
    fn test_ensure_schema_is_idempotent() {
        let conn = memory_conn();
        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();

        let columns = table_columns(&conn, "tasks").unwrap();
        let unique: std::collections::HashSet<_> = columns.iter().collect();
        assert_eq!(columns.len(), unique.len());
    }

    #[test]
    fn test_migrates_legacy_tasks_table() {
        let conn = memory_conn();
        // A minimal table from before the pause/resume and usage columns existed
        conn.execute(
            "CREATE TABLE tasks (
                id TEXT PRIMARY KEY,
                project_path TEXT NOT NULL,
                workflow TEXT NOT NULL,
                parent_id TEXT,
                subtask_ids TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .unwrap();

        ensure_schema(&conn).unwrap();

        let columns = table_columns(&conn, "tasks").unwrap();
        for required in [
            "priority",
            "effort",
            "resume_attempts",
            "pause_reason",
            "paused_at",
            "resume_after",
            "workspace",
            "session_data",
            "estimated_cost",
        ] {
            assert!(
                columns.iter().any(|c| c == required),
                "missing migrated column {}",
                required
            );
        }
    }
}
