//! Task operations
//!
//! All task reads and writes, including the canonical priority ordering.
//! Ordering is enforced in the query rather than an in-memory queue so the
//! queue survives restarts and stays consistent with ad-hoc inserts.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::deps;
use crate::error::{StoreError, StoreResult};
use crate::store::Store;
use crate::task::{
    Artifact, Autonomy, Effort, LogEntry, LogLevel, PauseReason, Priority, SessionData, Task,
    TaskStatus, TaskUsage,
};
use crate::time::{parse_iso, parse_iso_opt, to_iso};

/// Canonical sort: (priority rank, effort rank, created_at ascending).
/// Unknown priority sorts last (rank 5); unknown effort sorts as medium.
pub const PRIORITY_ORDER: &str = "\
CASE priority WHEN 'urgent' THEN 1 WHEN 'high' THEN 2 WHEN 'normal' THEN 3 WHEN 'low' THEN 4 ELSE 5 END, \
CASE effort WHEN 'xs' THEN 1 WHEN 'small' THEN 2 WHEN 'medium' THEN 3 WHEN 'large' THEN 4 WHEN 'xl' THEN 5 ELSE 3 END, \
created_at ASC";

const TASK_COLUMNS: &str = "\
id, project_path, workflow, title, parent_id, subtask_ids, priority, effort, autonomy, \
status, stage, stage_index, retry_count, max_retries, resume_attempts, max_resume_attempts, \
input_tokens, output_tokens, total_tokens, estimated_cost, workspace, session_data, \
last_checkpoint_at, pause_reason, paused_at, resume_after, last_error, \
created_at, updated_at, completed_at";

/// Pause reasons eligible for automatic resume, as a SQL list
const AUTO_RESUMABLE_REASONS: &str = "('usage_limit','budget','capacity','container_failure')";

/// Partial update of a task row. `None` leaves the field untouched;
/// for nullable columns the inner `Option` distinguishes "set" from
/// "clear". `updated_at` is auto-bumped unless explicitly provided.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub effort: Option<Effort>,
    pub autonomy: Option<Autonomy>,
    pub stage: Option<Option<String>>,
    pub stage_index: Option<u32>,
    pub retry_count: Option<u32>,
    pub resume_attempts: Option<u32>,
    pub usage: Option<TaskUsage>,
    pub workspace: Option<Option<String>>,
    pub session: Option<Option<SessionData>>,
    pub last_checkpoint_at: Option<Option<DateTime<Utc>>>,
    pub pause_reason: Option<Option<PauseReason>>,
    pub paused_at: Option<Option<DateTime<Utc>>>,
    pub resume_after: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    /// Update that only changes the status
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// True when no field would be written
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.effort.is_none()
            && self.autonomy.is_none()
            && self.stage.is_none()
            && self.stage_index.is_none()
            && self.retry_count.is_none()
            && self.resume_attempts.is_none()
            && self.usage.is_none()
            && self.workspace.is_none()
            && self.session.is_none()
            && self.last_checkpoint_at.is_none()
            && self.pause_reason.is_none()
            && self.paused_at.is_none()
            && self.resume_after.is_none()
            && self.last_error.is_none()
            && self.completed_at.is_none()
            && self.updated_at.is_none()
    }
}

/// Filter for list_tasks
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub workflow: Option<String>,
    pub parent_id: Option<String>,
    /// Sort by the canonical priority key instead of creation order
    pub order_by_priority: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Store {
    /// Insert a new task and its dependency edges atomically.
    /// Rejects dependency sets that would form a cycle.
    pub fn create_task(&mut self, task: Task) -> StoreResult<Task> {
        let id = task.id.clone();
        debug!(task_id = %id, workflow = %task.workflow, "create_task");

        self.with_tx(|tx| {
            if task_exists(tx, &task.id)? {
                return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
            }

            if let Some(parent_id) = &task.parent_id {
                if !task_exists(tx, parent_id)? {
                    return Err(StoreError::NotFound(format!("parent task {}", parent_id)));
                }
                ensure_parent_chain_acyclic(tx, &task.id, parent_id)?;
            }

            insert_task_row(tx, &task)?;

            for dep in &task.depends_on {
                deps::insert_dependency(tx, &task.id, dep)?;
            }

            if let Some(parent_id) = &task.parent_id {
                append_subtask(tx, parent_id, &task.id)?;
            }

            Ok(())
        })?;

        self.get_task(&id)?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
    }

    /// Fetch a task with its logs, artifacts, dependency set, and the
    /// subset of dependencies that still block it.
    pub fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let task = self
            .conn
            .query_row(&sql, params![id], map_task_row)
            .optional()?;

        let Some(mut task) = task else {
            return Ok(None);
        };

        task.depends_on = deps::dependencies_of(&self.conn, id)?;
        task.blocked_by = deps::blocking_dependencies_of(&self.conn, id)?;
        task.logs = load_logs(&self.conn, id)?;
        task.artifacts = load_artifacts(&self.conn, id)?;
        Ok(Some(task))
    }

    /// Apply a partial update. Only provided fields are written;
    /// `updated_at` is auto-bumped unless explicitly overridden.
    pub fn update_task(&mut self, id: &str, update: TaskUpdate) -> StoreResult<()> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        let mut push = |sets: &mut Vec<String>, column: &str, value: SqlValue| {
            sets.push(format!("{} = ?{}", column, values.len() + 1));
            values.push(value);
        };

        if let Some(v) = &update.title {
            push(&mut sets, "title", SqlValue::Text(v.clone()));
        }
        if let Some(v) = update.status {
            push(&mut sets, "status", SqlValue::Text(v.to_string()));
        }
        if let Some(v) = update.priority {
            push(&mut sets, "priority", SqlValue::Text(v.to_string()));
        }
        if let Some(v) = update.effort {
            push(&mut sets, "effort", SqlValue::Text(v.to_string()));
        }
        if let Some(v) = update.autonomy {
            push(&mut sets, "autonomy", SqlValue::Text(v.to_string()));
        }
        if let Some(v) = &update.stage {
            push(&mut sets, "stage", opt_text(v.clone()));
        }
        if let Some(v) = update.stage_index {
            push(&mut sets, "stage_index", SqlValue::Integer(v as i64));
        }
        if let Some(v) = update.retry_count {
            push(&mut sets, "retry_count", SqlValue::Integer(v as i64));
        }
        if let Some(v) = update.resume_attempts {
            push(&mut sets, "resume_attempts", SqlValue::Integer(v as i64));
        }
        if let Some(usage) = update.usage {
            push(&mut sets, "input_tokens", SqlValue::Integer(usage.input_tokens as i64));
            push(&mut sets, "output_tokens", SqlValue::Integer(usage.output_tokens as i64));
            push(&mut sets, "total_tokens", SqlValue::Integer(usage.total_tokens as i64));
            push(&mut sets, "estimated_cost", SqlValue::Real(usage.estimated_cost));
        }
        if let Some(v) = &update.workspace {
            push(&mut sets, "workspace", opt_text(v.clone()));
        }
        if let Some(v) = &update.session {
            let encoded = v.as_ref().map(serde_json::to_string).transpose()?;
            push(&mut sets, "session_data", opt_text(encoded));
        }
        if let Some(v) = update.last_checkpoint_at {
            push(&mut sets, "last_checkpoint_at", opt_text(v.map(to_iso)));
        }
        if let Some(v) = update.pause_reason {
            push(&mut sets, "pause_reason", opt_text(v.map(|r| r.to_string())));
        }
        if let Some(v) = update.paused_at {
            push(&mut sets, "paused_at", opt_text(v.map(to_iso)));
        }
        if let Some(v) = update.resume_after {
            push(&mut sets, "resume_after", opt_text(v.map(to_iso)));
        }
        if let Some(v) = &update.last_error {
            push(&mut sets, "last_error", opt_text(v.clone()));
        }
        if let Some(v) = update.completed_at {
            push(&mut sets, "completed_at", opt_text(v.map(to_iso)));
        }

        let updated_at = update.updated_at.unwrap_or_else(Utc::now);
        push(&mut sets, "updated_at", SqlValue::Text(to_iso(updated_at)));

        let sql = format!(
            "UPDATE tasks SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len() + 1
        );
        values.push(SqlValue::Text(id.to_string()));

        let changed = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(values))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    /// Status transition with the standard side effects: `completed` sets
    /// `completed_at` and resets the resume counter; `paused` sets
    /// `paused_at` and takes `message` as the pause reason; `failed` and
    /// `cancelled` record `message` as the error.
    pub fn update_task_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        stage: Option<&str>,
        message: Option<&str>,
    ) -> StoreResult<()> {
        debug!(task_id = %id, %status, ?stage, "update_task_status");
        let mut update = TaskUpdate::status(status);
        if let Some(stage) = stage {
            update.stage = Some(Some(stage.to_string()));
        }

        match status {
            TaskStatus::Completed => {
                update.completed_at = Some(Some(Utc::now()));
                update.resume_attempts = Some(0);
            }
            TaskStatus::Paused => {
                update.paused_at = Some(Some(Utc::now()));
                let reason = message
                    .and_then(|m| m.parse::<PauseReason>().ok())
                    .unwrap_or(PauseReason::Other);
                update.pause_reason = Some(Some(reason));
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                update.last_error = Some(message.map(str::to_string));
            }
            TaskStatus::Pending | TaskStatus::InProgress => {}
        }

        self.update_task(id, update)
    }

    /// List tasks matching a filter
    pub fn list_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(status) = filter.status {
            values.push(SqlValue::Text(status.to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(workflow) = &filter.workflow {
            values.push(SqlValue::Text(workflow.clone()));
            clauses.push(format!("workflow = ?{}", values.len()));
        }
        if let Some(parent) = &filter.parent_id {
            values.push(SqlValue::Text(parent.clone()));
            clauses.push(format!("parent_id = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM tasks", TASK_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(if filter.order_by_priority {
            PRIORITY_ORDER
        } else {
            "created_at ASC"
        });
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {}", offset));
            }
        }

        self.query_tasks(&sql, values)
    }

    /// Pending tasks whose every dependency is completed or cancelled,
    /// in canonical priority order when requested.
    pub fn get_ready_tasks(&self, limit: usize, order_by_priority: bool) -> StoreResult<Vec<Task>> {
        let order = if order_by_priority {
            PRIORITY_ORDER
        } else {
            "created_at ASC"
        };
        let sql = format!(
            "SELECT {} FROM tasks t WHERE t.status = 'pending' AND NOT EXISTS (\
             SELECT 1 FROM task_dependencies d JOIN tasks b ON b.id = d.depends_on \
             WHERE d.task_id = t.id AND b.status NOT IN ('completed','cancelled')) \
             ORDER BY {} LIMIT {}",
            TASK_COLUMNS, order, limit
        );
        self.query_tasks(&sql, Vec::new())
    }

    /// Paused tasks eligible for automatic resume: auto-resumable pause
    /// reason and no future `resume_after` hold.
    pub fn get_paused_tasks_for_resume(&self) -> StoreResult<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'paused' \
             AND pause_reason IN {} \
             AND (resume_after IS NULL OR resume_after <= ?1) \
             ORDER BY {}",
            TASK_COLUMNS, AUTO_RESUMABLE_REASONS, PRIORITY_ORDER
        );
        self.query_tasks(&sql, vec![SqlValue::Text(to_iso(Utc::now()))])
    }

    /// Highest-priority resumable parent task (one with subtasks), if any.
    /// Parents gate their subtasks, so they resume first.
    pub fn find_highest_priority_parent_task(&self) -> StoreResult<Option<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'paused' \
             AND pause_reason IN {} \
             AND (resume_after IS NULL OR resume_after <= ?1) \
             AND subtask_ids IS NOT NULL AND subtask_ids != '[]' \
             ORDER BY {} LIMIT 1",
            TASK_COLUMNS, AUTO_RESUMABLE_REASONS, PRIORITY_ORDER
        );
        Ok(self
            .query_tasks(&sql, vec![SqlValue::Text(to_iso(Utc::now()))])?
            .into_iter()
            .next())
    }

    /// Earliest future `resume_after` among auto-resumable paused tasks,
    /// used to schedule their re-evaluation.
    pub fn next_resume_deadline(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let min: Option<String> = self.conn.query_row(
            &format!(
                "SELECT MIN(resume_after) FROM tasks WHERE status = 'paused' \
                 AND pause_reason IN {} AND resume_after > ?1",
                AUTO_RESUMABLE_REASONS
            ),
            params![to_iso(Utc::now())],
            |row| row.get(0),
        )?;
        min.map(|raw| crate::time::parse_iso(&raw)).transpose()
    }

    /// In-progress tasks whose `updated_at` is older than the staleness
    /// cutoff, oldest first.
    pub fn get_orphaned_tasks(&self, staleness: Duration) -> StoreResult<Vec<Task>> {
        let cutoff = Utc::now() - staleness;
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'in_progress' AND updated_at < ?1 \
             ORDER BY updated_at ASC",
            TASK_COLUMNS
        );
        self.query_tasks(&sql, vec![SqlValue::Text(to_iso(cutoff))])
    }

    /// Delete a task and everything attached to it
    pub fn delete_task(&mut self, id: &str) -> StoreResult<()> {
        self.with_tx(|tx| {
            let changed = tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("task {}", id)));
            }
            tx.execute(
                "DELETE FROM task_dependencies WHERE task_id = ?1 OR depends_on = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM checkpoints WHERE task_id = ?1", params![id])?;
            tx.execute("DELETE FROM task_logs WHERE task_id = ?1", params![id])?;
            tx.execute("DELETE FROM artifacts WHERE task_id = ?1", params![id])?;
            tx.execute("DELETE FROM gates WHERE task_id = ?1", params![id])?;
            Ok(())
        })
    }

    /// Task counts grouped by status
    pub fn count_tasks_by_status(&self) -> StoreResult<Vec<(TaskStatus, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, count(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row?;
            if let Ok(status) = status.parse::<TaskStatus>() {
                counts.push((status, count as u64));
            }
        }
        Ok(counts)
    }

    fn query_tasks(&self, sql: &str, values: Vec<SqlValue>) -> StoreResult<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql)?;
        let tasks = stmt
            .query_map(rusqlite::params_from_iter(values), map_task_row)?
            .collect::<Result<Vec<_>, _>>()?;

        // Dependency sets are loaded eagerly so callers can inspect
        // blocked_by without another query.
        let mut out = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.depends_on = deps::dependencies_of(&self.conn, &task.id)?;
            task.blocked_by = deps::blocking_dependencies_of(&self.conn, &task.id)?;
            out.push(task);
        }
        Ok(out)
    }
}

fn opt_text(value: Option<String>) -> SqlValue {
    match value {
        Some(v) => SqlValue::Text(v),
        None => SqlValue::Null,
    }
}

fn task_exists(conn: &Connection, id: &str) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

/// Walk the parent chain from `parent_id` upward; the new task must not
/// already appear in it (parent/subtask relations stay a DAG).
fn ensure_parent_chain_acyclic(conn: &Connection, task_id: &str, parent_id: &str) -> StoreResult<()> {
    let mut current = Some(parent_id.to_string());
    let mut hops = 0usize;
    while let Some(id) = current {
        if id == task_id {
            return Err(StoreError::InvalidDependency(format!(
                "task {} would be its own ancestor",
                task_id
            )));
        }
        hops += 1;
        if hops > 10_000 {
            return Err(StoreError::InvalidDependency(
                "parent chain too deep".to_string(),
            ));
        }
        current = conn
            .query_row(
                "SELECT parent_id FROM tasks WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
    }
    Ok(())
}

fn insert_task_row(conn: &Connection, task: &Task) -> StoreResult<()> {
    let session = task
        .session
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO tasks (\
            id, project_path, workflow, title, parent_id, subtask_ids, priority, effort, autonomy, \
            status, stage, stage_index, retry_count, max_retries, resume_attempts, max_resume_attempts, \
            input_tokens, output_tokens, total_tokens, estimated_cost, workspace, session_data, \
            last_checkpoint_at, pause_reason, paused_at, resume_after, last_error, \
            created_at, updated_at, completed_at) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29,?30)",
        params![
            task.id,
            task.project_path,
            task.workflow,
            task.title,
            task.parent_id,
            serde_json::to_string(&task.subtask_ids)?,
            task.priority.to_string(),
            task.effort.to_string(),
            task.autonomy.to_string(),
            task.status.to_string(),
            task.stage,
            task.stage_index as i64,
            task.retry_count as i64,
            task.max_retries as i64,
            task.resume_attempts as i64,
            task.max_resume_attempts as i64,
            task.usage.input_tokens as i64,
            task.usage.output_tokens as i64,
            task.usage.total_tokens as i64,
            task.usage.estimated_cost,
            task.workspace,
            session,
            task.last_checkpoint_at.map(to_iso),
            task.pause_reason.map(|r| r.to_string()),
            task.paused_at.map(to_iso),
            task.resume_after.map(to_iso),
            task.last_error,
            to_iso(task.created_at),
            to_iso(task.updated_at),
            task.completed_at.map(to_iso),
        ],
    )?;
    Ok(())
}

fn append_subtask(conn: &Connection, parent_id: &str, child_id: &str) -> StoreResult<()> {
    let raw: String = conn.query_row(
        "SELECT subtask_ids FROM tasks WHERE id = ?1",
        params![parent_id],
        |row| row.get(0),
    )?;
    let mut subtasks: Vec<String> = serde_json::from_str(&raw)?;
    if !subtasks.iter().any(|s| s == child_id) {
        subtasks.push(child_id.to_string());
        conn.execute(
            "UPDATE tasks SET subtask_ids = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&subtasks)?,
                to_iso(Utc::now()),
                parent_id
            ],
        )?;
    }
    Ok(())
}

fn map_task_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    task_from_row(row)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e))
}

fn task_from_row(row: &Row<'_>) -> Result<Task, Box<dyn std::error::Error + Send + Sync>> {
    let subtask_ids: Vec<String> = serde_json::from_str(&row.get::<_, String>(5)?)?;
    let session: Option<SessionData> = row
        .get::<_, Option<String>>(21)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(Task {
        id: row.get(0)?,
        project_path: row.get(1)?,
        workflow: row.get(2)?,
        title: row.get(3)?,
        parent_id: row.get(4)?,
        subtask_ids,
        depends_on: Vec::new(),
        blocked_by: Vec::new(),
        priority: row
            .get::<_, String>(6)?
            .parse::<Priority>()
            .unwrap_or_default(),
        effort: row
            .get::<_, String>(7)?
            .parse::<Effort>()
            .unwrap_or_default(),
        autonomy: row
            .get::<_, String>(8)?
            .parse::<Autonomy>()
            .unwrap_or_default(),
        status: row
            .get::<_, String>(9)?
            .parse::<TaskStatus>()
            .unwrap_or_default(),
        stage: row.get(10)?,
        stage_index: row.get::<_, i64>(11)? as u32,
        retry_count: row.get::<_, i64>(12)? as u32,
        max_retries: row.get::<_, i64>(13)? as u32,
        resume_attempts: row.get::<_, i64>(14)? as u32,
        max_resume_attempts: row.get::<_, i64>(15)? as u32,
        usage: TaskUsage {
            input_tokens: row.get::<_, i64>(16)? as u64,
            output_tokens: row.get::<_, i64>(17)? as u64,
            total_tokens: row.get::<_, i64>(18)? as u64,
            estimated_cost: row.get(19)?,
        },
        workspace: row.get(20)?,
        session,
        last_checkpoint_at: parse_iso_opt(row.get(22)?)?,
        pause_reason: row
            .get::<_, Option<String>>(23)?
            .and_then(|r| r.parse::<PauseReason>().ok()),
        paused_at: parse_iso_opt(row.get(24)?)?,
        resume_after: parse_iso_opt(row.get(25)?)?,
        last_error: row.get(26)?,
        created_at: parse_iso(&row.get::<_, String>(27)?)?,
        updated_at: parse_iso(&row.get::<_, String>(28)?)?,
        completed_at: parse_iso_opt(row.get(29)?)?,
        logs: Vec::new(),
        artifacts: Vec::new(),
    })
}

fn load_logs(conn: &Connection, task_id: &str) -> StoreResult<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, level, stage, agent, message, metadata, created_at \
         FROM task_logs WHERE task_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![task_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut logs = Vec::new();
    for row in rows {
        let (id, task_id, level, stage, agent, message, metadata, created_at) = row?;
        logs.push(LogEntry {
            id,
            task_id,
            level: level.parse::<LogLevel>().unwrap_or_default(),
            stage,
            agent,
            message,
            metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
            created_at: parse_iso(&created_at)?,
        });
    }
    Ok(logs)
}

fn load_artifacts(conn: &Connection, task_id: &str) -> StoreResult<Vec<Artifact>> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, name, kind, path, content, created_at \
         FROM artifacts WHERE task_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![task_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;

    let mut artifacts = Vec::new();
    for row in rows {
        let (id, task_id, name, kind, path, content, created_at) = row?;
        artifacts.push(Artifact {
            id,
            task_id,
            name,
            kind,
            path,
            content,
            created_at: parse_iso(&created_at)?,
        });
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SessionData;
    use chrono::TimeZone;

    fn store() -> Store {
        Store::in_memory().unwrap()
    }

    fn quick_task(store: &mut Store, title: &str) -> Task {
        store
            .create_task(Task::new("/proj", "default", title))
            .unwrap()
    }

    #[test]
    fn test_create_then_get_round_trips() {
        let mut store = store();
        let dep = quick_task(&mut store, "dep");

        let task = Task::new("/proj", "default", "main work")
            .with_priority(Priority::High)
            .with_effort(Effort::Small)
            .with_autonomy(Autonomy::ReviewBeforeMerge)
            .with_dependency(&dep.id);
        let created = store.create_task(task.clone()).unwrap();

        let loaded = store.get_task(&created.id).unwrap().unwrap();
        assert_eq!(loaded.title, "main work");
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.effort, Effort::Small);
        assert_eq!(loaded.autonomy, Autonomy::ReviewBeforeMerge);
        assert_eq!(loaded.depends_on, vec![dep.id.clone()]);
        assert_eq!(loaded.blocked_by, vec![dep.id]);
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[test]
    fn test_create_duplicate_id_rejected() {
        let mut store = store();
        let task = quick_task(&mut store, "once");
        let again = Task::with_id(&task.id, "/proj", "default", "twice");
        assert!(matches!(
            store.create_task(again),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_create_rejects_cyclic_dependency() {
        let mut store = store();
        let a = quick_task(&mut store, "a");
        let b = store
            .create_task(Task::new("/proj", "default", "b").with_dependency(&a.id))
            .unwrap();

        // a -> b would close the cycle a -> b -> a
        let err = store.add_dependency(&a.id, &b.id).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDependency(_)));
    }

    #[test]
    fn test_parent_links_and_subtask_ordering() {
        let mut store = store();
        let parent = quick_task(&mut store, "parent");
        let c1 = store
            .create_task(Task::new("/proj", "default", "c1").with_parent(&parent.id))
            .unwrap();
        let c2 = store
            .create_task(Task::new("/proj", "default", "c2").with_parent(&parent.id))
            .unwrap();

        let parent = store.get_task(&parent.id).unwrap().unwrap();
        assert_eq!(parent.subtask_ids, vec![c1.id, c2.id]);
    }

    #[test]
    fn test_create_with_missing_parent_fails() {
        let mut store = store();
        let orphan = Task::new("/proj", "default", "child").with_parent("nope");
        assert!(matches!(
            store.create_task(orphan),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_task_partial_and_nullable() {
        let mut store = store();
        let task = quick_task(&mut store, "t");

        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        store
            .update_task(
                &task.id,
                TaskUpdate {
                    paused_at: Some(Some(t)),
                    ..Default::default()
                },
            )
            .unwrap();
        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.paused_at, Some(t));
        // untouched fields survive
        assert_eq!(loaded.title, "t");

        store
            .update_task(
                &task.id,
                TaskUpdate {
                    paused_at: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.paused_at, None);
    }

    #[test]
    fn test_update_bumps_updated_at_unless_overridden() {
        let mut store = store();
        let task = quick_task(&mut store, "t");
        let before = task.updated_at;

        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .update_task(&task.id, TaskUpdate::status(TaskStatus::InProgress))
            .unwrap();
        let bumped = store.get_task(&task.id).unwrap().unwrap().updated_at;
        assert!(bumped > before);

        let pinned = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        store
            .update_task(
                &task.id,
                TaskUpdate {
                    updated_at: Some(pinned),
                    ..Default::default()
                },
            )
            .unwrap();
        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.updated_at, pinned);
    }

    #[test]
    fn test_update_missing_task_is_not_found() {
        let mut store = store();
        assert!(matches!(
            store.update_task("ghost", TaskUpdate::status(TaskStatus::Failed)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_status_side_effects() {
        let mut store = store();
        let task = quick_task(&mut store, "t");

        store
            .update_task_status(&task.id, TaskStatus::Paused, None, Some("usage_limit"))
            .unwrap();
        let paused = store.get_task(&task.id).unwrap().unwrap();
        assert!(paused.paused_at.is_some());
        assert_eq!(paused.pause_reason, Some(PauseReason::UsageLimit));

        store
            .update_task(
                &task.id,
                TaskUpdate {
                    resume_attempts: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_task_status(&task.id, TaskStatus::Completed, None, None)
            .unwrap();
        let done = store.get_task(&task.id).unwrap().unwrap();
        assert!(done.completed_at.is_some());
        assert!(done.completed_at.unwrap() >= done.created_at);
        assert_eq!(done.resume_attempts, 0);

        store
            .update_task_status(&task.id, TaskStatus::Failed, None, Some("boom"))
            .unwrap();
        let failed = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_ready_tasks_follow_canonical_order() {
        let mut store = store();

        // Insert out of order; expected output order is exactly:
        // urgent/xl, high/xs, normal/medium (older), normal/medium (newer)
        let nm_old = store
            .create_task(Task::new("/p", "default", "nm old"))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let nm_new = store
            .create_task(Task::new("/p", "default", "nm new"))
            .unwrap();
        let hi_xs = store
            .create_task(
                Task::new("/p", "default", "hi xs")
                    .with_priority(Priority::High)
                    .with_effort(Effort::Xs),
            )
            .unwrap();
        let ur_xl = store
            .create_task(
                Task::new("/p", "default", "ur xl")
                    .with_priority(Priority::Urgent)
                    .with_effort(Effort::Xl),
            )
            .unwrap();

        let ready = store.get_ready_tasks(10, true).unwrap();
        let ids: Vec<_> = ready.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![&ur_xl.id, &hi_xs.id, &nm_old.id, &nm_new.id]);
    }

    #[test]
    fn test_ready_excludes_blocked_until_dependency_terminal() {
        let mut store = store();
        let t1 = quick_task(&mut store, "t1");
        let t2 = store
            .create_task(Task::new("/p", "default", "t2").with_dependency(&t1.id))
            .unwrap();

        let ready = store.get_ready_tasks(10, true).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, t1.id);

        store
            .update_task_status(&t1.id, TaskStatus::Completed, None, None)
            .unwrap();
        let ready = store.get_ready_tasks(10, true).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, t2.id);

        // cancelled also satisfies
        let t3 = quick_task(&mut store, "t3");
        let t4 = store
            .create_task(Task::new("/p", "default", "t4").with_dependency(&t3.id))
            .unwrap();
        store
            .update_task_status(&t3.id, TaskStatus::Cancelled, None, Some("dropped"))
            .unwrap();
        let ready_ids: Vec<_> = store
            .get_ready_tasks(10, false)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(ready_ids.contains(&t4.id));
    }

    #[test]
    fn test_paused_for_resume_excludes_manual_and_future_holds() {
        let mut store = store();

        let auto = quick_task(&mut store, "auto");
        store
            .update_task_status(&auto.id, TaskStatus::Paused, None, Some("capacity"))
            .unwrap();

        let manual = quick_task(&mut store, "manual");
        store
            .update_task_status(&manual.id, TaskStatus::Paused, None, Some("manual"))
            .unwrap();

        let held = quick_task(&mut store, "held");
        store
            .update_task_status(&held.id, TaskStatus::Paused, None, Some("budget"))
            .unwrap();
        store
            .update_task(
                &held.id,
                TaskUpdate {
                    resume_after: Some(Some(Utc::now() + Duration::hours(1))),
                    ..Default::default()
                },
            )
            .unwrap();

        let elapsed = quick_task(&mut store, "elapsed");
        store
            .update_task_status(&elapsed.id, TaskStatus::Paused, None, Some("budget"))
            .unwrap();
        store
            .update_task(
                &elapsed.id,
                TaskUpdate {
                    resume_after: Some(Some(Utc::now() - Duration::minutes(1))),
                    ..Default::default()
                },
            )
            .unwrap();

        let ids: Vec<_> = store
            .get_paused_tasks_for_resume()
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(ids.contains(&auto.id));
        assert!(ids.contains(&elapsed.id));
        assert!(!ids.contains(&manual.id));
        assert!(!ids.contains(&held.id));
    }

    #[test]
    fn test_highest_priority_parent_prefers_parents_only() {
        let mut store = store();

        let leaf = quick_task(&mut store, "leaf");
        store
            .update_task_status(&leaf.id, TaskStatus::Paused, None, Some("capacity"))
            .unwrap();

        assert!(store.find_highest_priority_parent_task().unwrap().is_none());

        let parent = store
            .create_task(Task::new("/p", "default", "parent").with_priority(Priority::Low))
            .unwrap();
        let _child = store
            .create_task(Task::new("/p", "default", "child").with_parent(&parent.id))
            .unwrap();
        store
            .update_task_status(&parent.id, TaskStatus::Paused, None, Some("capacity"))
            .unwrap();

        // the leaf is higher priority (normal > low) but has no subtasks
        let found = store.find_highest_priority_parent_task().unwrap().unwrap();
        assert_eq!(found.id, parent.id);
    }

    #[test]
    fn test_orphan_staleness_boundary() {
        let mut store = store();
        let fresh = quick_task(&mut store, "fresh");
        let stale = quick_task(&mut store, "stale");

        for (id, age_minutes) in [(&fresh.id, 59), (&stale.id, 61)] {
            store
                .update_task(
                    id,
                    TaskUpdate {
                        status: Some(TaskStatus::InProgress),
                        updated_at: Some(Utc::now() - Duration::minutes(age_minutes)),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let orphans = store.get_orphaned_tasks(Duration::hours(1)).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, stale.id);
    }

    #[test]
    fn test_orphans_ordered_oldest_first() {
        let mut store = store();
        let newer = quick_task(&mut store, "newer");
        let older = quick_task(&mut store, "older");

        for (id, hours) in [(&newer.id, 2), (&older.id, 5)] {
            store
                .update_task(
                    id,
                    TaskUpdate {
                        status: Some(TaskStatus::InProgress),
                        updated_at: Some(Utc::now() - Duration::hours(hours)),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let orphans = store.get_orphaned_tasks(Duration::hours(1)).unwrap();
        let ids: Vec<_> = orphans.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![&older.id, &newer.id]);
    }

    #[test]
    fn test_list_tasks_filter_and_pagination() {
        let mut store = store();
        for i in 0..5 {
            quick_task(&mut store, &format!("task {}", i));
        }
        let done = quick_task(&mut store, "done");
        store
            .update_task_status(&done.id, TaskStatus::Completed, None, None)
            .unwrap();

        let pending = store
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pending.len(), 5);

        let page = store
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Pending),
                limit: Some(2),
                offset: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].title, "task 2");
    }

    #[test]
    fn test_delete_task_cascades() {
        let mut store = store();
        let task = quick_task(&mut store, "doomed");
        store
            .append_log(&task.id, LogLevel::Info, None, None, "hello", None)
            .unwrap();
        store.set_gate(&task.id, "review").unwrap();

        store.delete_task(&task.id).unwrap();
        assert!(store.get_task(&task.id).unwrap().is_none());
        let gates = store.list_gates(&task.id).unwrap();
        assert!(gates.is_empty());
    }

    #[test]
    fn test_session_data_round_trip() {
        let mut store = store();
        let task = quick_task(&mut store, "t");
        let session = SessionData {
            context_summary: Some("working on stage two".to_string()),
            ..Default::default()
        };
        store
            .update_task(
                &task.id,
                TaskUpdate {
                    session: Some(Some(session.clone())),
                    ..Default::default()
                },
            )
            .unwrap();
        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.session, Some(session));
    }

    mod ordering_property {
        use super::*;
        use proptest::prelude::*;

        fn arb_priority() -> impl Strategy<Value = Priority> {
            prop_oneof![
                Just(Priority::Urgent),
                Just(Priority::High),
                Just(Priority::Normal),
                Just(Priority::Low),
            ]
        }

        fn arb_effort() -> impl Strategy<Value = Effort> {
            prop_oneof![
                Just(Effort::Xs),
                Just(Effort::Small),
                Just(Effort::Medium),
                Just(Effort::Large),
                Just(Effort::Xl),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]
            #[test]
            fn sql_order_matches_rank_comparator(
                entries in proptest::collection::vec((arb_priority(), arb_effort()), 1..12)
            ) {
                let mut store = Store::in_memory().unwrap();
                let mut expected: Vec<(u8, u8, String)> = Vec::new();

                for (i, (priority, effort)) in entries.iter().enumerate() {
                    let task = Task::new("/p", "default", format!("task {}", i))
                        .with_priority(*priority)
                        .with_effort(*effort);
                    let created = store.create_task(task).unwrap();
                    expected.push((priority.rank(), effort.rank(), created.id));
                    std::thread::sleep(std::time::Duration::from_millis(2));
                }

                // creation order is the tiebreaker, and Vec::sort is stable
                expected.sort_by_key(|(p, e, _)| (*p, *e));
                let expected_ids: Vec<_> =
                    expected.into_iter().map(|(_, _, id)| id).collect();

                let actual_ids: Vec<_> = store
                    .get_ready_tasks(100, true)
                    .unwrap()
                    .into_iter()
                    .map(|t| t.id)
                    .collect();
                prop_assert_eq!(actual_ids, expected_ids);
            }
        }
    }
}
