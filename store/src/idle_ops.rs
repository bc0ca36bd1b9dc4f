//! IdleTask operations

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use crate::error::{StoreError, StoreResult};
use crate::idle::IdleTask;
use crate::store::Store;
use crate::task::{Effort, Priority};
use crate::time::{parse_iso, to_iso};

const IDLE_COLUMNS: &str = "id, kind, title, rationale, priority, estimated_effort, \
suggested_workflow, implemented, promoted_task_id, created_at, updated_at";

impl Store {
    /// Persist a new idle candidate
    pub fn create_idle_task(&mut self, idle: IdleTask) -> StoreResult<IdleTask> {
        self.conn.execute(
            "INSERT INTO idle_tasks (id, kind, title, rationale, priority, estimated_effort, \
             suggested_workflow, implemented, promoted_task_id, created_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                idle.id,
                idle.kind,
                idle.title,
                idle.rationale,
                idle.priority.to_string(),
                idle.estimated_effort.to_string(),
                idle.suggested_workflow,
                idle.implemented,
                idle.promoted_task_id,
                to_iso(idle.created_at),
                to_iso(idle.updated_at),
            ],
        )?;
        Ok(idle)
    }

    /// Fetch an idle candidate by id
    pub fn get_idle_task(&self, id: &str) -> StoreResult<Option<IdleTask>> {
        let sql = format!("SELECT {} FROM idle_tasks WHERE id = ?1", IDLE_COLUMNS);
        self.conn
            .query_row(&sql, params![id], map_idle_row)
            .optional()
            .map_err(StoreError::from)
    }

    /// List idle candidates, optionally only those not yet promoted
    pub fn list_idle_tasks(&self, unimplemented_only: bool) -> StoreResult<Vec<IdleTask>> {
        let mut sql = format!("SELECT {} FROM idle_tasks", IDLE_COLUMNS);
        if unimplemented_only {
            sql.push_str(" WHERE implemented = 0");
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let idle = stmt
            .query_map([], map_idle_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(idle)
    }

    /// Record that a candidate was promoted into a real task
    pub fn mark_idle_implemented(&mut self, id: &str, task_id: &str) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE idle_tasks SET implemented = 1, promoted_task_id = ?1, updated_at = ?2 \
             WHERE id = ?3",
            params![task_id, to_iso(Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("idle task {}", id)));
        }
        Ok(())
    }

    /// Delete an idle candidate
    pub fn delete_idle_task(&mut self, id: &str) -> StoreResult<()> {
        let changed = self
            .conn
            .execute("DELETE FROM idle_tasks WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("idle task {}", id)));
        }
        Ok(())
    }
}

fn map_idle_row(row: &Row<'_>) -> rusqlite::Result<IdleTask> {
    idle_from_row(row)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e))
}

fn idle_from_row(row: &Row<'_>) -> Result<IdleTask, Box<dyn std::error::Error + Send + Sync>> {
    Ok(IdleTask {
        id: row.get(0)?,
        kind: row.get(1)?,
        title: row.get(2)?,
        rationale: row.get(3)?,
        priority: row
            .get::<_, String>(4)?
            .parse::<Priority>()
            .unwrap_or(Priority::Low),
        estimated_effort: row
            .get::<_, String>(5)?
            .parse::<Effort>()
            .unwrap_or_default(),
        suggested_workflow: row.get(6)?,
        implemented: row.get(7)?,
        promoted_task_id: row.get(8)?,
        created_at: parse_iso(&row.get::<_, String>(9)?)?,
        updated_at: parse_iso(&row.get::<_, String>(10)?)?,
    })
}
