//! Gate operations
//!
//! One gate per (task, name); setting an existing gate is idempotent and
//! preserves any recorded response.

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use crate::error::{StoreError, StoreResult};
use crate::gate::{Gate, GateStatus};
use crate::store::Store;
use crate::time::{parse_iso, parse_iso_opt, to_iso};

const GATE_COLUMNS: &str = "task_id, name, status, required_at, responded_at, approver, comment";

impl Store {
    /// Require a gate on a task. Idempotent: an existing gate keeps its
    /// status and response.
    pub fn set_gate(&mut self, task_id: &str, name: &str) -> StoreResult<Gate> {
        let gate = Gate::new(task_id, name);
        self.conn.execute(
            "INSERT INTO gates (task_id, name, status, required_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(task_id, name) DO NOTHING",
            params![
                gate.task_id,
                gate.name,
                gate.status.to_string(),
                to_iso(gate.required_at)
            ],
        )?;
        self.get_gate(task_id, name)?
            .ok_or_else(|| StoreError::NotFound(format!("gate {}:{}", task_id, name)))
    }

    /// Fetch a gate by (task, name)
    pub fn get_gate(&self, task_id: &str, name: &str) -> StoreResult<Option<Gate>> {
        let sql = format!(
            "SELECT {} FROM gates WHERE task_id = ?1 AND name = ?2",
            GATE_COLUMNS
        );
        self.conn
            .query_row(&sql, params![task_id, name], map_gate_row)
            .optional()
            .map_err(StoreError::from)
    }

    /// Approve a pending gate
    pub fn approve_gate(
        &mut self,
        task_id: &str,
        name: &str,
        approver: &str,
        comment: Option<&str>,
    ) -> StoreResult<Gate> {
        self.respond_gate(task_id, name, GateStatus::Approved, approver, comment)
    }

    /// Reject a pending gate
    pub fn reject_gate(
        &mut self,
        task_id: &str,
        name: &str,
        approver: &str,
        comment: Option<&str>,
    ) -> StoreResult<Gate> {
        self.respond_gate(task_id, name, GateStatus::Rejected, approver, comment)
    }

    fn respond_gate(
        &mut self,
        task_id: &str,
        name: &str,
        status: GateStatus,
        approver: &str,
        comment: Option<&str>,
    ) -> StoreResult<Gate> {
        let changed = self.conn.execute(
            "UPDATE gates SET status = ?1, responded_at = ?2, approver = ?3, comment = ?4 \
             WHERE task_id = ?5 AND name = ?6",
            params![
                status.to_string(),
                to_iso(Utc::now()),
                approver,
                comment,
                task_id,
                name
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("gate {}:{}", task_id, name)));
        }
        self.get_gate(task_id, name)?
            .ok_or_else(|| StoreError::NotFound(format!("gate {}:{}", task_id, name)))
    }

    /// Pending gates across all tasks
    pub fn list_pending_gates(&self) -> StoreResult<Vec<Gate>> {
        let sql = format!(
            "SELECT {} FROM gates WHERE status = 'pending' ORDER BY required_at ASC",
            GATE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let gates = stmt
            .query_map([], map_gate_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(gates)
    }

    /// All gates for a task
    pub fn list_gates(&self, task_id: &str) -> StoreResult<Vec<Gate>> {
        let sql = format!(
            "SELECT {} FROM gates WHERE task_id = ?1 ORDER BY required_at ASC",
            GATE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let gates = stmt
            .query_map(params![task_id], map_gate_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(gates)
    }
}

fn map_gate_row(row: &Row<'_>) -> rusqlite::Result<Gate> {
    gate_from_row(row)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e))
}

fn gate_from_row(row: &Row<'_>) -> Result<Gate, Box<dyn std::error::Error + Send + Sync>> {
    Ok(Gate {
        task_id: row.get(0)?,
        name: row.get(1)?,
        status: row
            .get::<_, String>(2)?
            .parse::<GateStatus>()
            .unwrap_or_default(),
        required_at: parse_iso(&row.get::<_, String>(3)?)?,
        responded_at: parse_iso_opt(row.get(4)?)?,
        approver: row.get(5)?,
        comment: row.get(6)?,
    })
}
