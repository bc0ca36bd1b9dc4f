//! Dependency edges
//!
//! Directed edges `task -> blocking task`. The edge set must stay acyclic;
//! inserts traverse the stored graph transitively before committing.
//! Duplicate edges are idempotent (INSERT OR IGNORE). Edges are immutable
//! after creation apart from explicit removal.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::Store;
use crate::time::to_iso;

impl Store {
    /// Add a dependency edge `task -> depends_on`. Idempotent; rejects
    /// self-dependencies and edges that would close a cycle.
    pub fn add_dependency(&mut self, task_id: &str, depends_on: &str) -> StoreResult<()> {
        debug!(%task_id, %depends_on, "add_dependency");
        self.with_tx(|tx| insert_dependency(tx, task_id, depends_on))
    }

    /// Remove a dependency edge; removing a missing edge is a no-op
    pub fn remove_dependency(&mut self, task_id: &str, depends_on: &str) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM task_dependencies WHERE task_id = ?1 AND depends_on = ?2",
            params![task_id, depends_on],
        )?;
        Ok(())
    }

    /// IDs this task depends on
    pub fn get_dependencies(&self, task_id: &str) -> StoreResult<Vec<String>> {
        dependencies_of(&self.conn, task_id)
    }

    /// IDs of tasks that depend on this task
    pub fn get_dependents(&self, task_id: &str) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id FROM task_dependencies WHERE depends_on = ?1 ORDER BY task_id",
        )?;
        let ids = stmt
            .query_map(params![task_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Whether the task is pending with every dependency completed or
    /// cancelled
    pub fn is_ready(&self, task_id: &str) -> StoreResult<bool> {
        let ready: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM tasks t WHERE t.id = ?1 AND t.status = 'pending' AND NOT EXISTS (\
                 SELECT 1 FROM task_dependencies d JOIN tasks b ON b.id = d.depends_on \
                 WHERE d.task_id = t.id AND b.status NOT IN ('completed','cancelled'))",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ready.is_some())
    }
}

/// Insert one edge inside an open transaction, enforcing acyclicity
pub(crate) fn insert_dependency(
    conn: &Connection,
    task_id: &str,
    depends_on: &str,
) -> StoreResult<()> {
    if task_id == depends_on {
        return Err(StoreError::InvalidDependency(format!(
            "task {} cannot depend on itself",
            task_id
        )));
    }
    if would_create_cycle(conn, task_id, depends_on)? {
        return Err(StoreError::InvalidDependency(format!(
            "dependency {} -> {} would create a cycle",
            task_id, depends_on
        )));
    }
    conn.execute(
        "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on, created_at) \
         VALUES (?1, ?2, ?3)",
        params![task_id, depends_on, to_iso(Utc::now())],
    )?;
    Ok(())
}

/// BFS from `depends_on` along stored edges; a path back to `task_id`
/// means the new edge would close a cycle.
fn would_create_cycle(conn: &Connection, task_id: &str, depends_on: &str) -> StoreResult<bool> {
    let edges = load_edges(conn)?;

    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(depends_on);

    while let Some(current) = queue.pop_front() {
        if current == task_id {
            return Ok(true);
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(next) = edges.get(current) {
            for dep in next {
                queue.push_back(dep);
            }
        }
    }
    Ok(false)
}

fn load_edges(conn: &Connection) -> StoreResult<HashMap<String, Vec<String>>> {
    let mut stmt = conn.prepare("SELECT task_id, depends_on FROM task_dependencies")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        let (from, to) = row?;
        edges.entry(from).or_default().push(to);
    }
    Ok(edges)
}

pub(crate) fn dependencies_of(conn: &Connection, task_id: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on",
    )?;
    let ids = stmt
        .query_map(params![task_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Dependencies whose task is not yet completed or cancelled
pub(crate) fn blocking_dependencies_of(
    conn: &Connection,
    task_id: &str,
) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT d.depends_on FROM task_dependencies d JOIN tasks b ON b.id = d.depends_on \
         WHERE d.task_id = ?1 AND b.status NOT IN ('completed','cancelled') \
         ORDER BY d.depends_on",
    )?;
    let ids = stmt
        .query_map(params![task_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
