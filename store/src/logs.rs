//! Task logs and artifacts
//!
//! Append-only children of a task; eager-loaded by get_task.

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;

use crate::error::StoreResult;
use crate::store::Store;
use crate::task::LogLevel;
use crate::time::to_iso;

impl Store {
    /// Append a log line to a task
    pub fn append_log(
        &mut self,
        task_id: &str,
        level: LogLevel,
        stage: Option<&str>,
        agent: Option<&str>,
        message: &str,
        metadata: Option<&Value>,
    ) -> StoreResult<i64> {
        let metadata = metadata.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO task_logs (task_id, level, stage, agent, message, metadata, created_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                task_id,
                level.to_string(),
                stage,
                agent,
                message,
                metadata,
                to_iso(Utc::now())
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Attach an artifact to a task
    pub fn add_artifact(
        &mut self,
        task_id: &str,
        name: &str,
        kind: &str,
        path: Option<&str>,
        content: Option<&str>,
    ) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO artifacts (task_id, name, kind, path, content, created_at) \
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![task_id, name, kind, path, content, to_iso(Utc::now())],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    #[test]
    fn test_logs_append_in_order() {
        let mut store = Store::in_memory().unwrap();
        let task = store
            .create_task(Task::new("/p", "default", "logged"))
            .unwrap();

        store
            .append_log(&task.id, LogLevel::Info, Some("planning"), None, "first", None)
            .unwrap();
        store
            .append_log(
                &task.id,
                LogLevel::Warn,
                Some("planning"),
                Some("builder"),
                "second",
                Some(&serde_json::json!({"attempt": 2})),
            )
            .unwrap();

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.logs.len(), 2);
        assert_eq!(loaded.logs[0].message, "first");
        assert_eq!(loaded.logs[1].level, LogLevel::Warn);
        assert_eq!(loaded.logs[1].agent.as_deref(), Some("builder"));
        assert_eq!(
            loaded.logs[1].metadata,
            Some(serde_json::json!({"attempt": 2}))
        );
    }

    #[test]
    fn test_artifacts_round_trip() {
        let mut store = Store::in_memory().unwrap();
        let task = store
            .create_task(Task::new("/p", "default", "artifacted"))
            .unwrap();

        store
            .add_artifact(&task.id, "patch", "diff", Some("/tmp/patch.diff"), None)
            .unwrap();
        store
            .add_artifact(&task.id, "report", "text", None, Some("all green"))
            .unwrap();

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.artifacts.len(), 2);
        assert_eq!(loaded.artifacts[0].kind, "diff");
        assert_eq!(loaded.artifacts[1].content.as_deref(), Some("all green"));
    }
}
