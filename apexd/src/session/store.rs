//! Checkpoint persistence and session restore
//!
//! Checkpoints are written to the database (authoritative) and mirrored
//! as JSON sidecar files under `.apex/checkpoints/`. Session-data blobs
//! on the task row are derived hints only.

use std::path::PathBuf;

use apex_store::{
    Checkpoint, CheckpointMetadata, ConversationMessage, ResumePoint, SessionData, Task,
    TaskUpdate,
};
use chrono::Utc;
use eyre::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SessionRecoveryConfig;
use crate::state::StateManager;

use super::summary::summarize_context;

/// Checkpoint sidecar directory name inside the state directory
pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// How many trailing conversation messages are embedded on the task row
const RECENT_HISTORY_TAIL: usize = 5;

/// Default retention for cleanup
pub fn default_checkpoint_retention() -> chrono::Duration {
    chrono::Duration::days(7)
}

/// What the executor needs to continue a checkpointed task
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeContext {
    pub checkpoint_id: String,
    pub stage: String,
    pub stage_index: u32,
    pub conversation: Vec<ConversationMessage>,
    pub stage_state: Option<Value>,
}

impl ResumeContext {
    /// Build from a stored checkpoint
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            checkpoint_id: checkpoint.id.clone(),
            stage: checkpoint.stage.clone(),
            stage_index: checkpoint.stage_index,
            conversation: checkpoint.conversation.clone(),
            stage_state: checkpoint.stage_state.clone(),
        }
    }
}

/// Result of a restore query
#[derive(Debug, Clone)]
pub struct RestoredSession {
    pub checkpoint: Option<Checkpoint>,
    pub session_data: Option<SessionData>,
    pub can_resume: bool,
}

/// Result of an auto-resume attempt
#[derive(Debug, Clone)]
pub struct AutoResume {
    pub resumed: bool,
    pub resume_point: Option<ResumeContext>,
}

/// Writes and reads checkpoints keyed by task
#[derive(Clone)]
pub struct SessionStore {
    state: StateManager,
    config: SessionRecoveryConfig,
    checkpoints_dir: PathBuf,
}

impl SessionStore {
    pub fn new(state: StateManager, config: SessionRecoveryConfig, state_dir: PathBuf) -> Self {
        Self {
            state,
            config,
            checkpoints_dir: state_dir.join(CHECKPOINTS_DIR),
        }
    }

    pub fn config(&self) -> &SessionRecoveryConfig {
        &self.config
    }

    /// Snapshot a task's conversation and stage state. Writes the
    /// database row, the sidecar files, and the derived session hints on
    /// the task row.
    pub async fn create_checkpoint(
        &self,
        task: &Task,
        conversation: Vec<ConversationMessage>,
        stage_state: Option<Value>,
    ) -> Result<Checkpoint> {
        let latest = self
            .state
            .latest_checkpoint(&task.id)
            .await
            .map_err(|e| eyre::eyre!("latest checkpoint: {}", e))?;
        let sequence = latest.as_ref().map(|cp| cp.sequence + 1).unwrap_or(1);

        let stage = task.stage.clone().unwrap_or_else(|| "unknown".to_string());
        let session_data = self.derive_session_data(task, &conversation, stage_state.as_ref());

        let mut checkpoint = Checkpoint::new(
            &task.id,
            sequence,
            stage,
            task.stage_index,
            conversation,
        );
        // checkpoint ids derive from the creation millisecond; keep them
        // unique (and creation times monotonic) under rapid checkpointing
        if let Some(latest) = &latest {
            if latest.created_at >= checkpoint.created_at {
                checkpoint.created_at =
                    latest.created_at + chrono::Duration::milliseconds(1);
                checkpoint.id = format!(
                    "{}-{}",
                    task.id,
                    checkpoint.created_at.timestamp_millis()
                );
            }
        }
        checkpoint.stage_state = stage_state;
        checkpoint.metadata = CheckpointMetadata {
            pause_reason: task.pause_reason,
            session_data: Some(session_data.clone()),
            usage: Some(task.usage),
            extra: Default::default(),
        };
        // last_checkpoint refers to this checkpoint
        let mut session_data = session_data;
        session_data.last_checkpoint = Some(checkpoint.created_at);

        self.state
            .save_checkpoint(checkpoint.clone())
            .await
            .map_err(|e| eyre::eyre!("save checkpoint: {}", e))?;

        self.state
            .update_task(
                &task.id,
                TaskUpdate {
                    session: Some(Some(session_data.clone())),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| eyre::eyre!("update session hints: {}", e))?;

        self.write_sidecars(&checkpoint, &session_data)?;

        debug!(task_id = %task.id, checkpoint_id = %checkpoint.id, sequence, "checkpoint created");
        Ok(checkpoint)
    }

    /// Load the latest checkpoint and judge whether the task can resume
    /// from it: recovery enabled, checkpoint young enough, conversation
    /// non-empty, stage known.
    pub async fn restore_session(&self, task_id: &str) -> Result<RestoredSession> {
        let checkpoint = self
            .state
            .latest_checkpoint(task_id)
            .await
            .map_err(|e| eyre::eyre!("latest checkpoint: {}", e))?;
        let session_data = self
            .state
            .get_task(task_id)
            .await
            .map_err(|e| eyre::eyre!("get task: {}", e))?
            .and_then(|t| t.session);

        let can_resume = self.config.enabled
            && checkpoint.as_ref().is_some_and(|cp| {
                let age = Utc::now() - cp.created_at;
                age <= chrono::Duration::milliseconds(self.config.max_checkpoint_age_ms as i64)
                    && !cp.conversation.is_empty()
                    && !cp.stage.is_empty()
                    && cp.stage != "unknown"
            });

        Ok(RestoredSession {
            checkpoint,
            session_data,
            can_resume,
        })
    }

    /// Prepare a resume point for a task if session recovery allows it
    pub async fn auto_resume(&self, task: &Task) -> Result<AutoResume> {
        if !self.config.enabled || !self.config.auto_resume {
            return Ok(AutoResume {
                resumed: false,
                resume_point: None,
            });
        }

        let restored = self.restore_session(&task.id).await?;
        let Some(checkpoint) = restored.checkpoint.filter(|_| restored.can_resume) else {
            return Ok(AutoResume {
                resumed: false,
                resume_point: None,
            });
        };
        info!(task_id = %task.id, checkpoint_id = %checkpoint.id, "session auto-resume prepared");
        Ok(AutoResume {
            resumed: true,
            resume_point: Some(ResumeContext::from_checkpoint(&checkpoint)),
        })
    }

    /// The resume context the scheduler hands to the executor: the latest
    /// checkpoint's resume point, or None for fresh tasks.
    pub async fn resume_context(&self, task_id: &str) -> Result<Option<ResumeContext>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let restored = self.restore_session(task_id).await?;
        Ok(restored
            .can_resume
            .then(|| restored.checkpoint.as_ref().map(ResumeContext::from_checkpoint))
            .flatten())
    }

    /// Remove checkpoints older than the retention window, plus sidecar
    /// files whose task row no longer exists (orphan checkpoints), which
    /// are deleted regardless of age.
    pub async fn cleanup_checkpoints(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut removed = self
            .state
            .delete_checkpoints_before(cutoff)
            .await
            .map_err(|e| eyre::eyre!("delete old checkpoints: {}", e))?;

        if self.checkpoints_dir.exists() {
            removed += self.cleanup_sidecars(cutoff).await?;
        }

        if removed > 0 {
            info!(removed, "checkpoint cleanup finished");
        }
        Ok(removed)
    }

    async fn cleanup_sidecars(&self, cutoff: chrono::DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        let entries = std::fs::read_dir(&self.checkpoints_dir)
            .context("read checkpoints directory")?;

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = file_name.strip_suffix(".json") else {
                continue;
            };

            let (task_id, epoch_ms) = match stem.strip_suffix("-session") {
                Some(task_id) => (task_id.to_string(), None),
                None => match split_checkpoint_stem(stem) {
                    Some((task_id, ms)) => (task_id, Some(ms)),
                    None => continue,
                },
            };

            let task_exists = self
                .state
                .get_task(&task_id)
                .await
                .map_err(|e| eyre::eyre!("get task: {}", e))?
                .is_some();

            let expired = epoch_ms.is_some_and(|ms| ms < cutoff.timestamp_millis());

            if !task_exists || expired {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = %path.display(), orphan = !task_exists, "removed checkpoint file");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove checkpoint file"),
                }
            }
        }
        Ok(removed)
    }

    fn write_sidecars(&self, checkpoint: &Checkpoint, session_data: &SessionData) -> Result<()> {
        std::fs::create_dir_all(&self.checkpoints_dir).context("create checkpoints directory")?;

        let checkpoint_path = self.checkpoints_dir.join(format!("{}.json", checkpoint.id));
        std::fs::write(&checkpoint_path, serde_json::to_vec_pretty(checkpoint)?)
            .context("write checkpoint sidecar")?;

        let session_path = self
            .checkpoints_dir
            .join(format!("{}-session.json", checkpoint.task_id));
        std::fs::write(&session_path, serde_json::to_vec_pretty(session_data)?)
            .context("write session sidecar")?;

        Ok(())
    }

    fn derive_session_data(
        &self,
        task: &Task,
        conversation: &[ConversationMessage],
        stage_state: Option<&Value>,
    ) -> SessionData {
        let context_summary = (conversation.len()
            > self.config.context_summarization_threshold)
            .then(|| summarize_context(conversation).render());

        let tail_start = conversation.len().saturating_sub(RECENT_HISTORY_TAIL);

        SessionData {
            last_checkpoint: None,
            context_summary,
            recent_history: conversation[tail_start..].to_vec(),
            stage_state: stage_state.cloned(),
            resume_point: Some(ResumePoint {
                stage: task.stage.clone().unwrap_or_else(|| "unknown".to_string()),
                step_index: task.stage_index,
                metadata: Value::Null,
            }),
        }
    }
}

fn split_checkpoint_stem(stem: &str) -> Option<(String, i64)> {
    let (task_id, suffix) = stem.rsplit_once('-')?;
    let epoch_ms: i64 = suffix.parse().ok()?;
    Some((task_id.to_string(), epoch_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use apex_store::{Role, Store, TaskStatus};
    use tempfile::tempdir;

    fn recovery_config() -> SessionRecoveryConfig {
        SessionRecoveryConfig {
            enabled: true,
            auto_resume: true,
            ..Default::default()
        }
    }

    async fn setup(config: SessionRecoveryConfig) -> (SessionStore, StateManager, Task, tempfile::TempDir) {
        let temp = tempdir().unwrap();
        let state = StateManager::spawn_with_store(Store::in_memory().unwrap(), None);
        let mut task = Task::new("/p", "default", "session test");
        task.stage = Some("testing".to_string());
        task.stage_index = 2;
        let task = state.create_task(task).await.unwrap();
        let session = SessionStore::new(state.clone(), config, temp.path().to_path_buf());
        (session, state, task, temp)
    }

    fn conversation(n: usize) -> Vec<ConversationMessage> {
        (0..n)
            .map(|i| ConversationMessage::text(Role::Assistant, format!("step {}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_create_checkpoint_writes_db_and_sidecars() {
        let (session, state, task, temp) = setup(recovery_config()).await;

        let checkpoint = session
            .create_checkpoint(&task, conversation(3), Some(serde_json::json!({"step": 1})))
            .await
            .unwrap();

        assert_eq!(
            checkpoint.id,
            format!("{}-{}", task.id, checkpoint.created_at.timestamp_millis())
        );

        let latest = state.latest_checkpoint(&task.id).await.unwrap().unwrap();
        assert_eq!(latest, checkpoint);

        let sidecar = temp
            .path()
            .join(CHECKPOINTS_DIR)
            .join(format!("{}.json", checkpoint.id));
        assert!(sidecar.exists());
        let session_file = temp
            .path()
            .join(CHECKPOINTS_DIR)
            .join(format!("{}-session.json", task.id));
        assert!(session_file.exists());

        // task row carries the derived hints
        let loaded = state.get_task(&task.id).await.unwrap().unwrap();
        let hints = loaded.session.unwrap();
        assert_eq!(hints.recent_history.len(), 3);
        assert_eq!(hints.resume_point.as_ref().unwrap().stage, "testing");
        assert!(loaded.last_checkpoint_at.is_some());
    }

    #[tokio::test]
    async fn test_summary_only_past_threshold() {
        let mut config = recovery_config();
        config.context_summarization_threshold = 5;
        let (session, state, task, _temp) = setup(config).await;

        session
            .create_checkpoint(&task, conversation(3), None)
            .await
            .unwrap();
        let hints = state.get_task(&task.id).await.unwrap().unwrap().session.unwrap();
        assert!(hints.context_summary.is_none());

        session
            .create_checkpoint(&task, conversation(10), None)
            .await
            .unwrap();
        let hints = state.get_task(&task.id).await.unwrap().unwrap().session.unwrap();
        let summary = hints.context_summary.unwrap();
        assert!(summary.contains("10 messages"));
    }

    #[tokio::test]
    async fn test_restore_session_gates() {
        let (session, _state, task, _temp) = setup(recovery_config()).await;

        // no checkpoint yet
        let restored = session.restore_session(&task.id).await.unwrap();
        assert!(!restored.can_resume);
        assert!(restored.checkpoint.is_none());

        session
            .create_checkpoint(&task, conversation(3), None)
            .await
            .unwrap();
        let restored = session.restore_session(&task.id).await.unwrap();
        assert!(restored.can_resume);
        assert_eq!(restored.checkpoint.unwrap().conversation.len(), 3);
    }

    #[tokio::test]
    async fn test_restore_disabled_never_resumes() {
        let config = SessionRecoveryConfig {
            enabled: false,
            ..Default::default()
        };
        let (session, _state, task, _temp) = setup(config).await;
        session
            .create_checkpoint(&task, conversation(3), None)
            .await
            .unwrap();

        let restored = session.restore_session(&task.id).await.unwrap();
        assert!(!restored.can_resume);
    }

    #[tokio::test]
    async fn test_restore_rejects_empty_conversation() {
        let (session, _state, task, _temp) = setup(recovery_config()).await;
        session
            .create_checkpoint(&task, vec![], None)
            .await
            .unwrap();
        let restored = session.restore_session(&task.id).await.unwrap();
        assert!(!restored.can_resume);
    }

    #[tokio::test]
    async fn test_restore_rejects_stale_checkpoint() {
        let mut config = recovery_config();
        config.max_checkpoint_age_ms = 10;
        let (session, _state, task, _temp) = setup(config).await;
        session
            .create_checkpoint(&task, conversation(2), None)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let restored = session.restore_session(&task.id).await.unwrap();
        assert!(!restored.can_resume);
    }

    #[tokio::test]
    async fn test_auto_resume_round_trip() {
        let (session, _state, task, _temp) = setup(recovery_config()).await;
        session
            .create_checkpoint(&task, conversation(3), Some(serde_json::json!({"cursor": 9})))
            .await
            .unwrap();

        let auto = session.auto_resume(&task).await.unwrap();
        assert!(auto.resumed);
        let point = auto.resume_point.unwrap();
        assert_eq!(point.stage, "testing");
        assert_eq!(point.stage_index, 2);
        assert_eq!(point.conversation.len(), 3);
        assert_eq!(point.stage_state, Some(serde_json::json!({"cursor": 9})));
    }

    #[tokio::test]
    async fn test_auto_resume_off_returns_not_resumed() {
        let mut config = recovery_config();
        config.auto_resume = false;
        let (session, _state, task, _temp) = setup(config).await;
        session
            .create_checkpoint(&task, conversation(3), None)
            .await
            .unwrap();

        let auto = session.auto_resume(&task).await.unwrap();
        assert!(!auto.resumed);
        assert!(auto.resume_point.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_orphan_sidecars() {
        let (session, state, task, temp) = setup(recovery_config()).await;
        session
            .create_checkpoint(&task, conversation(2), None)
            .await
            .unwrap();

        let dir = temp.path().join(CHECKPOINTS_DIR);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 2);

        // deleting the task row turns the files into orphan checkpoints
        state.delete_task(&task.id).await.unwrap();
        let removed = session
            .cleanup_checkpoints(default_checkpoint_retention())
            .await
            .unwrap();
        assert!(removed >= 2);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_fresh_checkpoints() {
        let (session, state, task, temp) = setup(recovery_config()).await;
        session
            .create_checkpoint(&task, conversation(2), None)
            .await
            .unwrap();

        let removed = session
            .cleanup_checkpoints(default_checkpoint_retention())
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert!(state.latest_checkpoint(&task.id).await.unwrap().is_some());
        let dir = temp.path().join(CHECKPOINTS_DIR);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 2);

        // status changes don't disturb checkpoints
        state
            .update_task_status(&task.id, TaskStatus::Completed, None, None)
            .await
            .unwrap();
        assert!(state.latest_checkpoint(&task.id).await.unwrap().is_some());
    }
}
