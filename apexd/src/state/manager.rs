//! StateManager - actor that owns the Store
//!
//! The rusqlite connection lives on a single actor task; callers talk to
//! it through a command channel and get replies on oneshots. This is the
//! single-writer point for every durable mutation.

use std::path::Path;
use std::sync::Arc;

use apex_store::{
    Checkpoint, Gate, IdleTask, LogLevel, Store, Task, TaskFilter, TaskStatus, TaskUpdate,
};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::events::{Event, EventBus};

use super::messages::{StateCommand, StateError, StateResponse};

/// Handle for sending commands to the state actor. Cheap to clone.
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    events: Option<Arc<EventBus>>,
}

impl StateManager {
    /// Open the store and spawn the actor task
    pub fn spawn(
        state_dir: impl AsRef<Path>,
        events: Option<Arc<EventBus>>,
    ) -> eyre::Result<Self> {
        let store = Store::open(state_dir.as_ref())?;
        Ok(Self::spawn_with_store(store, events))
    }

    /// Spawn the actor around an already-open store (used by tests)
    pub fn spawn_with_store(store: Store, events: Option<Arc<EventBus>>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("state manager spawned");
        Self { tx, events }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StateError::ChannelClosed)?;
        reply_rx.await.map_err(|_| StateError::ChannelClosed)?
    }

    // === Tasks ===

    /// Create a task; emits `task:created` on success
    pub async fn create_task(&self, task: Task) -> StateResponse<Task> {
        debug!(task_id = %task.id, workflow = %task.workflow, "create_task");
        let created = self
            .request(|reply| StateCommand::CreateTask { task, reply })
            .await?;
        if let Some(events) = &self.events {
            events.emit(Event::TaskCreated {
                task_id: created.id.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(created)
    }

    pub async fn get_task(&self, id: &str) -> StateResponse<Option<Task>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetTask { id, reply }).await
    }

    /// Fetch a task, erroring when it does not exist
    pub async fn get_task_required(&self, id: &str) -> Result<Task, StateError> {
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("task {}", id)))
    }

    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> StateResponse<()> {
        let id = id.to_string();
        self.request(|reply| StateCommand::UpdateTask { id, update, reply })
            .await
    }

    pub async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        stage: Option<&str>,
        message: Option<&str>,
    ) -> StateResponse<()> {
        debug!(task_id = %id, %status, "update_task_status");
        let id = id.to_string();
        let stage = stage.map(str::to_string);
        let message = message.map(str::to_string);
        self.request(|reply| StateCommand::UpdateTaskStatus {
            id,
            status,
            stage,
            message,
            reply,
        })
        .await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> StateResponse<Vec<Task>> {
        self.request(|reply| StateCommand::ListTasks { filter, reply })
            .await
    }

    pub async fn ready_tasks(&self, limit: usize, by_priority: bool) -> StateResponse<Vec<Task>> {
        self.request(|reply| StateCommand::ReadyTasks {
            limit,
            by_priority,
            reply,
        })
        .await
    }

    pub async fn paused_tasks_for_resume(&self) -> StateResponse<Vec<Task>> {
        self.request(|reply| StateCommand::PausedTasksForResume { reply })
            .await
    }

    pub async fn highest_priority_parent_task(&self) -> StateResponse<Option<Task>> {
        self.request(|reply| StateCommand::HighestPriorityParentTask { reply })
            .await
    }

    pub async fn next_resume_deadline(
        &self,
    ) -> StateResponse<Option<chrono::DateTime<Utc>>> {
        self.request(|reply| StateCommand::NextResumeDeadline { reply })
            .await
    }

    pub async fn orphaned_tasks(&self, staleness: chrono::Duration) -> StateResponse<Vec<Task>> {
        self.request(|reply| StateCommand::OrphanedTasks { staleness, reply })
            .await
    }

    pub async fn delete_task(&self, id: &str) -> StateResponse<()> {
        let id = id.to_string();
        self.request(|reply| StateCommand::DeleteTask { id, reply })
            .await
    }

    pub async fn count_tasks_by_status(&self) -> StateResponse<Vec<(TaskStatus, u64)>> {
        self.request(|reply| StateCommand::CountTasksByStatus { reply })
            .await
    }

    // === Checkpoints ===

    pub async fn save_checkpoint(&self, checkpoint: Checkpoint) -> StateResponse<()> {
        self.request(|reply| StateCommand::SaveCheckpoint {
            checkpoint: Box::new(checkpoint),
            reply,
        })
        .await
    }

    pub async fn latest_checkpoint(&self, task_id: &str) -> StateResponse<Option<Checkpoint>> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::LatestCheckpoint { task_id, reply })
            .await
    }

    pub async fn list_checkpoints(&self, task_id: &str) -> StateResponse<Vec<Checkpoint>> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::ListCheckpoints { task_id, reply })
            .await
    }

    pub async fn delete_checkpoint(&self, id: &str) -> StateResponse<()> {
        let id = id.to_string();
        self.request(|reply| StateCommand::DeleteCheckpoint { id, reply })
            .await
    }

    pub async fn delete_all_checkpoints(&self, task_id: &str) -> StateResponse<usize> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::DeleteAllCheckpoints { task_id, reply })
            .await
    }

    pub async fn delete_checkpoints_before(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> StateResponse<usize> {
        self.request(|reply| StateCommand::DeleteCheckpointsBefore { cutoff, reply })
            .await
    }

    pub async fn next_checkpoint_sequence(&self, task_id: &str) -> StateResponse<u32> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::NextCheckpointSequence { task_id, reply })
            .await
    }

    // === Dependencies ===

    pub async fn add_dependency(&self, task_id: &str, depends_on: &str) -> StateResponse<()> {
        let task_id = task_id.to_string();
        let depends_on = depends_on.to_string();
        self.request(|reply| StateCommand::AddDependency {
            task_id,
            depends_on,
            reply,
        })
        .await
    }

    pub async fn remove_dependency(&self, task_id: &str, depends_on: &str) -> StateResponse<()> {
        let task_id = task_id.to_string();
        let depends_on = depends_on.to_string();
        self.request(|reply| StateCommand::RemoveDependency {
            task_id,
            depends_on,
            reply,
        })
        .await
    }

    pub async fn get_dependencies(&self, task_id: &str) -> StateResponse<Vec<String>> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::GetDependencies { task_id, reply })
            .await
    }

    pub async fn get_dependents(&self, task_id: &str) -> StateResponse<Vec<String>> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::GetDependents { task_id, reply })
            .await
    }

    pub async fn is_ready(&self, task_id: &str) -> StateResponse<bool> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::IsReady { task_id, reply })
            .await
    }

    // === Gates ===

    pub async fn set_gate(&self, task_id: &str, name: &str) -> StateResponse<Gate> {
        let task_id = task_id.to_string();
        let name = name.to_string();
        self.request(|reply| StateCommand::SetGate { task_id, name, reply })
            .await
    }

    pub async fn approve_gate(
        &self,
        task_id: &str,
        name: &str,
        approver: &str,
        comment: Option<&str>,
    ) -> StateResponse<Gate> {
        self.respond_gate(task_id, name, true, approver, comment).await
    }

    pub async fn reject_gate(
        &self,
        task_id: &str,
        name: &str,
        approver: &str,
        comment: Option<&str>,
    ) -> StateResponse<Gate> {
        self.respond_gate(task_id, name, false, approver, comment)
            .await
    }

    async fn respond_gate(
        &self,
        task_id: &str,
        name: &str,
        approve: bool,
        approver: &str,
        comment: Option<&str>,
    ) -> StateResponse<Gate> {
        let task_id = task_id.to_string();
        let name = name.to_string();
        let approver = approver.to_string();
        let comment = comment.map(str::to_string);
        self.request(|reply| StateCommand::RespondGate {
            task_id,
            name,
            approve,
            approver,
            comment,
            reply,
        })
        .await
    }

    pub async fn get_gate(&self, task_id: &str, name: &str) -> StateResponse<Option<Gate>> {
        let task_id = task_id.to_string();
        let name = name.to_string();
        self.request(|reply| StateCommand::GetGate { task_id, name, reply })
            .await
    }

    pub async fn list_gates(&self, task_id: &str) -> StateResponse<Vec<Gate>> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::ListGates { task_id, reply })
            .await
    }

    pub async fn list_pending_gates(&self) -> StateResponse<Vec<Gate>> {
        self.request(|reply| StateCommand::ListPendingGates { reply })
            .await
    }

    // === Idle tasks ===

    pub async fn create_idle_task(&self, idle: IdleTask) -> StateResponse<IdleTask> {
        self.request(|reply| StateCommand::CreateIdleTask { idle, reply })
            .await
    }

    pub async fn list_idle_tasks(&self, unimplemented_only: bool) -> StateResponse<Vec<IdleTask>> {
        self.request(|reply| StateCommand::ListIdleTasks {
            unimplemented_only,
            reply,
        })
        .await
    }

    pub async fn mark_idle_implemented(&self, id: &str, task_id: &str) -> StateResponse<()> {
        let id = id.to_string();
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::MarkIdleImplemented { id, task_id, reply })
            .await
    }

    // === Logs and artifacts ===

    pub async fn append_log(
        &self,
        task_id: &str,
        level: LogLevel,
        stage: Option<&str>,
        agent: Option<&str>,
        message: &str,
        metadata: Option<Value>,
    ) -> StateResponse<i64> {
        let task_id = task_id.to_string();
        let stage = stage.map(str::to_string);
        let agent = agent.map(str::to_string);
        let message = message.to_string();
        self.request(|reply| StateCommand::AppendLog {
            task_id,
            level,
            stage,
            agent,
            message,
            metadata,
            reply,
        })
        .await
    }

    pub async fn add_artifact(
        &self,
        task_id: &str,
        name: &str,
        kind: &str,
        path: Option<&str>,
        content: Option<&str>,
    ) -> StateResponse<i64> {
        let task_id = task_id.to_string();
        let name = name.to_string();
        let kind = kind.to_string();
        let path = path.map(str::to_string);
        let content = content.map(str::to_string);
        self.request(|reply| StateCommand::AddArtifact {
            task_id,
            name,
            kind,
            path,
            content,
            reply,
        })
        .await
    }

    /// Ask the actor to stop after draining queued commands
    pub async fn shutdown(&self) -> Result<(), StateError> {
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelClosed)
    }
}

/// The actor loop that owns the Store and processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("state actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateTask { task, reply } => {
                let result = store.create_task(task).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::GetTask { id, reply } => {
                let result = store.get_task(&id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::UpdateTask { id, update, reply } => {
                let result = store.update_task(&id, update).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::UpdateTaskStatus {
                id,
                status,
                stage,
                message,
                reply,
            } => {
                let result = store
                    .update_task_status(&id, status, stage.as_deref(), message.as_deref())
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListTasks { filter, reply } => {
                let result = store.list_tasks(&filter).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ReadyTasks {
                limit,
                by_priority,
                reply,
            } => {
                let result = store
                    .get_ready_tasks(limit, by_priority)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::PausedTasksForResume { reply } => {
                let result = store.get_paused_tasks_for_resume().map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::HighestPriorityParentTask { reply } => {
                let result = store
                    .find_highest_priority_parent_task()
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::NextResumeDeadline { reply } => {
                let result = store.next_resume_deadline().map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::OrphanedTasks { staleness, reply } => {
                let result = store.get_orphaned_tasks(staleness).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::DeleteTask { id, reply } => {
                let result = store.delete_task(&id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::CountTasksByStatus { reply } => {
                let result = store.count_tasks_by_status().map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::SaveCheckpoint { checkpoint, reply } => {
                let result = store.save_checkpoint(&checkpoint).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::LatestCheckpoint { task_id, reply } => {
                let result = store.get_latest_checkpoint(&task_id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListCheckpoints { task_id, reply } => {
                let result = store.list_checkpoints(&task_id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::DeleteCheckpoint { id, reply } => {
                let result = store.delete_checkpoint(&id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::DeleteAllCheckpoints { task_id, reply } => {
                let result = store.delete_all_checkpoints(&task_id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::DeleteCheckpointsBefore { cutoff, reply } => {
                let result = store
                    .delete_checkpoints_before(cutoff)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::NextCheckpointSequence { task_id, reply } => {
                let result = store
                    .next_checkpoint_sequence(&task_id)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::AddDependency {
                task_id,
                depends_on,
                reply,
            } => {
                let result = store
                    .add_dependency(&task_id, &depends_on)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::RemoveDependency {
                task_id,
                depends_on,
                reply,
            } => {
                let result = store
                    .remove_dependency(&task_id, &depends_on)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::GetDependencies { task_id, reply } => {
                let result = store.get_dependencies(&task_id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::GetDependents { task_id, reply } => {
                let result = store.get_dependents(&task_id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::IsReady { task_id, reply } => {
                let result = store.is_ready(&task_id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::SetGate { task_id, name, reply } => {
                let result = store.set_gate(&task_id, &name).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::RespondGate {
                task_id,
                name,
                approve,
                approver,
                comment,
                reply,
            } => {
                let result = if approve {
                    store.approve_gate(&task_id, &name, &approver, comment.as_deref())
                } else {
                    store.reject_gate(&task_id, &name, &approver, comment.as_deref())
                }
                .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::GetGate { task_id, name, reply } => {
                let result = store.get_gate(&task_id, &name).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListGates { task_id, reply } => {
                let result = store.list_gates(&task_id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListPendingGates { reply } => {
                let result = store.list_pending_gates().map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::CreateIdleTask { idle, reply } => {
                let result = store.create_idle_task(idle).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListIdleTasks {
                unimplemented_only,
                reply,
            } => {
                let result = store
                    .list_idle_tasks(unimplemented_only)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::MarkIdleImplemented { id, task_id, reply } => {
                let result = store
                    .mark_idle_implemented(&id, &task_id)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::AppendLog {
                task_id,
                level,
                stage,
                agent,
                message,
                metadata,
                reply,
            } => {
                let result = store
                    .append_log(
                        &task_id,
                        level,
                        stage.as_deref(),
                        agent.as_deref(),
                        &message,
                        metadata.as_ref(),
                    )
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::AddArtifact {
                task_id,
                name,
                kind,
                path,
                content,
                reply,
            } => {
                let result = store
                    .add_artifact(
                        &task_id,
                        &name,
                        &kind,
                        path.as_deref(),
                        content.as_deref(),
                    )
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::Shutdown => {
                info!("state manager shutting down");
                break;
            }
        }
    }

    debug!("state actor stopped");
}
