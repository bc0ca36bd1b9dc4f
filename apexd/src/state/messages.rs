//! StateManager command protocol and errors

use apex_store::{
    Checkpoint, Gate, IdleTask, LogLevel, StoreError, Task, TaskFilter, TaskStatus, TaskUpdate,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors surfaced to StateManager callers
#[derive(Debug, Error)]
pub enum StateError {
    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("state channel closed")]
    ChannelClosed,
}

impl From<StoreError> for StateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::InvalidDependency(what) => Self::InvalidDependency(what),
            other => Self::Store(other.to_string()),
        }
    }
}

/// Result alias for StateManager calls
pub type StateResponse<T> = Result<T, StateError>;

type Reply<T> = oneshot::Sender<StateResponse<T>>;

/// Commands processed by the state actor
pub enum StateCommand {
    // Tasks
    CreateTask {
        task: Task,
        reply: Reply<Task>,
    },
    GetTask {
        id: String,
        reply: Reply<Option<Task>>,
    },
    UpdateTask {
        id: String,
        update: TaskUpdate,
        reply: Reply<()>,
    },
    UpdateTaskStatus {
        id: String,
        status: TaskStatus,
        stage: Option<String>,
        message: Option<String>,
        reply: Reply<()>,
    },
    ListTasks {
        filter: TaskFilter,
        reply: Reply<Vec<Task>>,
    },
    ReadyTasks {
        limit: usize,
        by_priority: bool,
        reply: Reply<Vec<Task>>,
    },
    PausedTasksForResume {
        reply: Reply<Vec<Task>>,
    },
    HighestPriorityParentTask {
        reply: Reply<Option<Task>>,
    },
    NextResumeDeadline {
        reply: Reply<Option<chrono::DateTime<chrono::Utc>>>,
    },
    OrphanedTasks {
        staleness: chrono::Duration,
        reply: Reply<Vec<Task>>,
    },
    DeleteTask {
        id: String,
        reply: Reply<()>,
    },
    CountTasksByStatus {
        reply: Reply<Vec<(TaskStatus, u64)>>,
    },

    // Checkpoints
    SaveCheckpoint {
        checkpoint: Box<Checkpoint>,
        reply: Reply<()>,
    },
    LatestCheckpoint {
        task_id: String,
        reply: Reply<Option<Checkpoint>>,
    },
    ListCheckpoints {
        task_id: String,
        reply: Reply<Vec<Checkpoint>>,
    },
    DeleteCheckpoint {
        id: String,
        reply: Reply<()>,
    },
    DeleteAllCheckpoints {
        task_id: String,
        reply: Reply<usize>,
    },
    DeleteCheckpointsBefore {
        cutoff: chrono::DateTime<chrono::Utc>,
        reply: Reply<usize>,
    },
    NextCheckpointSequence {
        task_id: String,
        reply: Reply<u32>,
    },

    // Dependencies
    AddDependency {
        task_id: String,
        depends_on: String,
        reply: Reply<()>,
    },
    RemoveDependency {
        task_id: String,
        depends_on: String,
        reply: Reply<()>,
    },
    GetDependencies {
        task_id: String,
        reply: Reply<Vec<String>>,
    },
    GetDependents {
        task_id: String,
        reply: Reply<Vec<String>>,
    },
    IsReady {
        task_id: String,
        reply: Reply<bool>,
    },

    // Gates
    SetGate {
        task_id: String,
        name: String,
        reply: Reply<Gate>,
    },
    RespondGate {
        task_id: String,
        name: String,
        approve: bool,
        approver: String,
        comment: Option<String>,
        reply: Reply<Gate>,
    },
    GetGate {
        task_id: String,
        name: String,
        reply: Reply<Option<Gate>>,
    },
    ListGates {
        task_id: String,
        reply: Reply<Vec<Gate>>,
    },
    ListPendingGates {
        reply: Reply<Vec<Gate>>,
    },

    // Idle tasks
    CreateIdleTask {
        idle: IdleTask,
        reply: Reply<IdleTask>,
    },
    ListIdleTasks {
        unimplemented_only: bool,
        reply: Reply<Vec<IdleTask>>,
    },
    MarkIdleImplemented {
        id: String,
        task_id: String,
        reply: Reply<()>,
    },

    // Logs and artifacts
    AppendLog {
        task_id: String,
        level: LogLevel,
        stage: Option<String>,
        agent: Option<String>,
        message: String,
        metadata: Option<Value>,
        reply: Reply<i64>,
    },
    AddArtifact {
        task_id: String,
        name: String,
        kind: String,
        path: Option<String>,
        content: Option<String>,
        reply: Reply<i64>,
    },

    Shutdown,
}
