//! Executor seam
//!
//! The stage executor is external to the core: the runner hands it a
//! task plus an optional resume context and consumes a single outcome.
//! Delivery is at-least-once; executors are expected to resume
//! idempotently from the provided checkpoint context.

use std::sync::Arc;

use apex_store::{
    ConversationMessage, PauseReason, Role, Task, TaskUsage, TaskUpdate,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::events::{Event, EventBus};
use crate::session::{ResumeContext, SessionStore};
use crate::state::StateManager;
use crate::workflow::WorkflowRegistry;

/// Handles an executor may use to report progress
#[derive(Clone)]
pub struct ExecutionContext {
    pub state: StateManager,
    pub session: SessionStore,
    pub events: Arc<EventBus>,
    pub workflows: Arc<WorkflowRegistry>,
}

impl ExecutionContext {
    /// Record a stage transition: store update plus `task:stage-changed`
    pub async fn stage_changed(&self, task_id: &str, stage: &str, stage_index: u32) {
        let update = TaskUpdate {
            stage: Some(Some(stage.to_string())),
            stage_index: Some(stage_index),
            ..Default::default()
        };
        if let Err(e) = self.state.update_task(task_id, update).await {
            debug!(%task_id, error = %e, "failed to record stage change");
        }
        self.events.emit(Event::TaskStageChanged {
            task_id: task_id.to_string(),
            stage: stage.to_string(),
            stage_index,
            timestamp: Utc::now(),
        });
    }
}

/// One dispatched execution
pub struct ExecutionRequest {
    pub task: Task,
    /// Latest checkpoint's resume point, or None for a fresh task
    pub resume: Option<ResumeContext>,
    /// Flips to true when the daemon wants the executor to stop
    pub cancel: watch::Receiver<bool>,
    pub ctx: ExecutionContext,
}

/// Terminal report of one execution
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed {
        usage: TaskUsage,
    },
    Failed {
        error: String,
        usage: TaskUsage,
    },
    /// Not an error: the executor yielded with a structured reason and
    /// the state needed to resume later.
    Paused {
        reason: PauseReason,
        conversation: Vec<ConversationMessage>,
        stage_state: Option<Value>,
        usage: TaskUsage,
    },
}

/// The opaque stage executor
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> eyre::Result<ExecutionOutcome>;
}

/// Built-in executor that walks the task's workflow stages, emitting a
/// stage change and a checkpoint at each boundary. Consumes no tokens;
/// serves as the dispatch target when no external executor is wired in.
pub struct WorkflowStageExecutor;

#[async_trait]
impl TaskExecutor for WorkflowStageExecutor {
    async fn execute(&self, request: ExecutionRequest) -> eyre::Result<ExecutionOutcome> {
        let ExecutionRequest {
            task,
            resume,
            cancel,
            ctx,
        } = request;

        let workflow = ctx.workflows.get_or_default(&task.workflow).clone();
        let mut conversation = resume
            .as_ref()
            .map(|r| r.conversation.clone())
            .unwrap_or_default();
        let start_index = resume.as_ref().map(|r| r.stage_index as usize).unwrap_or(0);

        for (index, stage) in workflow.stages.iter().enumerate().skip(start_index) {
            if *cancel.borrow() {
                return Ok(ExecutionOutcome::Paused {
                    reason: PauseReason::Other,
                    conversation,
                    stage_state: Some(serde_json::json!({"stage_index": index})),
                    usage: TaskUsage::default(),
                });
            }

            ctx.stage_changed(&task.id, stage, index as u32).await;
            conversation.push(ConversationMessage::text(
                Role::Assistant,
                format!("Completed stage {}", stage),
            ));

            let mut snapshot = task.clone();
            snapshot.stage = Some(stage.clone());
            snapshot.stage_index = index as u32;
            if let Err(e) = ctx
                .session
                .create_checkpoint(&snapshot, conversation.clone(), None)
                .await
            {
                debug!(task_id = %task.id, error = %e, "stage checkpoint failed");
            }
        }

        Ok(ExecutionOutcome::Completed {
            usage: TaskUsage::default(),
        })
    }
}
