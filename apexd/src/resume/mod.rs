//! Pause/resume controller
//!
//! Listens for `capacity:restored` and for per-task `resume_after`
//! deadlines, then moves eligible paused tasks back to pending so the
//! scheduler picks them up. Parents resume before leaves because parents
//! gate their subtasks. A task over its resume-attempt cap fails instead
//! of resuming.

use std::sync::Arc;

use apex_store::{ResumePoint, SessionData, Task, TaskStatus, TaskUpdate};
use chrono::Utc;
use eyre::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};
use crate::runner::RunningSet;
use crate::session::SessionStore;
use crate::state::StateManager;
use crate::usage::UsageTracker;

/// Error text recorded when the resume cap is exceeded
pub const MAX_RESUME_ERROR: &str = "max resume attempts exceeded";
/// Reason tag used when a resume_after hold elapses
pub const REASON_HOLD_ELAPSED: &str = "resume_after_elapsed";

/// Options for an operator-initiated resume
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    /// Resume from this specific checkpoint instead of the latest
    pub checkpoint_id: Option<String>,
    /// Free-form reason recorded on the emitted event
    pub resume_reason: Option<String>,
}

/// What one restore pass did
#[derive(Debug, Default)]
pub struct RestoreOutcome {
    pub total: usize,
    pub resumed: usize,
    pub errors: Vec<String>,
}

/// Transitions tasks between paused and pending
#[derive(Clone)]
pub struct PauseResumeController {
    state: StateManager,
    session: SessionStore,
    usage: Arc<UsageTracker>,
    events: Arc<EventBus>,
    running: RunningSet,
}

impl PauseResumeController {
    pub fn new(
        state: StateManager,
        session: SessionStore,
        usage: Arc<UsageTracker>,
        events: Arc<EventBus>,
        running: RunningSet,
    ) -> Self {
        Self {
            state,
            session,
            usage,
            events,
            running,
        }
    }

    /// Event loop: reacts to `capacity:restored` and to the earliest
    /// pending `resume_after` deadline.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let mut events_rx = self.events.subscribe();
        info!("pause/resume controller started");

        loop {
            let next_hold = self.state.next_resume_deadline().await.unwrap_or(None);
            let until_hold = next_hold
                .map(|at| (at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO))
                .unwrap_or(std::time::Duration::from_secs(3600));

            tokio::select! {
                event = events_rx.recv() => match event {
                    Ok(Event::CapacityRestored { reason, .. }) => {
                        self.handle_restore(&reason.to_string()).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "resume controller lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep(until_hold), if next_hold.is_some() => {
                    debug!("resume_after hold elapsed");
                    self.handle_restore(REASON_HOLD_ELAPSED).await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("pause/resume controller stopped");
        Ok(())
    }

    /// Resume eligible paused work, bounded by free scheduler slots.
    /// A paused parent (task with subtasks) goes first and alone.
    pub async fn handle_restore(&self, reason: &str) -> RestoreOutcome {
        let free_slots = {
            let running = match self.running.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.usage.max_concurrent().saturating_sub(running.len())
        };
        if free_slots == 0 {
            debug!(reason, "no free slots, resuming nothing");
            return RestoreOutcome::default();
        }

        let mut outcome = RestoreOutcome::default();
        let mut context_summary = None;

        match self.state.highest_priority_parent_task().await {
            Ok(Some(parent)) => {
                outcome.total = 1;
                match self.resume_task(&parent, reason, None).await {
                    Ok(summary) => {
                        outcome.resumed = 1;
                        context_summary = summary;
                    }
                    Err(e) => outcome.errors.push(e.to_string()),
                }
            }
            Ok(None) => {
                let paused = match self.state.paused_tasks_for_resume().await {
                    Ok(paused) => paused,
                    Err(e) => {
                        warn!(error = %e, "paused-task query failed");
                        return outcome;
                    }
                };
                outcome.total = paused.len();
                for task in paused.into_iter().take(free_slots) {
                    match self.resume_task(&task, reason, None).await {
                        Ok(summary) => {
                            outcome.resumed += 1;
                            if context_summary.is_none() {
                                context_summary = summary;
                            }
                        }
                        Err(e) => outcome.errors.push(e.to_string()),
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "parent-task query failed");
                return outcome;
            }
        }

        if outcome.total > 0 {
            self.events.emit(Event::TasksAutoResumed {
                reason: reason.to_string(),
                total_tasks: outcome.total,
                resumed_count: outcome.resumed,
                errors: outcome.errors.clone(),
                timestamp: Utc::now(),
                resume_reason: Some(reason.to_string()),
                context_summary,
            });
        }
        info!(
            reason,
            total = outcome.total,
            resumed = outcome.resumed,
            errors = outcome.errors.len(),
            "restore pass finished"
        );
        outcome
    }

    /// Operator-initiated resume of a specific task
    pub async fn resume_task_by_id(&self, task_id: &str, opts: ResumeOptions) -> Result<()> {
        let task = self
            .state
            .get_task_required(task_id)
            .await
            .map_err(|e| eyre::eyre!("{}", e))?;
        if task.status != TaskStatus::Paused {
            eyre::bail!("task {} is not paused (status: {})", task_id, task.status);
        }

        let reason = opts
            .resume_reason
            .clone()
            .unwrap_or_else(|| "manual_resume".to_string());
        self.resume_task(&task, &reason, opts.checkpoint_id.as_deref())
            .await
            .map(|_| ())
    }

    /// Core resume transition. Returns the context summary, if any, for
    /// the aggregate event.
    async fn resume_task(
        &self,
        task: &Task,
        reason: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<String>> {
        if task.resume_attempts >= task.max_resume_attempts {
            warn!(task_id = %task.id, attempts = task.resume_attempts, "resume cap exhausted");
            self.state
                .update_task_status(&task.id, TaskStatus::Failed, None, Some(MAX_RESUME_ERROR))
                .await
                .map_err(|e| eyre::eyre!("mark failed: {}", e))?;
            self.events.emit(Event::TaskFailed {
                task_id: task.id.clone(),
                error: MAX_RESUME_ERROR.to_string(),
                timestamp: Utc::now(),
            });
            eyre::bail!("{} for task {}", MAX_RESUME_ERROR, task.id);
        }

        let session_data = self.session_data_for(task, checkpoint_id).await;
        let context_summary = session_data
            .as_ref()
            .and_then(|s| s.context_summary.clone());

        self.state
            .update_task(
                &task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Pending),
                    resume_attempts: Some(task.resume_attempts + 1),
                    paused_at: Some(None),
                    resume_after: Some(None),
                    pause_reason: Some(None),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| eyre::eyre!("resume transition: {}", e))?;

        if session_data.is_some() {
            self.events.emit(Event::SessionRecovered {
                task_id: task.id.clone(),
                timestamp: Utc::now(),
            });
        }
        self.events.emit(Event::TaskSessionResumed {
            task_id: task.id.clone(),
            resume_reason: reason.to_string(),
            context_summary: context_summary.clone(),
            previous_status: task.status,
            session_data,
            timestamp: Utc::now(),
        });

        info!(task_id = %task.id, reason, "task resumed to pending");
        Ok(context_summary)
    }

    /// Session data for the resume event: derived from the requested (or
    /// latest) checkpoint so history, stage state, and resume point
    /// survive verbatim; falls back to the task row hints.
    async fn session_data_for(
        &self,
        task: &Task,
        checkpoint_id: Option<&str>,
    ) -> Option<SessionData> {
        let checkpoint = match checkpoint_id {
            Some(id) => self
                .state
                .list_checkpoints(&task.id)
                .await
                .ok()?
                .into_iter()
                .find(|cp| cp.id == id),
            None => self.state.latest_checkpoint(&task.id).await.ok()?,
        };

        match checkpoint {
            Some(cp) => Some(SessionData {
                last_checkpoint: Some(cp.created_at),
                context_summary: task
                    .session
                    .as_ref()
                    .and_then(|s| s.context_summary.clone()),
                recent_history: cp.conversation.clone(),
                stage_state: cp.stage_state.clone(),
                resume_point: Some(ResumePoint {
                    stage: cp.stage.clone(),
                    step_index: cp.stage_index,
                    metadata: serde_json::Value::Null,
                }),
            }),
            None => task.session.clone(),
        }
    }
}
