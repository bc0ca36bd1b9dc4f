//! Orphan recovery
//!
//! Tasks left in-progress by a dead process are detected by stale
//! `updated_at` and healed according to the configured policy. Runs once
//! before the scheduler's first poll, and optionally on a timer.

use std::collections::HashSet;

use apex_store::{Task, TaskStatus, TaskUpdate};
use chrono::Utc;
use eyre::Result;
use tracing::{debug, info, warn};

use crate::config::{OrphanDetectionConfig, RecoveryPolicy};
use crate::events::{Event, EventBus};
use crate::state::StateManager;

/// Reason tag for the startup scan
pub const REASON_STARTUP: &str = "startup_check";
/// Reason tag for timed re-checks
pub const REASON_PERIODIC: &str = "periodic_check";

/// One healed task
#[derive(Debug, Clone)]
pub struct RecoveredTask {
    pub task_id: String,
    pub action: &'static str,
    pub new_status: TaskStatus,
}

/// Outcome of one recovery pass
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub detected: usize,
    pub recovered: Vec<RecoveredTask>,
}

/// Scan for orphans and heal them. Tasks currently held by the running
/// scheduler are skipped (hot-restart guard). Emits `orphan:detected`
/// once per non-empty scan and `orphan:recovered` per healed task, so a
/// second pass with nothing to do emits nothing.
pub async fn recover_orphans(
    state: &StateManager,
    events: &EventBus,
    running: &HashSet<String>,
    config: &OrphanDetectionConfig,
    reason: &str,
) -> Result<RecoveryReport> {
    let candidates: Vec<Task> = state
        .orphaned_tasks(config.staleness())
        .await
        .map_err(|e| eyre::eyre!("orphan scan: {}", e))?
        .into_iter()
        .filter(|task| !running.contains(&task.id))
        .collect();

    if candidates.is_empty() {
        debug!(reason, "no orphaned tasks");
        return Ok(RecoveryReport::default());
    }

    info!(
        count = candidates.len(),
        reason,
        policy = %config.recovery_policy,
        "orphaned tasks detected"
    );
    events.emit(Event::OrphanDetected {
        task_ids: candidates.iter().map(|t| t.id.clone()).collect(),
        detected_at: Utc::now(),
        reason: reason.to_string(),
        staleness_threshold_ms: config.staleness_threshold_ms,
    });

    let mut report = RecoveryReport {
        detected: candidates.len(),
        recovered: Vec::new(),
    };

    for task in candidates {
        let healed = match apply_policy(state, &task, config.recovery_policy).await {
            Ok(healed) => healed,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "failed to recover orphan");
                continue;
            }
        };

        events.emit(Event::OrphanRecovered {
            task_id: healed.task_id.clone(),
            previous_status: TaskStatus::InProgress,
            new_status: healed.new_status,
            action: healed.action.to_string(),
            message: format!("recovered by {} policy", config.recovery_policy),
            timestamp: Utc::now(),
        });
        report.recovered.push(healed);
    }

    info!(recovered = report.recovered.len(), "orphan recovery finished");
    Ok(report)
}

async fn apply_policy(
    state: &StateManager,
    task: &Task,
    policy: RecoveryPolicy,
) -> Result<RecoveredTask> {
    let (action, new_status) = match policy {
        RecoveryPolicy::Pending => {
            state
                .update_task_status(&task.id, TaskStatus::Pending, None, None)
                .await
                .map_err(|e| eyre::eyre!("reset to pending: {}", e))?;
            ("reset_pending", TaskStatus::Pending)
        }
        RecoveryPolicy::Fail => {
            state
                .update_task_status(
                    &task.id,
                    TaskStatus::Failed,
                    None,
                    Some("orphaned after restart"),
                )
                .await
                .map_err(|e| eyre::eyre!("mark failed: {}", e))?;
            ("marked_failed", TaskStatus::Failed)
        }
        RecoveryPolicy::Retry => {
            state
                .update_task(
                    &task.id,
                    TaskUpdate {
                        status: Some(TaskStatus::Pending),
                        retry_count: Some(task.retry_count + 1),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| eyre::eyre!("retry reset: {}", e))?;
            ("retry", TaskStatus::Pending)
        }
    };

    Ok(RecoveredTask {
        task_id: task.id.clone(),
        action,
        new_status,
    })
}
