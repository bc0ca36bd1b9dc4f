//! Scheduler / runner
//!
//! Owns the single poll loop and the set of in-flight executions. Each
//! tick takes at most one ready task (canonical priority order), gates it
//! through the usage tracker, marks it in-progress, and dispatches the
//! executor on its own tokio task. Completion callbacks do the
//! accounting; the loop itself never awaits an executor.

mod executor;

pub use executor::{
    ExecutionContext, ExecutionOutcome, ExecutionRequest, TaskExecutor, WorkflowStageExecutor,
};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apex_store::{TaskStatus, TaskUpdate, TaskUsage};
use chrono::{DateTime, Utc};
use eyre::Result;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, OrphanDetectionConfig};
use crate::events::{Event, EventBus};
use crate::recovery::{self, REASON_PERIODIC, REASON_STARTUP};
use crate::session::SessionStore;
use crate::state::StateManager;
use crate::usage::UsageTracker;
use crate::workflow::WorkflowRegistry;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
    pub orphan: OrphanDetectionConfig,
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.daemon.poll_interval(),
            stop_timeout: config.daemon.stop_timeout(),
            orphan: config.daemon.orphan_detection.clone(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            stop_timeout: Duration::from_secs(5),
            orphan: OrphanDetectionConfig::default(),
        }
    }
}

/// Counters exposed through the status surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerMetrics {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub active_task_count: usize,
    pub poll_count: u64,
    pub started_at: DateTime<Utc>,
}

impl RunnerMetrics {
    fn new() -> Self {
        Self {
            tasks_processed: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            active_task_count: 0,
            poll_count: 0,
            started_at: Utc::now(),
        }
    }

    /// Seconds since the runner started
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

/// Shared view of the in-flight task set
pub type RunningSet = Arc<Mutex<HashSet<String>>>;
/// Shared view of the runner counters
pub type SharedMetrics = Arc<Mutex<RunnerMetrics>>;

/// The scheduler loop and its in-flight executions
pub struct Runner {
    config: RunnerConfig,
    state: StateManager,
    session: SessionStore,
    usage: Arc<UsageTracker>,
    events: Arc<EventBus>,
    executor: Arc<dyn TaskExecutor>,
    workflows: Arc<WorkflowRegistry>,
    running: RunningSet,
    metrics: SharedMetrics,
    handles: HashMap<String, JoinHandle<()>>,
    cancel_tx: watch::Sender<bool>,
    ready_tx: Option<oneshot::Sender<()>>,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RunnerConfig,
        state: StateManager,
        session: SessionStore,
        usage: Arc<UsageTracker>,
        events: Arc<EventBus>,
        executor: Arc<dyn TaskExecutor>,
        workflows: Arc<WorkflowRegistry>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            state,
            session,
            usage,
            events,
            executor,
            workflows,
            running: Arc::new(Mutex::new(HashSet::new())),
            metrics: Arc::new(Mutex::new(RunnerMetrics::new())),
            handles: HashMap::new(),
            cancel_tx,
            ready_tx: None,
        }
    }

    /// Shared handle to the in-flight set (used by the resume controller
    /// to bound how many tasks it wakes).
    pub fn running_handle(&self) -> RunningSet {
        self.running.clone()
    }

    /// Shared handle to the metrics counters
    pub fn metrics_handle(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Register a oneshot fired once startup recovery has finished and
    /// the loop is about to poll.
    pub fn notify_ready(&mut self, tx: oneshot::Sender<()>) {
        self.ready_tx = Some(tx);
    }

    /// Run the poll loop until a shutdown signal arrives
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(poll_interval_ms = self.config.poll_interval.as_millis() as u64, "runner starting");

        // Orphan recovery runs before the first poll accepts dispatches
        if self.config.orphan.enabled {
            self.run_recovery(REASON_STARTUP).await;
        }
        if let Some(ready) = self.ready_tx.take() {
            let _ = ready.send(());
        }

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let periodic = self.config.orphan.periodic_interval();
        let periodic_every = periodic.unwrap_or(Duration::from_secs(3600));
        let mut periodic_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + periodic_every, periodic_every);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "poll tick failed");
                        self.events.emit(Event::DaemonError {
                            message: e.to_string(),
                            component: Some("runner".to_string()),
                            timestamp: Utc::now(),
                        });
                    }
                    self.reap_finished().await;
                }
                _ = periodic_timer.tick(), if periodic.is_some() => {
                    self.run_recovery(REASON_PERIODIC).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("runner shutdown requested");
                    break;
                }
            }
        }

        self.shutdown_executions().await;
        info!("runner stopped");
        Ok(())
    }

    async fn run_recovery(&self, reason: &str) {
        let running = lock(&self.running).clone();
        if let Err(e) = recovery::recover_orphans(
            &self.state,
            &self.events,
            &running,
            &self.config.orphan,
            reason,
        )
        .await
        {
            warn!(error = %e, reason, "orphan recovery failed");
            self.events.emit(Event::DaemonError {
                message: format!("orphan recovery failed: {}", e),
                component: Some("recovery".to_string()),
                timestamp: Utc::now(),
            });
        }
    }

    /// One cooperative poll tick
    async fn tick(&mut self) -> Result<()> {
        lock(&self.metrics).poll_count += 1;

        let max_concurrent = self.usage.max_concurrent();
        if lock(&self.running).len() >= max_concurrent {
            return Ok(());
        }

        let ready = self
            .state
            .ready_tasks(1, true)
            .await
            .map_err(|e| eyre::eyre!("ready query: {}", e))?;
        let Some(task) = ready.into_iter().next() else {
            return Ok(());
        };

        // the running set plus the exclusive pending->in_progress
        // transition keep one task from being dispatched twice
        if lock(&self.running).contains(&task.id) {
            return Ok(());
        }

        let admission = self.usage.can_start_task();
        if !admission.allowed {
            debug!(
                task_id = %task.id,
                reason = admission.reason.as_deref().unwrap_or("unknown"),
                "dispatch deferred"
            );
            return Ok(());
        }

        let resume = match self.session.resume_context(&task.id).await {
            Ok(resume) => resume,
            Err(e) => {
                debug!(task_id = %task.id, error = %e, "resume context unavailable");
                None
            }
        };

        self.state
            .update_task_status(&task.id, TaskStatus::InProgress, None, None)
            .await
            .map_err(|e| eyre::eyre!("mark in-progress: {}", e))?;

        lock(&self.running).insert(task.id.clone());
        self.usage.track_task_start(&task.id);
        lock(&self.metrics).active_task_count = lock(&self.running).len();

        debug!(task_id = %task.id, resuming = resume.is_some(), "dispatching");

        let request = ExecutionRequest {
            task: task.clone(),
            resume,
            cancel: self.cancel_tx.subscribe(),
            ctx: ExecutionContext {
                state: self.state.clone(),
                session: self.session.clone(),
                events: self.events.clone(),
                workflows: self.workflows.clone(),
            },
        };

        let handle = tokio::spawn(run_execution(
            self.executor.clone(),
            request,
            self.state.clone(),
            self.session.clone(),
            self.usage.clone(),
            self.events.clone(),
            self.running.clone(),
            self.metrics.clone(),
        ));
        self.handles.insert(task.id, handle);
        Ok(())
    }

    /// Join executions whose tasks have finished
    async fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for id in finished {
            if let Some(handle) = self.handles.remove(&id) {
                if let Err(e) = handle.await {
                    error!(task_id = %id, error = %e, "execution task panicked");
                    lock(&self.running).remove(&id);
                }
            }
        }
    }

    /// Cooperative stop: signal cancel, wait out the grace window, then
    /// abandon stragglers with their status unchanged so orphan recovery
    /// heals them on the next start.
    async fn shutdown_executions(&mut self) {
        let _ = self.cancel_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.stop_timeout;
        while !self.handles.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.reap_finished().await;
        }

        if !self.handles.is_empty() {
            warn!(
                remaining = self.handles.len(),
                "abandoning executions after stop timeout"
            );
            for (id, handle) in self.handles.drain() {
                handle.abort();
                lock(&self.running).remove(&id);
                self.usage
                    .track_task_completion(&id, &TaskUsage::default(), false);
            }
        }
        lock(&self.metrics).active_task_count = lock(&self.running).len();
    }
}

/// Execute one task and perform the completion accounting
#[allow(clippy::too_many_arguments)]
async fn run_execution(
    executor: Arc<dyn TaskExecutor>,
    request: ExecutionRequest,
    state: StateManager,
    session: SessionStore,
    usage: Arc<UsageTracker>,
    events: Arc<EventBus>,
    running: RunningSet,
    metrics: SharedMetrics,
) {
    let task_id = request.task.id.clone();

    let outcome = match executor.execute(request).await {
        Ok(outcome) => outcome,
        Err(e) => ExecutionOutcome::Failed {
            error: e.to_string(),
            usage: TaskUsage::default(),
        },
    };

    match outcome {
        ExecutionOutcome::Completed { usage: consumed } => {
            usage.track_task_completion(&task_id, &consumed, true);
            record_usage(&state, &task_id, &consumed).await;
            if let Err(e) = state
                .update_task_status(&task_id, TaskStatus::Completed, None, None)
                .await
            {
                warn!(%task_id, error = %e, "failed to mark completed");
            }
            events.emit(Event::TaskCompleted {
                task_id: task_id.clone(),
                timestamp: Utc::now(),
            });
            lock(&metrics).tasks_succeeded += 1;
            info!(%task_id, "task completed");
        }
        ExecutionOutcome::Failed { error, usage: consumed } => {
            usage.track_task_completion(&task_id, &consumed, false);
            record_usage(&state, &task_id, &consumed).await;
            if let Err(e) = state
                .update_task_status(&task_id, TaskStatus::Failed, None, Some(&error))
                .await
            {
                warn!(%task_id, error = %e, "failed to mark failed");
            }
            events.emit(Event::TaskFailed {
                task_id: task_id.clone(),
                error: error.clone(),
                timestamp: Utc::now(),
            });
            lock(&metrics).tasks_failed += 1;
            warn!(%task_id, error = %error, "task failed");
        }
        ExecutionOutcome::Paused {
            reason,
            conversation,
            stage_state,
            usage: consumed,
        } => {
            usage.track_task_completion(&task_id, &consumed, false);
            record_usage(&state, &task_id, &consumed).await;
            if let Err(e) = state
                .update_task_status(&task_id, TaskStatus::Paused, None, Some(&reason.to_string()))
                .await
            {
                warn!(%task_id, error = %e, "failed to mark paused");
            }
            // checkpoint after the pause fields land so its metadata
            // carries the reason
            match state.get_task(&task_id).await {
                Ok(Some(task)) => {
                    if let Err(e) = session
                        .create_checkpoint(&task, conversation, stage_state)
                        .await
                    {
                        warn!(%task_id, error = %e, "pause checkpoint failed");
                    }
                }
                other => debug!(%task_id, ?other, "task missing for pause checkpoint"),
            }
            info!(%task_id, %reason, "task paused");
        }
    }

    lock(&running).remove(&task_id);
    let active = lock(&running).len();
    let mut m = lock(&metrics);
    m.tasks_processed += 1;
    m.active_task_count = active;
}

async fn record_usage(state: &StateManager, task_id: &str, consumed: &TaskUsage) {
    if consumed.total_tokens == 0 && consumed.estimated_cost == 0.0 {
        return;
    }
    match state.get_task(task_id).await {
        Ok(Some(task)) => {
            let mut total = task.usage;
            total.add(consumed);
            let update = TaskUpdate {
                usage: Some(total),
                ..Default::default()
            };
            if let Err(e) = state.update_task(task_id, update).await {
                warn!(%task_id, error = %e, "failed to record usage");
            }
        }
        _ => debug!(%task_id, "task missing while recording usage"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
