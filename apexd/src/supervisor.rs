//! Daemon supervisor
//!
//! Owns component lifecycle: starts the store, session layer, runner,
//! resume controller, capacity monitor, health loop, and watchdog in
//! dependency order, stops them in reverse, and aggregates status. The
//! state machine is stopped -> starting -> running -> stopping ->
//! stopped; operations in the wrong state return a state error without
//! side effects.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use eyre::Result;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capacity::{CapacityMonitor, CapacityStatus, DEFAULT_SAMPLE_INTERVAL};
use crate::config::Config;
use crate::events::{Event, EventBus, create_event_bus, spawn_event_logger};
use crate::health::{HealthMonitor, HealthReport};
use crate::resume::PauseResumeController;
use crate::runner::{Runner, RunnerConfig, RunnerMetrics, SharedMetrics, TaskExecutor};
use crate::session::{SessionStore, default_checkpoint_retention};
use crate::state::StateManager;
use crate::usage::{UsageSnapshot, UsageTracker};
use crate::watchdog::Watchdog;
use crate::workflow::WorkflowRegistry;

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// State-machine violations
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SupervisorState,
    },
}

/// Aggregated status for the CLI and health surface
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub state: SupervisorState,
    pub project: String,
    pub runner: Option<RunnerMetrics>,
    pub tasks: HashMap<String, u64>,
    pub usage: Option<UsageSnapshot>,
    pub capacity: Option<CapacityStatus>,
    pub health: Option<HealthReport>,
}

struct Components {
    state: StateManager,
    usage: Arc<UsageTracker>,
    capacity: Arc<CapacityMonitor>,
    health: Arc<HealthMonitor>,
    controller: PauseResumeController,
    metrics: SharedMetrics,
    runner_shutdown: mpsc::Sender<()>,
    runner_handle: JoinHandle<Result<()>>,
    controller_shutdown: mpsc::Sender<()>,
    controller_handle: JoinHandle<Result<()>>,
    watchdog_shutdown: Option<mpsc::Sender<()>>,
    watchdog_handle: Option<JoinHandle<()>>,
    health_loop: Option<JoinHandle<()>>,
    event_logger: JoinHandle<()>,
}

/// Wires components, forwards events outward, aggregates status
pub struct Supervisor {
    project_dir: PathBuf,
    config: Config,
    events: Arc<EventBus>,
    executor: Arc<dyn TaskExecutor>,
    state: Mutex<SupervisorState>,
    components: Mutex<Option<Components>>,
}

impl Supervisor {
    pub fn new(
        project_dir: PathBuf,
        config: Config,
        executor: Arc<dyn TaskExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            project_dir,
            config,
            events: create_event_bus(),
            executor,
            state: Mutex::new(SupervisorState::Stopped),
            components: Mutex::new(None),
        })
    }

    /// The daemon's event bus
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SupervisorState {
        *self.state.lock().await
    }

    /// Resume controller handle for operator-initiated resumes
    pub async fn controller(&self) -> Option<PauseResumeController> {
        self.components
            .lock()
            .await
            .as_ref()
            .map(|c| c.controller.clone())
    }

    /// Start every component in dependency order. A failed start leaves
    /// the supervisor stopped and emits `daemon:error`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != SupervisorState::Stopped {
                return Err(SupervisorError::InvalidState {
                    operation: "start",
                    state: *state,
                }
                .into());
            }
            *state = SupervisorState::Starting;
        }

        info!(project = %self.project_dir.display(), "daemon starting");
        match self.wire_components().await {
            Ok(components) => {
                *self.components.lock().await = Some(components);
                *self.state.lock().await = SupervisorState::Running;
                self.events.emit(Event::DaemonStarted {
                    timestamp: Utc::now(),
                });
                info!("daemon started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "daemon start failed");
                self.events.emit(Event::DaemonError {
                    message: format!("start failed: {}", e),
                    component: Some("supervisor".to_string()),
                    timestamp: Utc::now(),
                });
                *self.state.lock().await = SupervisorState::Stopped;
                Err(e)
            }
        }
    }

    async fn wire_components(self: &Arc<Self>) -> Result<Components> {
        let state_dir = Config::state_dir(&self.project_dir);
        std::fs::create_dir_all(&state_dir)?;

        // Store
        let state = StateManager::spawn(&state_dir, Some(self.events.clone()))?;

        // Workflows
        let workflows = Arc::new(WorkflowRegistry::from_config(&self.config.workflows));

        // Session store
        let session = SessionStore::new(
            state.clone(),
            self.config.daemon.session_recovery.clone(),
            state_dir.clone(),
        );

        // Usage tracker
        let usage = Arc::new(UsageTracker::new(
            self.config.limits.clone(),
            self.config.daemon.time_based_usage.clone(),
            self.events.clone(),
        ));

        // Runner
        let mut runner = Runner::new(
            RunnerConfig::from_config(&self.config),
            state.clone(),
            session.clone(),
            usage.clone(),
            self.events.clone(),
            self.executor.clone(),
            workflows.clone(),
        );
        let running = runner.running_handle();
        let metrics = runner.metrics_handle();
        let (ready_tx, ready_rx) = oneshot::channel();
        runner.notify_ready(ready_tx);
        let (runner_shutdown, runner_shutdown_rx) = mpsc::channel(1);
        let runner_handle = tokio::spawn(runner.run(runner_shutdown_rx));

        // Pause/resume controller
        let controller = PauseResumeController::new(
            state.clone(),
            session.clone(),
            usage.clone(),
            self.events.clone(),
            running.clone(),
        );
        let (controller_shutdown, controller_shutdown_rx) = mpsc::channel(1);
        let controller_handle = tokio::spawn(controller.clone().run(controller_shutdown_rx));

        // Orphan recovery runs inside the runner before its first poll;
        // startup auto-resume waits for that to finish.
        if tokio::time::timeout(std::time::Duration::from_secs(30), ready_rx)
            .await
            .is_err()
        {
            warn!("runner did not signal readiness in time");
        }
        if self.config.daemon.session_recovery.enabled
            && self.config.daemon.session_recovery.auto_resume
        {
            controller.handle_restore("startup_auto_resume").await;
        }
        if self.config.daemon.session_recovery.enabled {
            if let Err(e) = session.cleanup_checkpoints(default_checkpoint_retention()).await {
                warn!(error = %e, "startup checkpoint cleanup failed");
            }
        }

        // Capacity monitor
        let capacity = Arc::new(CapacityMonitor::new(
            usage.clone(),
            self.events.clone(),
            DEFAULT_SAMPLE_INTERVAL,
        ));
        capacity.start();

        // Health monitor (+ probe loop)
        let health = Arc::new(HealthMonitor::new());
        let health_loop = self.config.daemon.health_check.enabled.then(|| {
            tokio::spawn(health_loop(
                state.clone(),
                health.clone(),
                metrics.clone(),
                self.events.clone(),
                self.config.daemon.health_check.interval(),
            ))
        });

        // Watchdog
        let (watchdog_shutdown, watchdog_handle) = if self.config.daemon.watchdog.enabled {
            let watchdog = Arc::new(Watchdog::new(
                self.config.daemon.watchdog.clone(),
                health.clone(),
            ));
            let (tx, rx) = mpsc::channel(1);
            let handle = tokio::spawn(watchdog.run(self.clone(), self.events.clone(), rx));
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        // Event log
        let event_logger = spawn_event_logger(&self.events, state_dir);

        Ok(Components {
            state,
            usage,
            capacity,
            health,
            controller,
            metrics,
            runner_shutdown,
            runner_handle,
            controller_shutdown,
            controller_handle,
            watchdog_shutdown,
            watchdog_handle,
            health_loop,
            event_logger,
        })
    }

    /// Stop all components in reverse order. Stopping an already-stopped
    /// supervisor is a no-op; stopping mid-transition is a state error.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match *state {
                SupervisorState::Running => *state = SupervisorState::Stopping,
                SupervisorState::Stopped => {
                    debug!("stop requested while already stopped");
                    return Ok(());
                }
                other => {
                    return Err(SupervisorError::InvalidState {
                        operation: "stop",
                        state: other,
                    }
                    .into());
                }
            }
        }

        info!("daemon stopping");
        let components = self.components.lock().await.take();
        if let Some(components) = components {
            // reverse of start order
            if let Some(shutdown) = &components.watchdog_shutdown {
                let _ = shutdown.send(()).await;
            }
            if let Some(handle) = components.watchdog_handle {
                let _ = handle.await;
            }
            if let Some(handle) = components.health_loop {
                handle.abort();
            }
            components.capacity.stop();

            let _ = components.controller_shutdown.send(()).await;
            let _ = components.runner_shutdown.send(()).await;
            let (controller_res, runner_res) =
                futures::future::join(components.controller_handle, components.runner_handle)
                    .await;
            if let Err(e) = controller_res {
                warn!(error = %e, "controller task join failed");
            }
            match runner_res {
                Ok(Err(e)) => warn!(error = %e, "runner exited with error"),
                Err(e) => warn!(error = %e, "runner task join failed"),
                Ok(Ok(())) => {}
            }

            self.events.emit(Event::DaemonStopped {
                timestamp: Utc::now(),
            });
            // give the event logger a moment to drain before killing it
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            components.event_logger.abort();

            if let Err(e) = components.state.shutdown().await {
                warn!(error = %e, "state manager shutdown failed");
            }
        }

        *self.state.lock().await = SupervisorState::Stopped;
        info!("daemon stopped");
        Ok(())
    }

    /// Stop-then-start cycle (watchdog path)
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        warn!("daemon restarting");
        self.stop().await?;
        self.start().await
    }

    /// Aggregate status across components
    pub async fn status(&self) -> DaemonStatus {
        let state = *self.state.lock().await;
        let components = self.components.lock().await;

        let Some(components) = components.as_ref() else {
            return DaemonStatus {
                state,
                project: self.project_dir.display().to_string(),
                runner: None,
                tasks: HashMap::new(),
                usage: None,
                capacity: None,
                health: None,
            };
        };

        let tasks = components
            .state
            .count_tasks_by_status()
            .await
            .map(|counts| {
                counts
                    .into_iter()
                    .map(|(status, count)| (status.to_string(), count))
                    .collect()
            })
            .unwrap_or_default();

        let runner = components
            .metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());

        DaemonStatus {
            state,
            project: self.project_dir.display().to_string(),
            runner: Some(runner),
            tasks,
            usage: Some(components.usage.current_usage()),
            capacity: Some(components.capacity.status()),
            health: Some(components.health.report()),
        }
    }

    /// Run until SIGTERM/SIGINT, then stop gracefully
    pub async fn run_until_shutdown(self: &Arc<Self>) -> Result<()> {
        self.start().await?;
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        self.stop().await
    }
}

async fn health_loop(
    state: StateManager,
    health: Arc<HealthMonitor>,
    metrics: SharedMetrics,
    events: Arc<EventBus>,
    interval: std::time::Duration,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        timer.tick().await;

        // liveness probe: can we still reach the store?
        let ok = state.count_tasks_by_status().await.is_ok();
        health.perform_health_check(ok);

        let active = metrics
            .lock()
            .map(|m| m.active_task_count)
            .unwrap_or_default();
        health.record_sample(active);

        if !ok {
            events.emit(Event::DaemonError {
                message: "health check failed: store unreachable".to_string(),
                component: Some("health".to_string()),
                timestamp: Utc::now(),
            });
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
