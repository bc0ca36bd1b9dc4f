//! Watchdog
//!
//! Listens for `daemon:error` on the bus and drives restart cycles
//! through the supervisor's state machine, bounded by a restart window
//! and a restart budget. Failed health checks surface as `daemon:error`
//! and take the same path.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::WatchdogConfig;
use crate::events::{Event, EventBus};
use crate::health::HealthMonitor;
use crate::supervisor::Supervisor;

#[derive(Default)]
struct WatchdogState {
    restart_count: u32,
    last_restart: Option<Instant>,
}

/// Restart policy over fatal daemon errors
pub struct Watchdog {
    config: WatchdogConfig,
    health: Arc<HealthMonitor>,
    state: Mutex<WatchdogState>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, health: Arc<HealthMonitor>) -> Self {
        Self {
            config,
            health,
            state: Mutex::new(WatchdogState::default()),
        }
    }

    /// A restart is allowed when the last one is outside the window or
    /// the budget is not yet spent.
    pub fn can_restart(&self) -> bool {
        let state = self.lock();
        let outside_window = state
            .last_restart
            .is_none_or(|last| last.elapsed() > self.config.restart_window());
        outside_window || state.restart_count < self.config.max_restarts
    }

    fn note_restart(&self) {
        let mut state = self.lock();
        // a quiet window earns the budget back
        if state
            .last_restart
            .is_some_and(|last| last.elapsed() > self.config.restart_window())
        {
            state.restart_count = 0;
        }
        state.restart_count += 1;
        state.last_restart = Some(Instant::now());
    }

    /// Count of restarts within the current window
    pub fn restart_count(&self) -> u32 {
        self.lock().restart_count
    }

    /// Watch the bus for fatal errors until shutdown
    pub async fn run(
        self: Arc<Self>,
        supervisor: Arc<Supervisor>,
        events: Arc<EventBus>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut rx = events.subscribe();
        info!(
            max_restarts = self.config.max_restarts,
            restart_delay_ms = self.config.restart_delay_ms,
            "watchdog started"
        );

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(Event::DaemonError { message, component, .. }) => {
                        self.handle_error(&supervisor, &message, component.as_deref());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "watchdog lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
        info!("watchdog stopped");
    }

    fn handle_error(&self, supervisor: &Arc<Supervisor>, message: &str, component: Option<&str>) {
        warn!(message, ?component, "watchdog observed daemon error");

        if !self.can_restart() {
            error!(
                restart_count = self.restart_count(),
                "restart budget exhausted, leaving daemon down"
            );
            return;
        }

        self.note_restart();
        self.health.record_restart(message, None, true);

        let delay = self.config.restart_delay();
        let supervisor = supervisor.clone();
        let reason = message.to_string();
        // the restart runs on its own task so this loop (which stop()
        // tears down) never waits on itself
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!(reason, "watchdog restarting daemon");
            if let Err(e) = supervisor.restart().await {
                error!(error = %e, "watchdog restart failed");
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WatchdogState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog(max_restarts: u32, window_ms: u64) -> Watchdog {
        Watchdog::new(
            WatchdogConfig {
                enabled: true,
                max_restarts,
                restart_delay_ms: 1,
                restart_window_ms: window_ms,
            },
            Arc::new(HealthMonitor::new()),
        )
    }

    #[test]
    fn test_can_restart_within_budget() {
        let dog = watchdog(2, 60_000);
        assert!(dog.can_restart());
        dog.note_restart();
        assert!(dog.can_restart());
        dog.note_restart();
        // budget spent and still inside the window
        assert!(!dog.can_restart());
    }

    #[test]
    fn test_window_expiry_allows_restart_again() {
        let dog = watchdog(1, 10);
        dog.note_restart();
        assert!(!dog.can_restart());

        std::thread::sleep(std::time::Duration::from_millis(30));
        // outside the window the restart is allowed again
        assert!(dog.can_restart());

        // and the counter resets when it fires
        dog.note_restart();
        assert_eq!(dog.restart_count(), 1);
    }
}
