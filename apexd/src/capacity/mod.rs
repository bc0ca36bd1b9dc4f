//! Capacity monitor
//!
//! Samples the usage tracker on a timer (default 30 s) plus two alarms:
//! the next mode switch and the next midnight (daily-budget reset). Each
//! sample compares usage against thresholds on four axes and emits
//! `capacity:restored` when a previously-exhausted axis drops below its
//! threshold. Start and stop are idempotent.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{Event, EventBus, RestoreReason};
use crate::usage::{UsageSnapshot, UsageTracker};

/// Default sampling interval
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Which capacity axes are currently exhausted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AxisSet {
    pub tokens: bool,
    pub cost: bool,
    pub concurrency: bool,
    pub daily_budget: bool,
}

impl AxisSet {
    /// Any axis exhausted?
    pub fn any(self) -> bool {
        self.tokens || self.cost || self.concurrency || self.daily_budget
    }

    /// Axes exhausted in `self` but free in `now`
    pub fn restored_in(self, now: AxisSet) -> AxisSet {
        AxisSet {
            tokens: self.tokens && !now.tokens,
            cost: self.cost && !now.cost,
            concurrency: self.concurrency && !now.concurrency,
            daily_budget: self.daily_budget && !now.daily_budget,
        }
    }
}

/// Exhaustion per axis for a snapshot. The per-task axes judge the most
/// recently finished task against the per-task caps; concurrency and
/// daily budget come straight from the accumulator.
pub fn compute_exhausted(snapshot: &UsageSnapshot) -> AxisSet {
    let tokens = snapshot
        .limits
        .max_tokens_per_task
        .zip(snapshot.last_task_usage)
        .is_some_and(|(cap, last)| last.total_tokens >= cap);
    let cost = snapshot
        .limits
        .max_cost_per_task
        .zip(snapshot.last_task_usage)
        .is_some_and(|(cap, last)| last.estimated_cost >= cap);
    let concurrency = snapshot.active_tasks >= snapshot.limits.max_concurrent_tasks;
    let daily_budget = snapshot.limits.daily_budget.is_some_and(|budget| {
        snapshot.daily_spent + snapshot.limits.max_cost_per_task.unwrap_or(0.0) > budget
    });

    AxisSet {
        tokens,
        cost,
        concurrency,
        daily_budget,
    }
}

/// Externally visible monitor state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityStatus {
    pub is_running: bool,
    pub has_mode_switch_timer: bool,
    pub has_midnight_timer: bool,
    pub next_mode_switch: Option<DateTime<Utc>>,
    pub next_midnight: DateTime<Utc>,
    pub exhausted: AxisSet,
    pub last_usage: Option<UsageSnapshot>,
}

#[derive(Default)]
struct MonitorState {
    running: bool,
    exhausted: AxisSet,
    last_usage: Option<UsageSnapshot>,
    has_mode_switch_timer: bool,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

/// Periodic comparison of tracker state against limits
pub struct CapacityMonitor {
    usage: Arc<UsageTracker>,
    events: Arc<EventBus>,
    interval: Duration,
    state: Mutex<MonitorState>,
}

impl CapacityMonitor {
    pub fn new(usage: Arc<UsageTracker>, events: Arc<EventBus>, interval: Duration) -> Self {
        Self {
            usage,
            events,
            interval,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Start the sampling loop. A second start is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.running {
            debug!("capacity monitor already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = self.clone();
        let handle = tokio::spawn(monitor_loop(monitor, shutdown_rx));

        state.running = true;
        state.shutdown = Some(shutdown_tx);
        state.handle = Some(handle);
        info!(interval_secs = self.interval.as_secs(), "capacity monitor started");
    }

    /// Stop the loop and cancel the timers. A second stop is a no-op.
    pub fn stop(&self) {
        let mut state = self.lock();
        if !state.running {
            return;
        }
        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.running = false;
        state.has_mode_switch_timer = false;
        info!("capacity monitor stopped");
    }

    /// One sample pass; emits `capacity:restored` when a previously
    /// exhausted axis is now below threshold.
    pub fn sample(&self, reason: RestoreReason) {
        let current = self.usage.current_usage();
        let now_exhausted = compute_exhausted(&current);

        let (restored, previous) = {
            let mut state = self.lock();
            let restored = state.exhausted.restored_in(now_exhausted);
            let previous = state.last_usage.replace(current.clone());
            state.exhausted = now_exhausted;
            (restored, previous)
        };

        debug!(?now_exhausted, %reason, "capacity sample");

        if restored.any() {
            info!(%reason, ?restored, "capacity restored");
            self.events.emit(Event::CapacityRestored {
                reason,
                timestamp: Utc::now(),
                previous_usage: previous,
                current_usage: current.clone(),
                mode: current.mode,
            });
        }
    }

    /// Operator-triggered re-sample
    pub fn trigger_manual(&self) {
        self.sample(RestoreReason::Manual);
    }

    /// Current monitor state for status aggregation
    pub fn status(&self) -> CapacityStatus {
        let state = self.lock();
        CapacityStatus {
            is_running: state.running,
            has_mode_switch_timer: state.has_mode_switch_timer,
            has_midnight_timer: state.running,
            next_mode_switch: self.usage.next_mode_switch().map(to_utc),
            next_midnight: to_utc(self.usage.next_midnight()),
            exhausted: state.exhausted,
            last_usage: state.last_usage.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn monitor_loop(monitor: Arc<CapacityMonitor>, mut shutdown: watch::Receiver<bool>) {
    let mut sample_timer = tokio::time::interval(monitor.interval);
    sample_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the immediate first tick records the baseline sample
    loop {
        let mode_switch_at = monitor.usage.next_mode_switch();
        monitor.lock().has_mode_switch_timer = mode_switch_at.is_some();
        // placeholder duration when disabled; the branch guard keeps it unpolled
        let until_mode_switch = mode_switch_at.map(until).unwrap_or(Duration::from_secs(3600));
        let until_midnight = until(monitor.usage.next_midnight());

        tokio::select! {
            _ = sample_timer.tick() => {
                monitor.usage.observe_mode();
                monitor.sample(RestoreReason::CapacityDropped);
            }
            _ = tokio::time::sleep(until_mode_switch), if mode_switch_at.is_some() => {
                info!("mode switch alarm fired");
                monitor.usage.observe_mode();
                monitor.sample(RestoreReason::ModeSwitch);
            }
            _ = tokio::time::sleep(until_midnight) => {
                info!("midnight alarm fired, resetting daily counters");
                monitor.usage.reset_daily();
                monitor.sample(RestoreReason::MidnightReset);
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("capacity monitor loop exited");
}

fn until(at: DateTime<Local>) -> Duration {
    (at - Local::now()).to_std().unwrap_or(Duration::ZERO)
}

fn to_utc(at: DateTime<Local>) -> DateTime<Utc> {
    at.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitsConfig, TimeBasedUsageConfig};
    use crate::events::create_event_bus;
    use apex_store::TaskUsage;

    fn setup(limits: LimitsConfig) -> (Arc<CapacityMonitor>, Arc<UsageTracker>, Arc<EventBus>) {
        let events = create_event_bus();
        let usage = Arc::new(UsageTracker::new(
            limits,
            TimeBasedUsageConfig::default(),
            events.clone(),
        ));
        let monitor = Arc::new(CapacityMonitor::new(
            usage.clone(),
            events.clone(),
            Duration::from_millis(50),
        ));
        (monitor, usage, events)
    }

    #[test]
    fn test_axis_set_restored_in() {
        let before = AxisSet {
            concurrency: true,
            daily_budget: true,
            ..Default::default()
        };
        let now = AxisSet {
            daily_budget: true,
            ..Default::default()
        };
        let restored = before.restored_in(now);
        assert!(restored.concurrency);
        assert!(!restored.daily_budget);
        assert!(restored.any());
    }

    #[test]
    fn test_concurrency_restore_cycle() {
        let (monitor, usage, events) = setup(LimitsConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        });
        let mut rx = events.subscribe();

        // free capacity: baseline sample, nothing restored
        monitor.sample(RestoreReason::CapacityDropped);
        assert!(rx.try_recv().is_err());

        // exhaust the concurrency axis
        usage.track_task_start("t-1");
        monitor.sample(RestoreReason::CapacityDropped);
        assert!(rx.try_recv().is_err());

        // free it again: restored event fires
        usage.track_task_completion("t-1", &TaskUsage::default(), true);
        monitor.sample(RestoreReason::CapacityDropped);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type(), "capacity:restored");
        if let Event::CapacityRestored {
            reason,
            previous_usage,
            current_usage,
            ..
        } = event
        {
            assert_eq!(reason, RestoreReason::CapacityDropped);
            assert_eq!(previous_usage.unwrap().active_tasks, 1);
            assert_eq!(current_usage.active_tasks, 0);
        }
    }

    #[test]
    fn test_no_event_when_nothing_was_exhausted() {
        let (monitor, _usage, events) = setup(LimitsConfig::default());
        let mut rx = events.subscribe();

        monitor.sample(RestoreReason::CapacityDropped);
        monitor.sample(RestoreReason::ModeSwitch);
        monitor.sample(RestoreReason::MidnightReset);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_daily_budget_restore_on_reset() {
        let (monitor, usage, events) = setup(LimitsConfig {
            max_concurrent_tasks: 10,
            max_cost_per_task: Some(1.0),
            daily_budget: Some(2.0),
            ..Default::default()
        });
        let mut rx = events.subscribe();

        usage.track_task_start("t-1");
        usage.track_task_completion(
            "t-1",
            &TaskUsage {
                estimated_cost: 1.8,
                ..Default::default()
            },
            true,
        );
        monitor.sample(RestoreReason::CapacityDropped);
        assert!(rx.try_recv().is_err());

        usage.reset_daily();
        monitor.sample(RestoreReason::MidnightReset);
        let event = rx.try_recv().unwrap();
        if let Event::CapacityRestored { reason, .. } = event {
            assert_eq!(reason, RestoreReason::MidnightReset);
        } else {
            panic!("expected capacity:restored");
        }
    }

    #[test]
    fn test_per_task_token_axis_follows_last_task() {
        let (monitor, usage, events) = setup(LimitsConfig {
            max_concurrent_tasks: 10,
            max_tokens_per_task: Some(1000),
            ..Default::default()
        });
        let mut rx = events.subscribe();

        usage.track_task_start("big");
        usage.track_task_completion(
            "big",
            &TaskUsage {
                total_tokens: 5000,
                ..Default::default()
            },
            true,
        );
        monitor.sample(RestoreReason::CapacityDropped);
        assert!(rx.try_recv().is_err());

        usage.track_task_start("small");
        usage.track_task_completion(
            "small",
            &TaskUsage {
                total_tokens: 10,
                ..Default::default()
            },
            true,
        );
        monitor.sample(RestoreReason::CapacityDropped);
        assert_eq!(rx.try_recv().unwrap().event_type(), "capacity:restored");
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (monitor, _usage, _events) = setup(LimitsConfig::default());

        monitor.start();
        assert!(monitor.status().is_running);
        monitor.start();
        assert!(monitor.status().is_running);

        monitor.stop();
        assert!(!monitor.status().is_running);
        monitor.stop();
        assert!(!monitor.status().is_running);
    }

    #[tokio::test]
    async fn test_loop_samples_on_interval() {
        let (monitor, usage, events) = setup(LimitsConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        });
        let mut rx = events.subscribe();

        usage.track_task_start("t-1");
        monitor.start();
        tokio::time::sleep(Duration::from_millis(120)).await;

        usage.track_task_completion("t-1", &TaskUsage::default(), true);
        tokio::time::sleep(Duration::from_millis(120)).await;
        monitor.stop();

        let mut restored = 0;
        while let Ok(event) = rx.try_recv() {
            if event.event_type() == "capacity:restored" {
                restored += 1;
            }
        }
        assert_eq!(restored, 1);
    }
}
