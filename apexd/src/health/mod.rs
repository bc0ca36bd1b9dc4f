//! Health monitor
//!
//! Accumulates liveness-probe results, restart records, and periodic
//! memory/task-count samples; exposes a health report for the status
//! surface.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Bound on retained restart records
const MAX_RESTART_HISTORY: usize = 20;
/// Bound on retained samples
const MAX_SAMPLES: usize = 60;

/// One recorded restart
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRecord {
    pub reason: String,
    pub exit_code: Option<i32>,
    pub by_watchdog: bool,
    pub at: DateTime<Utc>,
}

/// One liveness sample
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub memory_kb: Option<u64>,
    pub task_count: usize,
}

/// Aggregated health view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub checks_passed: u64,
    pub checks_failed: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_check_success: Option<bool>,
    pub recent_restarts: Vec<RestartRecord>,
    pub last_sample: Option<HealthSample>,
}

#[derive(Default)]
struct Inner {
    checks_passed: u64,
    checks_failed: u64,
    last_check: Option<DateTime<Utc>>,
    last_check_success: Option<bool>,
    restarts: Vec<RestartRecord>,
    samples: Vec<HealthSample>,
}

/// Accumulates health-check results and restart records
#[derive(Default)]
pub struct HealthMonitor {
    inner: Mutex<Inner>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one liveness probe
    pub fn perform_health_check(&self, success: bool) {
        let mut inner = self.lock();
        if success {
            inner.checks_passed += 1;
        } else {
            inner.checks_failed += 1;
            warn!("health check failed");
        }
        inner.last_check = Some(Utc::now());
        inner.last_check_success = Some(success);
        debug!(success, "health check recorded");
    }

    /// Record a daemon restart
    pub fn record_restart(&self, reason: &str, exit_code: Option<i32>, by_watchdog: bool) {
        let mut inner = self.lock();
        inner.restarts.push(RestartRecord {
            reason: reason.to_string(),
            exit_code,
            by_watchdog,
            at: Utc::now(),
        });
        let excess = inner.restarts.len().saturating_sub(MAX_RESTART_HISTORY);
        if excess > 0 {
            inner.restarts.drain(..excess);
        }
    }

    /// Record a memory/task-count sample
    pub fn record_sample(&self, task_count: usize) {
        let mut inner = self.lock();
        inner.samples.push(HealthSample {
            at: Utc::now(),
            memory_kb: resident_memory_kb(),
            task_count,
        });
        let excess = inner.samples.len().saturating_sub(MAX_SAMPLES);
        if excess > 0 {
            inner.samples.drain(..excess);
        }
    }

    /// Current aggregated report. Healthy means the last probe (if any)
    /// passed.
    pub fn report(&self) -> HealthReport {
        let inner = self.lock();
        HealthReport {
            healthy: inner.last_check_success != Some(false),
            checks_passed: inner.checks_passed,
            checks_failed: inner.checks_failed,
            last_check: inner.last_check,
            last_check_success: inner.last_check_success,
            recent_restarts: inner.restarts.clone(),
            last_sample: inner.samples.last().cloned(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Resident set size of this process, when the platform exposes it
fn resident_memory_kb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * 4)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_monitor_is_healthy() {
        let monitor = HealthMonitor::new();
        let report = monitor.report();
        assert!(report.healthy);
        assert_eq!(report.checks_passed, 0);
        assert!(report.last_check.is_none());
    }

    #[test]
    fn test_check_counters_and_health_flag() {
        let monitor = HealthMonitor::new();
        monitor.perform_health_check(true);
        monitor.perform_health_check(true);
        monitor.perform_health_check(false);

        let report = monitor.report();
        assert_eq!(report.checks_passed, 2);
        assert_eq!(report.checks_failed, 1);
        assert!(!report.healthy);
        assert_eq!(report.last_check_success, Some(false));

        monitor.perform_health_check(true);
        assert!(monitor.report().healthy);
    }

    #[test]
    fn test_restart_history_bounded() {
        let monitor = HealthMonitor::new();
        for i in 0..30 {
            monitor.record_restart(&format!("r{}", i), Some(1), i % 2 == 0);
        }
        let report = monitor.report();
        assert_eq!(report.recent_restarts.len(), 20);
        assert_eq!(report.recent_restarts.last().unwrap().reason, "r29");
    }

    #[test]
    fn test_samples_keep_latest() {
        let monitor = HealthMonitor::new();
        for i in 0..70 {
            monitor.record_sample(i);
        }
        let report = monitor.report();
        assert_eq!(report.last_sample.as_ref().unwrap().task_count, 69);
    }
}
