//! Usage modes and threshold resolution
//!
//! The current mode is a pure function of local wall-clock time and the
//! time-based-usage config; mode-specific thresholds override the global
//! limits when present.

use chrono::{DateTime, Datelike, Duration, Local, Timelike};
use serde::{Deserialize, Serialize};

use crate::config::{LimitsConfig, TimeBasedUsageConfig};

/// Resource regime selecting a threshold profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UsageMode {
    #[default]
    Day,
    Night,
    Weekend,
}

impl std::fmt::Display for UsageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Night => write!(f, "night"),
            Self::Weekend => write!(f, "weekend"),
        }
    }
}

/// Limits in force after applying the current mode's overrides
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveLimits {
    pub max_tokens_per_task: Option<u64>,
    pub max_cost_per_task: Option<f64>,
    pub max_concurrent_tasks: usize,
    pub daily_budget: Option<f64>,
}

/// Mode for a given local time. Weekends win; otherwise the configured
/// hour lists decide, with "day" as the unmatched-hour fallback.
pub fn mode_at(config: &TimeBasedUsageConfig, now: DateTime<Local>) -> UsageMode {
    if !config.enabled {
        return UsageMode::Day;
    }
    if matches!(now.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
        return UsageMode::Weekend;
    }
    let hour = now.hour();
    if config.day_mode_hours.contains(&hour) {
        UsageMode::Day
    } else if config.night_mode_hours.contains(&hour) {
        UsageMode::Night
    } else {
        UsageMode::Day
    }
}

/// Merge the global limits with the mode's overrides. Weekend borrows the
/// night profile when one is configured.
pub fn effective_limits(
    limits: &LimitsConfig,
    config: &TimeBasedUsageConfig,
    mode: UsageMode,
) -> EffectiveLimits {
    let overrides = match mode {
        UsageMode::Day => config.day_mode_thresholds.as_ref(),
        UsageMode::Night | UsageMode::Weekend => config.night_mode_thresholds.as_ref(),
    };

    let mut effective = EffectiveLimits {
        max_tokens_per_task: limits.max_tokens_per_task,
        max_cost_per_task: limits.max_cost_per_task,
        max_concurrent_tasks: limits.max_concurrent_tasks,
        daily_budget: limits.daily_budget,
    };

    if let Some(overrides) = overrides {
        if overrides.max_tokens_per_task.is_some() {
            effective.max_tokens_per_task = overrides.max_tokens_per_task;
        }
        if overrides.max_cost_per_task.is_some() {
            effective.max_cost_per_task = overrides.max_cost_per_task;
        }
        if let Some(concurrent) = overrides.max_concurrent_tasks {
            effective.max_concurrent_tasks = concurrent;
        }
    }

    effective
}

/// Next local time at which the mode changes, scanning forward one week
/// of hour boundaries. None when mode switching is disabled or the mode
/// never changes.
pub fn next_mode_switch(
    config: &TimeBasedUsageConfig,
    now: DateTime<Local>,
) -> Option<DateTime<Local>> {
    if !config.enabled {
        return None;
    }
    let current = mode_at(config, now);
    let mut boundary = truncate_to_hour(now) + Duration::hours(1);
    for _ in 0..(24 * 7) {
        if mode_at(config, boundary) != current {
            return Some(boundary);
        }
        boundary += Duration::hours(1);
    }
    None
}

/// Next local midnight (the daily-budget reset point)
pub fn next_midnight(now: DateTime<Local>) -> DateTime<Local> {
    let tomorrow = (now + Duration::days(1)).date_naive();
    tomorrow
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .unwrap_or(now + Duration::days(1))
}

fn truncate_to_hour(now: DateTime<Local>) -> DateTime<Local> {
    now - Duration::minutes(now.minute() as i64)
        - Duration::seconds(now.second() as i64)
        - Duration::nanoseconds(now.nanosecond() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeThresholds;
    use chrono::TimeZone;

    fn config() -> TimeBasedUsageConfig {
        TimeBasedUsageConfig {
            enabled: true,
            day_mode_hours: (8..20).collect(),
            night_mode_hours: (0..8).chain(20..24).collect(),
            day_mode_thresholds: Some(ModeThresholds {
                max_concurrent_tasks: Some(2),
                ..Default::default()
            }),
            night_mode_thresholds: Some(ModeThresholds {
                max_concurrent_tasks: Some(8),
                max_cost_per_task: Some(5.0),
                ..Default::default()
            }),
        }
    }

    // 2025-06-02 is a Monday
    fn monday_at(hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 2, hour, 30, 0).unwrap()
    }

    #[test]
    fn test_mode_disabled_is_day() {
        let config = TimeBasedUsageConfig::default();
        assert_eq!(mode_at(&config, monday_at(3)), UsageMode::Day);
    }

    #[test]
    fn test_mode_day_night_hours() {
        let config = config();
        assert_eq!(mode_at(&config, monday_at(10)), UsageMode::Day);
        assert_eq!(mode_at(&config, monday_at(22)), UsageMode::Night);
        assert_eq!(mode_at(&config, monday_at(3)), UsageMode::Night);
    }

    #[test]
    fn test_mode_weekend_wins() {
        let config = config();
        // 2025-06-07 is a Saturday
        let saturday = Local.with_ymd_and_hms(2025, 6, 7, 10, 0, 0).unwrap();
        assert_eq!(mode_at(&config, saturday), UsageMode::Weekend);
    }

    #[test]
    fn test_unlisted_hour_falls_back_to_day() {
        let mut config = config();
        config.night_mode_hours.retain(|&h| h != 22);
        assert_eq!(mode_at(&config, monday_at(22)), UsageMode::Day);
    }

    #[test]
    fn test_effective_limits_overrides() {
        let config = config();
        let limits = LimitsConfig {
            max_concurrent_tasks: 4,
            max_cost_per_task: Some(1.0),
            daily_budget: Some(100.0),
            ..Default::default()
        };

        let day = effective_limits(&limits, &config, UsageMode::Day);
        assert_eq!(day.max_concurrent_tasks, 2);
        assert_eq!(day.max_cost_per_task, Some(1.0));

        let night = effective_limits(&limits, &config, UsageMode::Night);
        assert_eq!(night.max_concurrent_tasks, 8);
        assert_eq!(night.max_cost_per_task, Some(5.0));
        assert_eq!(night.daily_budget, Some(100.0));

        // weekend borrows the night profile
        let weekend = effective_limits(&limits, &config, UsageMode::Weekend);
        assert_eq!(weekend.max_concurrent_tasks, 8);
    }

    #[test]
    fn test_next_mode_switch_finds_boundary() {
        let config = config();
        let now = monday_at(18);
        let switch = next_mode_switch(&config, now).unwrap();
        assert_eq!(switch.hour(), 20);
        assert_eq!(mode_at(&config, switch), UsageMode::Night);
    }

    #[test]
    fn test_next_mode_switch_none_when_disabled() {
        let config = TimeBasedUsageConfig::default();
        assert!(next_mode_switch(&config, monday_at(12)).is_none());
    }

    #[test]
    fn test_next_midnight() {
        let now = monday_at(18);
        let midnight = next_midnight(now);
        assert_eq!(midnight.hour(), 0);
        assert_eq!(midnight.date_naive(), now.date_naive() + Duration::days(1));
    }
}
