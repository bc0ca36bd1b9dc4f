//! Usage tracking: accumulator, modes, thresholds

mod mode;
mod tracker;

pub use mode::{EffectiveLimits, UsageMode, effective_limits, mode_at, next_midnight, next_mode_switch};
pub use tracker::{
    Admission, REASON_DAILY_BUDGET, REASON_MAX_CONCURRENT, UsageSnapshot, UsageTracker,
};
