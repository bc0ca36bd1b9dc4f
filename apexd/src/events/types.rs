//! Event vocabulary
//!
//! Event names are part of the external interface; payloads are
//! structurally stable and additive fields are allowed.

use apex_store::{SessionData, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::usage::{UsageMode, UsageSnapshot};

/// Why capacity was restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreReason {
    /// A sampled axis dropped below its threshold
    CapacityDropped,
    /// A mode switch raised a threshold
    ModeSwitch,
    /// The daily budget reset at midnight
    MidnightReset,
    /// Operator request
    Manual,
}

impl std::fmt::Display for RestoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapacityDropped => write!(f, "capacity_dropped"),
            Self::ModeSwitch => write!(f, "mode_switch"),
            Self::MidnightReset => write!(f, "midnight_reset"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Everything the daemon announces on its bus
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    DaemonStarted {
        timestamp: DateTime<Utc>,
    },
    DaemonStopped {
        timestamp: DateTime<Utc>,
    },
    DaemonError {
        message: String,
        component: Option<String>,
        timestamp: DateTime<Utc>,
    },
    TaskCreated {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskStageChanged {
        task_id: String,
        stage: String,
        stage_index: u32,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        task_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    TaskSessionResumed {
        task_id: String,
        resume_reason: String,
        context_summary: Option<String>,
        previous_status: TaskStatus,
        session_data: Option<SessionData>,
        timestamp: DateTime<Utc>,
    },
    TasksAutoResumed {
        reason: String,
        total_tasks: usize,
        resumed_count: usize,
        errors: Vec<String>,
        timestamp: DateTime<Utc>,
        resume_reason: Option<String>,
        context_summary: Option<String>,
    },
    CapacityRestored {
        reason: RestoreReason,
        timestamp: DateTime<Utc>,
        previous_usage: Option<UsageSnapshot>,
        current_usage: UsageSnapshot,
        mode: UsageMode,
    },
    OrphanDetected {
        task_ids: Vec<String>,
        detected_at: DateTime<Utc>,
        reason: String,
        staleness_threshold_ms: u64,
    },
    OrphanRecovered {
        task_id: String,
        previous_status: TaskStatus,
        new_status: TaskStatus,
        action: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    UsageModeChanged {
        mode: UsageMode,
        timestamp: DateTime<Utc>,
    },
    SessionRecovered {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// The stable external name of this event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DaemonStarted { .. } => "daemon:started",
            Self::DaemonStopped { .. } => "daemon:stopped",
            Self::DaemonError { .. } => "daemon:error",
            Self::TaskCreated { .. } => "task:created",
            Self::TaskStageChanged { .. } => "task:stage-changed",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskSessionResumed { .. } => "task:session-resumed",
            Self::TasksAutoResumed { .. } => "tasks:auto-resumed",
            Self::CapacityRestored { .. } => "capacity:restored",
            Self::OrphanDetected { .. } => "orphan:detected",
            Self::OrphanRecovered { .. } => "orphan:recovered",
            Self::UsageModeChanged { .. } => "usage:mode-changed",
            Self::SessionRecovered { .. } => "session:recovered",
        }
    }

    /// Task this event concerns, when it concerns exactly one
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::TaskStageChanged { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskSessionResumed { task_id, .. }
            | Self::OrphanRecovered { task_id, .. }
            | Self::SessionRecovered { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// When the event was emitted
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::DaemonStarted { timestamp }
            | Self::DaemonStopped { timestamp }
            | Self::DaemonError { timestamp, .. }
            | Self::TaskCreated { timestamp, .. }
            | Self::TaskStageChanged { timestamp, .. }
            | Self::TaskCompleted { timestamp, .. }
            | Self::TaskFailed { timestamp, .. }
            | Self::TaskSessionResumed { timestamp, .. }
            | Self::TasksAutoResumed { timestamp, .. }
            | Self::CapacityRestored { timestamp, .. }
            | Self::OrphanRecovered { timestamp, .. }
            | Self::UsageModeChanged { timestamp, .. }
            | Self::SessionRecovered { timestamp, .. } => *timestamp,
            Self::OrphanDetected { detected_at, .. } => *detected_at,
        }
    }
}
