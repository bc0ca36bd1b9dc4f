//! Gate entity
//!
//! An approval record attached to a task, unique per (task, name). Gates
//! sit off the scheduler's critical path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Gate approval state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for GateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown gate status: {}", s)),
        }
    }
}

/// Approval attached to a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    pub task_id: String,
    pub name: String,
    pub status: GateStatus,
    /// When the gate was requested
    pub required_at: DateTime<Utc>,
    /// When it was approved or rejected
    pub responded_at: Option<DateTime<Utc>>,
    pub approver: Option<String>,
    pub comment: Option<String>,
}

impl Gate {
    /// Create a pending gate
    pub fn new(task_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            status: GateStatus::Pending,
            required_at: Utc::now(),
            responded_at: None,
            approver: None,
            comment: None,
        }
    }

    /// Whether the gate still blocks
    pub fn is_open(&self) -> bool {
        self.status == GateStatus::Pending
    }
}
