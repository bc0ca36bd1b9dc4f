//! IdleTask entity
//!
//! Candidate work generated during idle periods. Distinct from Task; may
//! be promoted into a real task, recorded via the forward pointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::generate_id;
use crate::task::{Effort, Priority};

/// Candidate work item awaiting promotion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleTask {
    pub id: String,
    /// Candidate type, e.g. "refactor", "test-gap", "doc"
    pub kind: String,
    pub title: String,
    /// Why this work is worth doing
    pub rationale: String,
    pub priority: Priority,
    pub estimated_effort: Effort,
    pub suggested_workflow: Option<String>,
    /// Whether the candidate was promoted into a task
    pub implemented: bool,
    /// Task id this candidate was promoted to
    pub promoted_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdleTask {
    /// Create a new idle candidate with a generated ID
    pub fn new(
        kind: impl Into<String>,
        title: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: generate_id("idle", &title),
            kind: kind.into(),
            title,
            rationale: rationale.into(),
            priority: Priority::Low,
            estimated_effort: Effort::Medium,
            suggested_workflow: None,
            implemented: false,
            promoted_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set estimated effort
    pub fn with_effort(mut self, effort: Effort) -> Self {
        self.estimated_effort = effort;
        self
    }

    /// Builder: suggest a workflow for the promoted task
    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.suggested_workflow = Some(workflow.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_task_defaults() {
        let idle = IdleTask::new("refactor", "Split the runner module", "file too large");
        assert!(idle.id.contains("-idle-"));
        assert_eq!(idle.priority, Priority::Low);
        assert!(!idle.implemented);
        assert!(idle.promoted_task_id.is_none());
    }
}
