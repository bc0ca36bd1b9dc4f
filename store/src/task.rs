//! Task entity and its classification enums
//!
//! Task is the central durable record. Mutations go through the store;
//! in-memory values are read-only snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::ConversationMessage;
use crate::id::generate_id;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be scheduled
    #[default]
    Pending,
    /// Dispatched to the executor
    InProgress,
    /// Suspended with a structured reason
    Paused,
    /// Finished successfully
    Completed,
    /// Finished with an unrecoverable error
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never leave via the scheduler
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States that satisfy a dependency edge
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "in-progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Priority for scheduler ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Canonical sort rank: lower sorts first
    pub fn rank(self) -> u8 {
        match self {
            Self::Urgent => 1,
            Self::High => 2,
            Self::Normal => 3,
            Self::Low => 4,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Urgent => write!(f, "urgent"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Effort estimate, the secondary sort key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Xs,
    Small,
    #[default]
    Medium,
    Large,
    Xl,
}

impl Effort {
    /// Canonical sort rank: lower sorts first
    pub fn rank(self) -> u8 {
        match self {
            Self::Xs => 1,
            Self::Small => 2,
            Self::Medium => 3,
            Self::Large => 4,
            Self::Xl => 5,
        }
    }
}

impl std::fmt::Display for Effort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Xs => write!(f, "xs"),
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
            Self::Xl => write!(f, "xl"),
        }
    }
}

impl std::str::FromStr for Effort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xs" => Ok(Self::Xs),
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "xl" => Ok(Self::Xl),
            _ => Err(format!("Unknown effort: {}", s)),
        }
    }
}

/// How much human oversight the task requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Autonomy {
    Manual,
    ReviewBeforeMerge,
    #[default]
    Autonomous,
}

impl std::fmt::Display for Autonomy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::ReviewBeforeMerge => write!(f, "review_before_merge"),
            Self::Autonomous => write!(f, "autonomous"),
        }
    }
}

impl std::str::FromStr for Autonomy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "review_before_merge" | "review-before-merge" => Ok(Self::ReviewBeforeMerge),
            "autonomous" => Ok(Self::Autonomous),
            _ => Err(format!("Unknown autonomy: {}", s)),
        }
    }
}

/// Why a task was paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    UsageLimit,
    Budget,
    Capacity,
    ContainerFailure,
    SessionLimit,
    Manual,
    Other,
}

impl PauseReason {
    /// Reasons the controller resumes without operator intervention
    pub fn auto_resumable(self) -> bool {
        matches!(
            self,
            Self::UsageLimit | Self::Budget | Self::Capacity | Self::ContainerFailure
        )
    }
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UsageLimit => write!(f, "usage_limit"),
            Self::Budget => write!(f, "budget"),
            Self::Capacity => write!(f, "capacity"),
            Self::ContainerFailure => write!(f, "container_failure"),
            Self::SessionLimit => write!(f, "session_limit"),
            Self::Manual => write!(f, "manual"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for PauseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "usage_limit" => Ok(Self::UsageLimit),
            "budget" => Ok(Self::Budget),
            "capacity" => Ok(Self::Capacity),
            "container_failure" => Ok(Self::ContainerFailure),
            "session_limit" => Ok(Self::SessionLimit),
            "manual" => Ok(Self::Manual),
            "other" => Ok(Self::Other),
            _ => Err(format!("Unknown pause reason: {}", s)),
        }
    }
}

/// Cumulative resource consumption for a task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

impl TaskUsage {
    /// Accumulate another usage sample into this one
    pub fn add(&mut self, other: &TaskUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.estimated_cost += other.estimated_cost;
    }
}

/// Where a resumed task should pick up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePoint {
    /// Stage name to re-enter
    pub stage: String,
    /// Step within the stage
    pub step_index: u32,
    /// Free-form executor metadata
    #[serde(default)]
    pub metadata: Value,
}

/// Session hints derived from the latest checkpoint, embedded on the task row.
/// Checkpoints remain the authoritative resume source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    /// When the latest checkpoint was written
    pub last_checkpoint: Option<DateTime<Utc>>,
    /// Compressed summary of the conversation so far
    pub context_summary: Option<String>,
    /// Bounded tail of the conversation
    #[serde(default)]
    pub recent_history: Vec<ConversationMessage>,
    /// Opaque stage-state snapshot
    pub stage_state: Option<Value>,
    /// Where to re-enter the workflow
    pub resume_point: Option<ResumePoint>,
}

/// Log severity for task log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Append-only log line attached to a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Row id (0 until persisted)
    #[serde(default)]
    pub id: i64,
    pub task_id: String,
    pub level: LogLevel,
    pub stage: Option<String>,
    pub agent: Option<String>,
    pub message: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Append-only artifact attached to a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Row id (0 until persisted)
    #[serde(default)]
    pub id: i64,
    pub task_id: String,
    pub name: String,
    /// Artifact type, e.g. "diff", "report"
    pub kind: String,
    pub path: Option<String>,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The central durable record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable opaque identifier
    pub id: String,

    /// Project directory this task belongs to
    pub project_path: String,

    /// Workflow name (resolved against the workflow registry)
    pub workflow: String,

    /// Human-readable title
    pub title: String,

    /// Parent task ID, if this is a subtask
    pub parent_id: Option<String>,

    /// Ordered subtask IDs
    pub subtask_ids: Vec<String>,

    /// Task IDs this task must wait for
    pub depends_on: Vec<String>,

    /// Subset of depends_on whose status is not yet completed/cancelled.
    /// Computed on load, never written.
    #[serde(default)]
    pub blocked_by: Vec<String>,

    pub priority: Priority,
    pub effort: Effort,
    pub autonomy: Autonomy,
    pub status: TaskStatus,

    /// Current stage name
    pub stage: Option<String>,
    /// Current stage index within the workflow
    pub stage_index: u32,

    /// Execution retries consumed
    pub retry_count: u32,
    /// Execution retry cap
    pub max_retries: u32,

    /// Post-pause resumes consumed
    pub resume_attempts: u32,
    /// Post-pause resume cap
    pub max_resume_attempts: u32,

    pub usage: TaskUsage,

    /// Workspace descriptor (path or handle)
    pub workspace: Option<String>,
    /// Derived session hints
    pub session: Option<SessionData>,
    /// When the latest checkpoint was written
    pub last_checkpoint_at: Option<DateTime<Utc>>,

    pub pause_reason: Option<PauseReason>,
    pub paused_at: Option<DateTime<Utc>>,
    /// Do not auto-resume before this time
    pub resume_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Eager-loaded log entries
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Eager-loaded artifacts
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl Task {
    /// Default cap on post-pause resumes
    pub const DEFAULT_MAX_RESUME_ATTEMPTS: u32 = 3;
    /// Default cap on execution retries
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Create a new task with a generated ID
    pub fn new(
        project_path: impl Into<String>,
        workflow: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: generate_id("task", &title),
            project_path: project_path.into(),
            workflow: workflow.into(),
            title,
            parent_id: None,
            subtask_ids: Vec::new(),
            depends_on: Vec::new(),
            blocked_by: Vec::new(),
            priority: Priority::Normal,
            effort: Effort::Medium,
            autonomy: Autonomy::Autonomous,
            status: TaskStatus::Pending,
            stage: None,
            stage_index: 0,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            resume_attempts: 0,
            max_resume_attempts: Self::DEFAULT_MAX_RESUME_ATTEMPTS,
            usage: TaskUsage::default(),
            workspace: None,
            session: None,
            last_checkpoint_at: None,
            pause_reason: None,
            paused_at: None,
            resume_after: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            logs: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Create a task with a specific ID (for testing or import)
    pub fn with_id(
        id: impl Into<String>,
        project_path: impl Into<String>,
        workflow: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let mut task = Self::new(project_path, workflow, title);
        task.id = id.into();
        task
    }

    /// Builder: set priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set effort
    pub fn with_effort(mut self, effort: Effort) -> Self {
        self.effort = effort;
        self
    }

    /// Builder: set autonomy
    pub fn with_autonomy(mut self, autonomy: Autonomy) -> Self {
        self.autonomy = autonomy;
        self
    }

    /// Builder: set the parent task
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    /// Builder: add a dependency edge
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Whether the task is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the pause reason qualifies for automatic resume
    pub fn is_auto_resumable(&self) -> bool {
        self.status == TaskStatus::Paused
            && self.pause_reason.is_some_and(|r| r.auto_resumable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new("/proj", "default", "Fix the parser");
        assert!(task.id.contains("-task-"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.effort, Effort::Medium);
        assert_eq!(task.max_resume_attempts, 3);
        assert!(task.depends_on.is_empty());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn test_task_builders() {
        let task = Task::new("/proj", "default", "t")
            .with_priority(Priority::Urgent)
            .with_effort(Effort::Xl)
            .with_parent("parent-1")
            .with_dependency("dep-1");
        assert_eq!(task.priority, Priority::Urgent);
        assert_eq!(task.effort, Effort::Xl);
        assert_eq!(task.parent_id, Some("parent-1".to_string()));
        assert_eq!(task.depends_on, vec!["dep-1".to_string()]);
    }

    #[test]
    fn test_status_terminal_and_dependency_satisfaction() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());

        assert!(TaskStatus::Completed.satisfies_dependency());
        assert!(TaskStatus::Cancelled.satisfies_dependency());
        assert!(!TaskStatus::Failed.satisfies_dependency());
        assert!(!TaskStatus::Pending.satisfies_dependency());
    }

    #[test]
    fn test_priority_effort_ranks() {
        assert_eq!(Priority::Urgent.rank(), 1);
        assert_eq!(Priority::Low.rank(), 4);
        assert_eq!(Effort::Xs.rank(), 1);
        assert_eq!(Effort::Xl.rank(), 5);
    }

    #[test]
    fn test_pause_reason_auto_resumable() {
        assert!(PauseReason::UsageLimit.auto_resumable());
        assert!(PauseReason::Budget.auto_resumable());
        assert!(PauseReason::Capacity.auto_resumable());
        assert!(PauseReason::ContainerFailure.auto_resumable());
        assert!(!PauseReason::Manual.auto_resumable());
        assert!(!PauseReason::SessionLimit.auto_resumable());
        assert!(!PauseReason::Other.auto_resumable());
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_usage_add() {
        let mut usage = TaskUsage {
            input_tokens: 100,
            output_tokens: 50,
            total_tokens: 150,
            estimated_cost: 0.01,
        };
        usage.add(&TaskUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            estimated_cost: 0.002,
        });
        assert_eq!(usage.input_tokens, 110);
        assert_eq!(usage.total_tokens, 165);
        assert!((usage.estimated_cost - 0.012).abs() < f64::EPSILON);
    }

    #[test]
    fn test_task_serde_round_trip() {
        let mut task = Task::new("/proj", "default", "serde test").with_dependency("dep-9");
        task.session = Some(SessionData {
            context_summary: Some("summary".to_string()),
            resume_point: Some(ResumePoint {
                stage: "testing".to_string(),
                step_index: 2,
                metadata: serde_json::json!({"cursor": 7}),
            }),
            ..Default::default()
        });

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.depends_on, task.depends_on);
        assert_eq!(back.session, task.session);
    }
}
