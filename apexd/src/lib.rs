//! apexd - single-host orchestration daemon
//!
//! Drives a persistent queue of long-lived tasks through multi-stage
//! workflows while respecting per-interval capacity limits, and survives
//! process restarts without losing work.
//!
//! # Core pieces
//!
//! - [`state`] - actor-owned access to the durable store
//! - [`runner`] - the poll loop dispatching ready tasks to an executor
//! - [`usage`] - token/cost/concurrency accounting and mode switching
//! - [`capacity`] - threshold sampling and `capacity:restored` emission
//! - [`resume`] - paused-to-pending transitions driven by capacity
//! - [`recovery`] - orphan detection and healing at startup
//! - [`session`] - checkpoints and session restore
//! - [`supervisor`] - component lifecycle and status aggregation
//! - [`watchdog`] - restart policy over fatal errors
//!
//! Durable entities live in the `apex-store` crate.

pub mod capacity;
pub mod cli;
pub mod config;
pub mod events;
pub mod health;
pub mod process;
pub mod recovery;
pub mod resume;
pub mod runner;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod usage;
pub mod watchdog;
pub mod workflow;

// Re-export commonly used types
pub use capacity::{AxisSet, CapacityMonitor, CapacityStatus};
pub use config::{Config, RecoveryPolicy};
pub use events::{Event, EventBus, RestoreReason};
pub use health::{HealthMonitor, HealthReport};
pub use recovery::{RecoveryReport, recover_orphans};
pub use resume::{PauseResumeController, ResumeOptions};
pub use runner::{
    ExecutionContext, ExecutionOutcome, ExecutionRequest, Runner, RunnerConfig, RunnerMetrics,
    TaskExecutor, WorkflowStageExecutor,
};
pub use session::{ResumeContext, SessionStore};
pub use state::{StateError, StateManager};
pub use supervisor::{DaemonStatus, Supervisor, SupervisorState};
pub use usage::{UsageMode, UsageSnapshot, UsageTracker};
pub use watchdog::Watchdog;
pub use workflow::{Workflow, WorkflowRegistry};
