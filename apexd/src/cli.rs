//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// apexd - autonomous task orchestration daemon
#[derive(Parser)]
#[command(
    name = "apexd",
    about = "Autonomous task orchestration daemon",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    /// Path to config file (defaults to <project>/.apex/config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Project directory (defaults to the current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Start the daemon in the background
    Start {
        /// Don't fork; run in the foreground (for service managers)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon liveness and store counts
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Internal: run as the daemon process (used by `start`)
    #[command(hide = true)]
    RunDaemon,

    /// Inspect and manage tasks
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
}

/// Task management subcommands
#[derive(Subcommand)]
pub enum TasksCommand {
    /// List tasks, optionally filtered by status
    List {
        /// Filter: pending, in_progress, paused, completed, failed, cancelled
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one task in full
    Show {
        /// Task id (or unique prefix)
        id: String,
    },

    /// Queue a new task
    Add {
        /// Task title
        title: String,

        /// Workflow name
        #[arg(short, long, default_value = "default")]
        workflow: String,

        /// Priority: urgent, high, normal, low
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Effort: xs, small, medium, large, xl
        #[arg(long, default_value = "medium")]
        effort: String,

        /// Task ids this task must wait for
        #[arg(long = "after")]
        depends_on: Vec<String>,

        /// Parent task id
        #[arg(long)]
        parent: Option<String>,
    },

    /// Cancel a task
    Cancel {
        /// Task id
        id: String,
    },
}
