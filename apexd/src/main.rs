//! apexd - CLI entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::info;

use apexd::cli::{Cli, Command, TasksCommand};
use apexd::config::Config;
use apexd::process::{InstanceLock, ProcessManager};
use apexd::runner::WorkflowStageExecutor;
use apexd::state::StateManager;
use apexd::supervisor::Supervisor;
use apex_store::{Effort, Priority, Task, TaskFilter, TaskStatus};

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let project_dir = match &cli.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let config = Config::load(&project_dir, cli.config.as_ref());

    match cli.command {
        Command::Start { foreground } => {
            if foreground {
                run_daemon(project_dir, config).await
            } else {
                let manager = ProcessManager::new(&project_dir);
                let pid = manager.start()?;
                println!("{} daemon started (pid {})", "ok:".green().bold(), pid);
                Ok(())
            }
        }
        Command::RunDaemon => run_daemon(project_dir, config).await,
        Command::Stop => {
            let manager = ProcessManager::new(&project_dir);
            manager.stop()?;
            println!("{} daemon stopped", "ok:".green().bold());
            Ok(())
        }
        Command::Status { json } => show_status(&project_dir, json).await,
        Command::Tasks { command } => run_tasks_command(&project_dir, command).await,
    }
}

async fn run_daemon(project_dir: PathBuf, config: Config) -> Result<()> {
    let _lock = InstanceLock::acquire(&project_dir)?;
    let manager = ProcessManager::new(&project_dir);
    manager.register_self()?;

    info!(project = %project_dir.display(), "running daemon in foreground");
    let supervisor = Supervisor::new(project_dir, config, Arc::new(WorkflowStageExecutor));
    let result = supervisor.run_until_shutdown().await;

    manager.deregister_self()?;
    result
}

async fn show_status(project_dir: &PathBuf, json: bool) -> Result<()> {
    let manager = ProcessManager::new(project_dir);
    let pid = manager.running_pid();

    let state = StateManager::spawn(Config::state_dir(project_dir), None)?;
    let counts = state.count_tasks_by_status().await.unwrap_or_default();
    state.shutdown().await.ok();

    if json {
        let status = serde_json::json!({
            "running": pid.is_some(),
            "pid": pid,
            "project": project_dir.display().to_string(),
            "tasks": counts
                .iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect::<std::collections::HashMap<_, _>>(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match pid {
        Some(pid) => println!("daemon: {} (pid {})", "running".green().bold(), pid),
        None => println!("daemon: {}", "stopped".red().bold()),
    }
    println!("project: {}", project_dir.display());
    if counts.is_empty() {
        println!("tasks: none");
    } else {
        for (status, count) in counts {
            println!("  {:<12} {}", status.to_string(), count);
        }
    }
    Ok(())
}

async fn run_tasks_command(project_dir: &PathBuf, command: TasksCommand) -> Result<()> {
    let state = StateManager::spawn(Config::state_dir(project_dir), None)?;

    let result = match command {
        TasksCommand::List { status } => {
            let status = status
                .map(|s| s.parse::<TaskStatus>().map_err(|e| eyre::eyre!(e)))
                .transpose()?;
            let tasks = state
                .list_tasks(TaskFilter {
                    status,
                    order_by_priority: true,
                    ..Default::default()
                })
                .await
                .map_err(|e| eyre::eyre!("{}", e))?;
            if tasks.is_empty() {
                println!("no tasks");
            }
            for task in tasks {
                println!(
                    "{}  {:<12} {:<8} {}",
                    task.id.dimmed(),
                    format_status(task.status),
                    task.priority.to_string(),
                    task.title
                );
            }
            Ok(())
        }
        TasksCommand::Show { id } => {
            let task = state
                .get_task_required(&id)
                .await
                .map_err(|e| eyre::eyre!("{}", e))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
        TasksCommand::Add {
            title,
            workflow,
            priority,
            effort,
            depends_on,
            parent,
        } => {
            let priority = priority.parse::<Priority>().map_err(|e| eyre::eyre!(e))?;
            let effort = effort.parse::<Effort>().map_err(|e| eyre::eyre!(e))?;

            let mut task = Task::new(project_dir.display().to_string(), workflow, title)
                .with_priority(priority)
                .with_effort(effort);
            for dep in depends_on {
                task = task.with_dependency(dep);
            }
            if let Some(parent) = parent {
                task = task.with_parent(parent);
            }

            let created = state
                .create_task(task)
                .await
                .map_err(|e| eyre::eyre!("{}", e))?;
            println!("{} {}", "queued:".green().bold(), created.id);
            Ok(())
        }
        TasksCommand::Cancel { id } => {
            state
                .update_task_status(&id, TaskStatus::Cancelled, None, Some("cancelled by user"))
                .await
                .map_err(|e| eyre::eyre!("{}", e))?;
            println!("{} {}", "cancelled:".yellow().bold(), id);
            Ok(())
        }
    };

    state.shutdown().await.ok();
    result
}

fn format_status(status: TaskStatus) -> String {
    let text = status.to_string();
    match status {
        TaskStatus::Completed => text.green().to_string(),
        TaskStatus::Failed => text.red().to_string(),
        TaskStatus::InProgress => text.cyan().to_string(),
        TaskStatus::Paused => text.yellow().to_string(),
        _ => text,
    }
}
