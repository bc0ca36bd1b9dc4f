//! Daemon process management
//!
//! PID-file bookkeeping, background spawning, and signal-based stop for
//! one daemon per project. An fs2 advisory lock on the state directory
//! guarantees a single scheduler instance owns a project.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use eyre::{Context, Result};
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::config::Config;

/// PID file name inside the state directory
pub const PID_FILE: &str = "apexd.pid";
/// Lock file name inside the state directory
pub const LOCK_FILE: &str = "apexd.lock";

/// Process manager for one project's daemon
#[derive(Debug)]
pub struct ProcessManager {
    project_dir: PathBuf,
    pid_file: PathBuf,
}

impl ProcessManager {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let pid_file = Config::state_dir(&project_dir).join(PID_FILE);
        Self {
            project_dir,
            pid_file,
        }
    }

    /// Whether a daemon for this project is alive
    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// PID of the live daemon, if any
    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| is_process_running(pid))
    }

    fn read_pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.pid_file).ok()?;
        contents.trim().parse().ok()
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("create state directory")?;
        }
        let mut file = fs::File::create(&self.pid_file).context("create PID file")?;
        write!(file, "{}", pid).context("write PID")?;
        debug!(pid, path = %self.pid_file.display(), "wrote PID file");
        Ok(())
    }

    fn remove_pid_file(&self) -> Result<()> {
        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).context("remove PID file")?;
        }
        Ok(())
    }

    /// Spawn the daemon as a detached background process running
    /// `run-daemon` against this project, and record its PID.
    pub fn start(&self) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            eyre::bail!("daemon already running with PID {}", pid);
        }

        let exe = std::env::current_exe().context("resolve current executable")?;
        let child = Command::new(&exe)
            .arg("run-daemon")
            .arg("--project")
            .arg(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, project = %self.project_dir.display(), "daemon started");
        Ok(pid)
    }

    /// Register the current process as the daemon (foreground mode)
    pub fn register_self(&self) -> Result<()> {
        self.write_pid(std::process::id())
    }

    /// Stop the daemon: SIGTERM, wait for exit, escalate to SIGKILL
    /// after the grace window.
    pub fn stop(&self) -> Result<()> {
        let Some(pid) = self.running_pid() else {
            eyre::bail!("daemon is not running");
        };

        info!(pid, "stopping daemon");
        terminate(pid)?;

        let mut attempts = 0;
        while is_process_running(pid) && attempts < 50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            attempts += 1;
        }

        if is_process_running(pid) {
            warn!(pid, "daemon did not stop gracefully, killing");
            kill_hard(pid);
        }

        self.remove_pid_file()?;
        info!(pid, "daemon stopped");
        Ok(())
    }

    /// Remove the PID file on clean shutdown of a foreground daemon
    pub fn deregister_self(&self) -> Result<()> {
        self.remove_pid_file()
    }

    /// PID file path
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }
}

/// Exclusive lock held for the life of a daemon process. Dropping the
/// guard releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    _file: fs::File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the per-project lock; fails fast when another daemon owns it
    pub fn acquire(project_dir: &Path) -> Result<Self> {
        let state_dir = Config::state_dir(project_dir);
        fs::create_dir_all(&state_dir).context("create state directory")?;
        let path = state_dir.join(LOCK_FILE);

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .context("open lock file")?;
        file.try_lock_exclusive().map_err(|_| {
            eyre::eyre!(
                "another apexd instance already owns {}; stop it first",
                project_dir.display()
            )
        })?;

        debug!(path = %path.display(), "instance lock acquired");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Check liveness by sending signal 0
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

fn terminate(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("send SIGTERM")?;
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        eyre::bail!("stop is only supported on unix");
    }

    Ok(())
}

fn kill_hard(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pid_round_trip() {
        let temp = tempdir().unwrap();
        let manager = ProcessManager::new(temp.path());

        assert_eq!(manager.read_pid(), None);
        manager.write_pid(12345).unwrap();
        assert_eq!(manager.read_pid(), Some(12345));

        manager.remove_pid_file().unwrap();
        assert_eq!(manager.read_pid(), None);
    }

    #[test]
    fn test_stale_pid_is_not_running() {
        let temp = tempdir().unwrap();
        let manager = ProcessManager::new(temp.path());
        // beyond any realistic pid_max
        manager.write_pid(3_999_999).unwrap();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_register_self_reports_running() {
        let temp = tempdir().unwrap();
        let manager = ProcessManager::new(temp.path());
        manager.register_self().unwrap();
        assert_eq!(manager.running_pid(), Some(std::process::id()));
        manager.deregister_self().unwrap();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_stop_without_daemon_errors() {
        let temp = tempdir().unwrap();
        let manager = ProcessManager::new(temp.path());
        assert!(manager.stop().is_err());
    }

    #[test]
    fn test_instance_lock_is_exclusive() {
        let temp = tempdir().unwrap();

        let first = InstanceLock::acquire(temp.path()).unwrap();
        assert!(first.path().exists());
        assert!(InstanceLock::acquire(temp.path()).is_err());

        drop(first);
        let _second = InstanceLock::acquire(temp.path()).unwrap();
    }
}
