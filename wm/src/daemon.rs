//! Daemon process management
//!
//! PID/version files and start/stop of the background master process.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use eyre::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// Version recorded by the running daemon
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn runtime_base() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("widgetmaster")
}

/// Default PID file location
fn default_pid_path() -> PathBuf {
    runtime_base().join("wm.pid")
}

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    pid_file: PathBuf,
    version_file: PathBuf,
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonManager {
    pub fn new() -> Self {
        Self::with_pid_file(default_pid_path())
    }

    /// Daemon manager with a custom PID file path; the version file sits beside it
    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        debug!(?pid_file, "DaemonManager::with_pid_file: called");
        let version_file = pid_file.with_extension("version");
        Self { pid_file, version_file }
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// PID of the running daemon, if the PID file points at a live process
    pub fn running_pid(&self) -> Option<u32> {
        let result = self.read_pid().filter(|&pid| is_process_running(pid));
        debug!(?result, "DaemonManager::running_pid: returning");
        result
    }

    fn read_pid(&self) -> Option<u32> {
        read_trimmed(&self.pid_file)?.parse().ok()
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        write_file(&self.pid_file, &pid.to_string()).context("Failed to write PID file")?;
        debug!(pid, path = ?self.pid_file, "Wrote PID file");
        Ok(())
    }

    fn remove_pid_file(&self) -> Result<()> {
        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).context("Failed to remove PID file")?;
            debug!(path = ?self.pid_file, "Removed PID file");
        }
        Ok(())
    }

    pub fn read_version(&self) -> Option<String> {
        read_trimmed(&self.version_file)
    }

    fn write_version(&self, version: &str) -> Result<()> {
        write_file(&self.version_file, version).context("Failed to write version file")
    }

    fn remove_version_file(&self) -> Result<()> {
        if self.version_file.exists() {
            fs::remove_file(&self.version_file).context("Failed to remove version file")?;
        }
        Ok(())
    }

    /// Whether the running daemon was built from this version
    pub fn version_matches(&self) -> bool {
        self.read_version().is_some_and(|v| v == VERSION)
    }

    /// Spawn `wm run-daemon` in the background and return its PID
    pub fn start(&self, config: Option<&PathBuf>) -> Result<u32> {
        debug!(?config, "DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let mut cmd = Command::new(&exe);
        if let Some(path) = config {
            cmd.arg("--config").arg(path);
        }
        let child = cmd
            .arg("run-daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// SIGTERM the daemon, escalating to SIGKILL after five seconds
    pub fn stop(&self) -> Result<()> {
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon...");
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;

        let mut attempts = 0;
        while is_process_running(pid) && attempts < 50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            attempts += 1;
        }
        if is_process_running(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }

        self.remove_pid_file()?;
        self.remove_version_file()?;
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Record the current process as the daemon
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        self.write_pid(pid)?;
        self.write_version(VERSION)?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }

    /// Remove PID and version files on a clean exit
    pub fn unregister_self(&self) -> Result<()> {
        if self.read_pid() == Some(std::process::id()) {
            self.remove_pid_file()?;
            self.remove_version_file()?;
        }
        Ok(())
    }

    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            version: pid.and_then(|_| self.read_version()),
            pid_file: self.pid_file.clone(),
        }
    }
}

fn read_trimmed(path: &PathBuf) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    Some(contents.trim().to_string())
}

fn write_file(path: &PathBuf, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create directory")?;
    }
    let mut file = fs::File::create(path).context("Failed to create file")?;
    write!(file, "{}", contents).context("Failed to write file")?;
    Ok(())
}

/// Signal 0 checks for existence without affecting the process
fn is_process_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub version: Option<String>,
    pub pid_file: PathBuf,
}
