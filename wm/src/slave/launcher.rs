//! Starting and killing worker processes

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, WmResult};
use crate::master::ReactorEvent;

/// Launches worker processes on the master's behalf
pub trait SlaveLauncher: Send {
    /// Start a worker. Returns its pid when known at launch time.
    fn launch(&mut self, name: &str, secured: bool, abi: &str) -> WmResult<Option<u32>>;

    /// Force-kill a worker
    fn kill(&mut self, name: &str, pid: u32) -> WmResult<()>;
}

/// Spawns the configured worker executable and reports its exit to the reactor
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    socket: PathBuf,
    events: mpsc::UnboundedSender<ReactorEvent>,
}

impl ProcessLauncher {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        socket: PathBuf,
        events: mpsc::UnboundedSender<ReactorEvent>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            socket,
            events,
        }
    }
}

impl SlaveLauncher for ProcessLauncher {
    fn launch(&mut self, name: &str, secured: bool, abi: &str) -> WmResult<Option<u32>> {
        debug!(%name, secured, %abi, command = %self.command, "ProcessLauncher::launch: called");
        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .arg("--name")
            .arg(name)
            .arg("--secured")
            .arg(if secured { "1" } else { "0" })
            .arg("--abi")
            .arg(abi)
            .env("WM_SLAVE_SOCKET", &self.socket)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                warn!(%name, error = %e, "Failed to spawn worker");
                ErrorCode::from(e)
            })?;

        let pid = child.id().ok_or(ErrorCode::Fault)?;
        info!(%name, pid, "Worker launched");

        let events = self.events.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(%name, error = %e, "Failed to wait for worker");
                    None
                }
            };
            let _ = events.send(ReactorEvent::SlaveExited { name, pid, code });
        });

        Ok(Some(pid))
    }

    fn kill(&mut self, name: &str, pid: u32) -> WmResult<()> {
        debug!(%name, pid, "ProcessLauncher::kill: sending SIGKILL");
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let raw = i32::try_from(pid).map_err(|_| ErrorCode::InvalidParameter)?;
            kill(Pid::from_raw(raw), Signal::SIGKILL).map_err(|e| {
                warn!(%name, pid, error = %e, "Failed to kill worker");
                ErrorCode::NotExist
            })?;
        }
        Ok(())
    }
}

/// What an [`ExternalLauncher`] was asked to do
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LaunchLog {
    pub launched: Vec<String>,
    pub killed: Vec<(String, u32)>,
}

/// For workers started by someone else (a session supervisor, a test harness).
///
/// Launch requests are only recorded; the worker's pid is learned from its socket
/// credentials when it says hello. Kill requests are recorded, not signalled.
#[derive(Debug, Default, Clone)]
pub struct ExternalLauncher {
    log: Arc<Mutex<LaunchLog>>,
}

impl ExternalLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the recorded requests
    pub fn log(&self) -> Arc<Mutex<LaunchLog>> {
        Arc::clone(&self.log)
    }
}

impl SlaveLauncher for ExternalLauncher {
    fn launch(&mut self, name: &str, _secured: bool, _abi: &str) -> WmResult<Option<u32>> {
        debug!(%name, "ExternalLauncher::launch: waiting for worker to connect");
        if let Ok(mut log) = self.log.lock() {
            log.launched.push(name.to_string());
        }
        Ok(None)
    }

    fn kill(&mut self, name: &str, pid: u32) -> WmResult<()> {
        debug!(%name, pid, "ExternalLauncher::kill: recorded");
        if let Ok(mut log) = self.log.lock() {
            log.killed.push((name.to_string(), pid));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_launcher_records() {
        let mut launcher = ExternalLauncher::new();
        let log = launcher.log();
        assert_eq!(launcher.launch("slave.1", false, "c").unwrap(), None);
        launcher.kill("slave.1", 42).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.launched, vec!["slave.1".to_string()]);
        assert_eq!(log.killed, vec![("slave.1".to_string(), 42)]);
    }

    #[tokio::test]
    async fn test_process_launcher_reports_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut launcher = ProcessLauncher::new("true", Vec::new(), PathBuf::from("/tmp/wm.sock"), tx);
        let pid = launcher.launch("slave.t", false, "c").unwrap().unwrap();

        let ev = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match ev {
            ReactorEvent::SlaveExited { name, pid: exited, .. } => {
                assert_eq!(name, "slave.t");
                assert_eq!(exited, pid);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_process_launcher_missing_binary() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut launcher = ProcessLauncher::new("/nonexistent/provider", Vec::new(), PathBuf::from("/tmp/x"), tx);
        assert_eq!(launcher.launch("slave.x", false, "c"), Err(ErrorCode::NotExist));
    }
}
