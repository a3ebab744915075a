//! Worker process registry

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::launcher::SlaveLauncher;
use crate::connection::ConnId;
use crate::error::{ErrorCode, WmResult};
use crate::queue::CommandQueue;
use crate::timer::TimerId;

/// How many packages a worker may host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityTier {
    /// At most one package at a time
    Exclusive,
    /// Up to the configured max load
    Shared,
}

impl SecurityTier {
    pub fn from_secured(secured: bool) -> Self {
        if secured { Self::Exclusive } else { Self::Shared }
    }
}

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaveState {
    /// Record exists, no process
    Idle,
    /// Process started, no hello yet
    Launching,
    /// Connected and rendering
    Resumed,
    /// Connected, rendering suspended
    Paused,
    /// Process gone (crash, kill, disconnect)
    Terminated,
}

impl std::fmt::Display for SlaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Resumed => "resumed",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A worker is about to run package code (`call` .. `ret`)
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub pkg: String,
    pub id: String,
    pub func: String,
    pub at: DateTime<Utc>,
}

/// One worker process
pub struct Slave {
    pub name: String,
    pub pid: Option<u32>,
    pub conn: Option<ConnId>,
    pub tier: SecurityTier,
    pub abi: String,
    pub acceleration: Option<String>,
    pub state: SlaveState,
    pub paused: bool,
    pub fault_count: u32,
    pub queue: CommandQueue,
    /// Open `call` records, innermost last
    pub calls: Vec<CallRecord>,
    pub ping_timer: Option<TimerId>,
    pub idle_timer: Option<TimerId>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    refcnt: u32,
}

impl Slave {
    fn new(name: &str, tier: SecurityTier, abi: &str) -> Self {
        Self {
            name: name.to_string(),
            pid: None,
            conn: None,
            tier,
            abi: abi.to_string(),
            acceleration: None,
            state: SlaveState::Idle,
            paused: false,
            fault_count: 0,
            queue: CommandQueue::new(),
            calls: Vec::new(),
            ping_timer: None,
            idle_timer: None,
            created_at: Utc::now(),
            activated_at: None,
            refcnt: 0,
        }
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    pub fn is_secured(&self) -> bool {
        self.tier == SecurityTier::Exclusive
    }

    /// Connected and able to take commands
    pub fn is_activated(&self) -> bool {
        matches!(self.state, SlaveState::Resumed | SlaveState::Paused) && self.conn.is_some()
    }

    /// A process exists or is starting
    pub fn is_running(&self) -> bool {
        matches!(
            self.state,
            SlaveState::Launching | SlaveState::Resumed | SlaveState::Paused
        )
    }
}

/// Summary row for the debug channel
#[derive(Debug, Clone, Serialize)]
pub struct SlaveSummary {
    pub name: String,
    pub pid: Option<u32>,
    pub tier: SecurityTier,
    pub abi: String,
    pub state: SlaveState,
    pub refcnt: u32,
    pub fault_count: u32,
    pub queued: usize,
}

/// Every known worker, keyed by name
pub struct SlaveRegistry {
    slaves: BTreeMap<String, Slave>,
    launcher: Box<dyn SlaveLauncher>,
    max_load: u32,
    serial: u64,
}

impl SlaveRegistry {
    pub fn new(launcher: Box<dyn SlaveLauncher>, max_load: u32) -> Self {
        Self {
            slaves: BTreeMap::new(),
            launcher,
            max_load: max_load.max(1),
            serial: 0,
        }
    }

    pub fn max_load(&self) -> u32 {
        self.max_load
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.slaves.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slave> {
        self.slaves.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slave> {
        self.slaves.values_mut()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Slave> {
        self.slaves.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Slave> {
        self.slaves.get_mut(name)
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<&Slave> {
        self.slaves.values().find(|s| s.pid == Some(pid))
    }

    pub fn find_by_conn(&self, conn: ConnId) -> Option<&Slave> {
        self.slaves.values().find(|s| s.conn == Some(conn))
    }

    /// Some shared worker of the right ABI with room left, or none.
    ///
    /// Callers must not assume which one is returned when several qualify.
    pub fn find_usable(&self, abi: &str, max_load: u32) -> Option<String> {
        debug!(%abi, max_load, "SlaveRegistry::find_usable: called");
        self.slaves
            .values()
            .filter(|s| s.tier == SecurityTier::Shared && s.abi == abi && s.refcnt < max_load)
            .last()
            .map(|s| s.name.clone())
    }

    /// Name for a load-balanced worker
    pub fn generate_name(&mut self) -> String {
        loop {
            self.serial += 1;
            let name = format!("slave.{}", self.serial);
            if !self.slaves.contains_key(&name) {
                return name;
            }
        }
    }

    /// Get or create a worker record. Does not launch it.
    pub fn create(&mut self, name: &str, secured: bool, abi: &str) -> &mut Slave {
        self.slaves.entry(name.to_string()).or_insert_with(|| {
            info!(%name, secured, %abi, "Creating worker record");
            Slave::new(name, SecurityTier::from_secured(secured), abi)
        })
    }

    /// Start the worker's process if it is not already running
    pub fn launch(&mut self, name: &str) -> WmResult<()> {
        let slave = self.slaves.get_mut(name).ok_or(ErrorCode::NotExist)?;
        if slave.is_running() {
            debug!(%name, state = %slave.state, "SlaveRegistry::launch: already running");
            return Ok(());
        }
        let pid = self.launcher.launch(name, slave.is_secured(), &slave.abi)?;
        slave.pid = pid;
        slave.conn = None;
        slave.state = SlaveState::Launching;
        slave.calls.clear();
        Ok(())
    }

    /// Force-kill the worker's process (if one is known)
    pub fn kill(&mut self, name: &str) -> WmResult<()> {
        let slave = self.slaves.get_mut(name).ok_or(ErrorCode::NotExist)?;
        let Some(pid) = slave.pid else {
            return Ok(());
        };
        if let Err(e) = self.launcher.kill(name, pid) {
            warn!(%name, pid, error = %e, "Worker kill failed");
        }
        Ok(())
    }

    /// Take a reference on behalf of a package
    pub fn ref_slave(&mut self, name: &str) -> WmResult<u32> {
        let max_load = self.max_load;
        let slave = self.slaves.get_mut(name).ok_or(ErrorCode::NotExist)?;
        match slave.tier {
            SecurityTier::Exclusive if slave.refcnt > 0 => {
                warn!(%name, refcnt = slave.refcnt, "Exclusive worker already hosts a package");
                return Err(ErrorCode::InvalidState);
            }
            SecurityTier::Shared if slave.refcnt >= max_load => {
                warn!(%name, refcnt = slave.refcnt, max_load, "Shared worker is full");
                return Err(ErrorCode::NoSpace);
            }
            _ => {}
        }
        slave.refcnt += 1;
        debug!(%name, refcnt = slave.refcnt, "SlaveRegistry::ref_slave");
        Ok(slave.refcnt)
    }

    pub fn unref_slave(&mut self, name: &str) -> WmResult<u32> {
        let slave = self.slaves.get_mut(name).ok_or(ErrorCode::NotExist)?;
        if slave.refcnt == 0 {
            return Err(ErrorCode::InvalidState);
        }
        slave.refcnt -= 1;
        debug!(%name, refcnt = slave.refcnt, "SlaveRegistry::unref_slave");
        Ok(slave.refcnt)
    }

    /// Drop the record. The caller has already unwound its instances.
    pub fn remove(&mut self, name: &str) -> Option<Slave> {
        self.slaves.remove(name)
    }

    pub fn summaries(&self) -> Vec<SlaveSummary> {
        self.slaves
            .values()
            .map(|s| SlaveSummary {
                name: s.name.clone(),
                pid: s.pid,
                tier: s.tier,
                abi: s.abi.clone(),
                state: s.state,
                refcnt: s.refcnt,
                fault_count: s.fault_count,
                queued: s.queue.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::ExternalLauncher;

    fn registry(max_load: u32) -> SlaveRegistry {
        SlaveRegistry::new(Box::new(ExternalLauncher::new()), max_load)
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut reg = registry(4);
        reg.create("a", false, "c").fault_count = 2;
        let again = reg.create("a", true, "html");
        assert_eq!(again.fault_count, 2);
        assert_eq!(again.tier, SecurityTier::Shared);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_exclusive_refcount_is_zero_or_one() {
        let mut reg = registry(4);
        reg.create("secure", true, "c");
        assert_eq!(reg.ref_slave("secure"), Ok(1));
        assert_eq!(reg.ref_slave("secure"), Err(ErrorCode::InvalidState));
        assert_eq!(reg.find_by_name("secure").unwrap().refcnt(), 1);
        assert_eq!(reg.unref_slave("secure"), Ok(0));
        assert_eq!(reg.unref_slave("secure"), Err(ErrorCode::InvalidState));
    }

    #[test]
    fn test_shared_refcount_capped_by_max_load() {
        let mut reg = registry(2);
        reg.create("s", false, "c");
        reg.ref_slave("s").unwrap();
        reg.ref_slave("s").unwrap();
        assert_eq!(reg.ref_slave("s"), Err(ErrorCode::NoSpace));
        assert_eq!(reg.find_by_name("s").unwrap().refcnt(), 2);
    }

    #[test]
    fn test_find_usable_skips_full_and_exclusive() {
        let mut reg = registry(1);
        reg.create("secure", true, "c");
        reg.create("full", false, "c");
        reg.ref_slave("full").unwrap();
        reg.create("other-abi", false, "html");
        assert_eq!(reg.find_usable("c", 1), None);

        reg.create("free", false, "c");
        assert_eq!(reg.find_usable("c", 1).as_deref(), Some("free"));
    }

    #[test]
    fn test_find_usable_returns_some_match() {
        let mut reg = registry(3);
        reg.create("a", false, "c");
        reg.create("b", false, "c");
        let pick = reg.find_usable("c", 3).unwrap();
        assert!(pick == "a" || pick == "b");
    }

    #[test]
    fn test_launch_sets_launching() {
        let mut reg = registry(3);
        reg.create("a", false, "c");
        reg.launch("a").unwrap();
        let s = reg.find_by_name("a").unwrap();
        assert_eq!(s.state, SlaveState::Launching);
        assert!(s.is_running());
        assert!(!s.is_activated());
        assert_eq!(reg.launch("missing"), Err(ErrorCode::NotExist));
    }

    #[test]
    fn test_lookup_by_pid_and_conn() {
        let mut reg = registry(3);
        let s = reg.create("a", false, "c");
        s.pid = Some(77);
        s.conn = Some(5);
        assert_eq!(reg.find_by_pid(77).map(|s| s.name.as_str()), Some("a"));
        assert_eq!(reg.find_by_conn(5).map(|s| s.name.as_str()), Some("a"));
        assert!(reg.find_by_pid(78).is_none());
    }

    #[test]
    fn test_generate_name_skips_taken() {
        let mut reg = registry(3);
        reg.create("slave.1", false, "c");
        assert_eq!(reg.generate_name(), "slave.2");
    }
}
