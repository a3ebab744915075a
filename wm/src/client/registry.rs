//! Viewer connection registry

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::connection::ConnId;
use crate::error::{ErrorCode, WmResult};
use crate::queue::CommandQueue;

/// A cluster/category subscription. `*` matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupFilter {
    pub cluster: String,
    pub category: String,
}

impl GroupFilter {
    pub fn new(cluster: &str, category: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            category: category.to_string(),
        }
    }

    pub fn matches(&self, cluster: &str, category: &str) -> bool {
        (self.cluster == "*" || self.cluster == cluster) && (self.category == "*" || self.category == category)
    }
}

/// One viewer process
pub struct Client {
    pub pid: u32,
    pub conn: ConnId,
    pub paused: bool,
    pub queue: CommandQueue,
    pub subscriptions: BTreeSet<GroupFilter>,
    /// Buffer resources this viewer holds a reference on (may repeat)
    pub handles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Client {
    fn new(pid: u32, conn: ConnId) -> Self {
        Self {
            pid,
            conn,
            paused: false,
            queue: CommandQueue::new(),
            subscriptions: BTreeSet::new(),
            handles: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_subscribed(&self, cluster: &str, category: &str) -> bool {
        self.subscriptions.iter().any(|f| f.matches(cluster, category))
    }
}

/// Every connected viewer, keyed by pid
#[derive(Default)]
pub struct ClientRegistry {
    clients: BTreeMap<u32, Client>,
    paused: usize,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn paused_count(&self) -> usize {
        self.paused
    }

    /// True when no viewer is showing anything (including when none are connected)
    pub fn all_paused(&self) -> bool {
        self.paused >= self.clients.len()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.clients.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// Register a viewer on its `acquire` handshake
    pub fn create(&mut self, pid: u32, conn: ConnId) -> WmResult<&mut Client> {
        if self.clients.contains_key(&pid) {
            return Err(ErrorCode::Exist);
        }
        info!(pid, conn, "Viewer acquired");
        Ok(self.clients.entry(pid).or_insert_with(|| Client::new(pid, conn)))
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<&Client> {
        self.clients.get(&pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut Client> {
        self.clients.get_mut(&pid)
    }

    pub fn find_by_connection(&self, conn: ConnId) -> Option<&Client> {
        self.clients.values().find(|c| c.conn == conn)
    }

    /// Drop the record. The caller has already unwound its instances.
    pub fn remove(&mut self, pid: u32) -> Option<Client> {
        let client = self.clients.remove(&pid)?;
        if client.paused {
            self.paused -= 1;
        }
        info!(pid, "Viewer released");
        Some(client)
    }

    pub fn pause(&mut self, pid: u32) -> WmResult<()> {
        let client = self.clients.get_mut(&pid).ok_or(ErrorCode::NotExist)?;
        if client.paused {
            return Err(ErrorCode::Already);
        }
        client.paused = true;
        self.paused += 1;
        debug!(pid, paused = self.paused, total = self.clients.len(), "ClientRegistry::pause");
        Ok(())
    }

    pub fn resume(&mut self, pid: u32) -> WmResult<()> {
        let client = self.clients.get_mut(&pid).ok_or(ErrorCode::NotExist)?;
        if !client.paused {
            return Err(ErrorCode::Already);
        }
        client.paused = false;
        self.paused -= 1;
        debug!(pid, paused = self.paused, total = self.clients.len(), "ClientRegistry::resume");
        Ok(())
    }

    pub fn subscribe(&mut self, pid: u32, cluster: &str, category: &str) -> WmResult<()> {
        let client = self.clients.get_mut(&pid).ok_or(ErrorCode::NotExist)?;
        if !client.subscriptions.insert(GroupFilter::new(cluster, category)) {
            return Err(ErrorCode::Already);
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, pid: u32, cluster: &str, category: &str) -> WmResult<()> {
        let client = self.clients.get_mut(&pid).ok_or(ErrorCode::NotExist)?;
        if !client.subscriptions.remove(&GroupFilter::new(cluster, category)) {
            return Err(ErrorCode::NotExist);
        }
        Ok(())
    }

    /// Viewers interested in a group
    pub fn subscribers_of(&self, cluster: &str, category: &str) -> Vec<u32> {
        self.clients
            .values()
            .filter(|c| c.is_subscribed(cluster, category))
            .map(|c| c.pid)
            .collect()
    }
}
