//! Live peer connections
//!
//! The reactor only ever sees a connection as an id plus the sending half of the
//! writer task's channel. Registries store `ConnId`s, never the channels themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{Channel, Packet};

/// Identifier of an accepted connection
pub type ConnId = u64;

/// Outgoing side of one connection
#[derive(Debug)]
pub struct Conn {
    pub channel: Channel,
    /// Peer pid from socket credentials
    pub pid: Option<u32>,
    tx: mpsc::UnboundedSender<Packet>,
}

/// Hands out connection ids to the accept loops of every channel
#[derive(Debug, Clone, Default)]
pub struct ConnIds(Arc<AtomicU64>);

impl ConnIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ConnId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Every open connection, keyed by id
#[derive(Debug, Default)]
pub struct Connections {
    conns: HashMap<ConnId, Conn>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ConnId, channel: Channel, pid: Option<u32>, tx: mpsc::UnboundedSender<Packet>) {
        debug!(id, %channel, ?pid, "Connections::insert");
        self.conns.insert(id, Conn { channel, pid, tx });
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Conn> {
        self.conns.remove(&id)
    }

    pub fn get(&self, id: ConnId) -> Option<&Conn> {
        self.conns.get(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Queue a packet on a connection's writer. False if the connection is gone.
    pub fn send(&self, id: ConnId, packet: Packet) -> bool {
        match self.conns.get(&id) {
            Some(conn) => conn.tx.send(packet).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    #[test]
    fn test_send_reaches_writer() {
        let ids = ConnIds::new();
        let mut conns = Connections::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ids.next();
        conns.insert(id, Channel::Client, Some(10), tx);

        assert!(conns.send(id, Packet::notify("ping", args![])));
        assert_eq!(rx.try_recv().unwrap().cmd, "ping");
        assert!(!conns.send(id + 1, Packet::notify("ping", args![])));
    }

    #[test]
    fn test_conn_ids_shared_across_clones() {
        let ids = ConnIds::new();
        let other = ids.clone();
        assert_eq!(ids.next(), 1);
        assert_eq!(other.next(), 2);
    }

    #[test]
    fn test_send_to_closed_writer_fails() {
        let mut conns = Connections::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnIds::new().next();
        conns.insert(id, Channel::Slave, None, tx);
        drop(rx);
        assert!(!conns.send(id, Packet::notify("x", args![])));
    }
}
