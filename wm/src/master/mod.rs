//! The reactor context
//!
//! A single task owns `Master` and feeds it `ReactorEvent`s one at a time. Connection
//! tasks, timers, process watchers and the input thread only post events; they
//! never touch the registries, so nothing here needs a lock.

mod lifecycle;

pub use lifecycle::DeleteReason;

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::buffer::BufferBroker;
use crate::client::ClientRegistry;
use crate::config::Config;
use crate::connection::{ConnId, Connections};
use crate::dispatch;
use crate::error::{ErrorCode, WmResult};
use crate::input::{InputEvent, InputRouter};
use crate::instance::InstanceManager;
use crate::protocol::{Args, Channel, Packet, PacketKind};
use crate::queue::{Command, CommandQueue, InFlight};
use crate::render::RenderBackend;
use crate::slave::{SlaveLauncher, SlaveRegistry};
use crate::store::PackageStore;
use crate::subscribers::{HookResult, Subscribers};
use crate::timer::{TimerEvent, TimerId, Timers};

/// Everything the reactor reacts to
#[derive(Debug)]
pub enum ReactorEvent {
    /// A connection was accepted on one of the four channels
    Connected {
        channel: Channel,
        conn: ConnId,
        pid: Option<u32>,
        tx: mpsc::UnboundedSender<Packet>,
    },
    Packet {
        conn: ConnId,
        packet: Packet,
    },
    Disconnected {
        conn: ConnId,
    },
    Timer {
        id: TimerId,
    },
    /// A launched worker process exited
    SlaveExited {
        name: String,
        pid: u32,
        code: Option<i32>,
    },
    Input(InputEvent),
    Shutdown,
}

/// Who a queued command is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Peer {
    Slave(String),
    Client(u32),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slave(name) => write!(f, "slave:{name}"),
            Self::Client(pid) => write!(f, "client:{pid}"),
        }
    }
}

/// Called when a worker is deactivated (crash, stall, teardown)
pub type SlaveHook = Box<dyn FnMut(&mut Master, &str) -> HookResult + Send>;

/// Runtime-adjustable settings (debug channel `masterCtrl`)
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub network: bool,
    pub gbar_timeout: Duration,
}

/// The master's whole state
pub struct Master {
    pub config: Config,
    pub conns: Connections,
    pub slaves: SlaveRegistry,
    pub clients: ClientRegistry,
    pub instances: InstanceManager,
    pub buffers: BufferBroker,
    pub timers: Timers,
    pub slave_hooks: Subscribers<SlaveHook>,
    pub input: InputRouter,
    pub tunables: Tunables,
    all_paused: bool,
}

impl Master {
    pub fn new(
        config: Config,
        launcher: Box<dyn SlaveLauncher>,
        store: Box<dyn PackageStore>,
        backend: Box<dyn RenderBackend>,
        timers: Timers,
    ) -> Self {
        let tunables = Tunables {
            network: false,
            gbar_timeout: config.monitor.gbar_timeout(),
        };
        Self {
            slaves: SlaveRegistry::new(launcher, config.slave.max_load),
            clients: ClientRegistry::new(),
            instances: InstanceManager::new(store),
            buffers: BufferBroker::new(backend, config.buffer.pixel_depth, config.buffer.max_extra_buffers),
            conns: Connections::new(),
            timers,
            slave_hooks: Subscribers::new(),
            input: InputRouter::new(),
            tunables,
            all_paused: true,
            config,
        }
    }

    /// Consume events until shutdown or until every sender is gone
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ReactorEvent>) {
        info!("Master reactor started");
        while let Some(event) = rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        info!("Master reactor stopped");
    }

    /// Process one event. Returns false once the reactor should stop.
    pub fn handle_event(&mut self, event: ReactorEvent) -> bool {
        match event {
            ReactorEvent::Connected { channel, conn, pid, tx } => {
                self.conns.insert(conn, channel, pid, tx);
            }
            ReactorEvent::Packet { conn, packet } => self.handle_packet(conn, packet),
            ReactorEvent::Disconnected { conn } => self.handle_disconnect(conn),
            ReactorEvent::Timer { id } => self.handle_timer(id),
            ReactorEvent::SlaveExited { name, pid, code } => self.handle_slave_exit(&name, pid, code),
            ReactorEvent::Input(event) => self.handle_input(event),
            ReactorEvent::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn handle_packet(&mut self, conn: ConnId, packet: Packet) {
        let Some(channel) = self.conns.get(conn).map(|c| c.channel) else {
            debug!(conn, cmd = %packet.cmd, "handle_packet: unknown connection");
            return;
        };
        match packet.kind {
            PacketKind::Reply => self.handle_reply(conn, packet),
            PacketKind::Request | PacketKind::Notify => dispatch::handle(self, channel, conn, packet),
        }
    }

    fn handle_reply(&mut self, conn: ConnId, packet: Packet) {
        let peer = if let Some(slave) = self.slaves.find_by_conn(conn) {
            Peer::Slave(slave.name.clone())
        } else if let Some(client) = self.clients.find_by_connection(conn) {
            Peer::Client(client.pid)
        } else {
            debug!(conn, cmd = %packet.cmd, "handle_reply: reply from unknown peer");
            return;
        };

        let Some(flight) = self.queue_mut(&peer).and_then(|q| q.complete(packet.seq)) else {
            warn!(%peer, seq = packet.seq, cmd = %packet.cmd, "Unexpected reply dropped");
            return;
        };
        if let Some(timer) = flight.timer {
            self.timers.cancel(timer);
        }
        debug!(%peer, seq = flight.seq, cmd = %flight.cmd, ret = packet.args.ret(), "handle_reply: resolved");
        (flight.reply)(self, Ok(packet.args));
        self.drain(&peer);
    }

    fn handle_disconnect(&mut self, conn: ConnId) {
        let Some(closed) = self.conns.remove(conn) else {
            return;
        };
        debug!(conn, channel = %closed.channel, "handle_disconnect: called");
        if let Some(name) = self.slaves.find_by_conn(conn).map(|s| s.name.clone()) {
            info!(%name, conn, "Worker connection lost");
            self.slave_lost(&name, "disconnected");
        } else if let Some(pid) = self.clients.find_by_connection(conn).map(|c| c.pid) {
            info!(pid, conn, "Viewer connection lost");
            self.destroy_client(pid);
        }
    }

    fn handle_timer(&mut self, id: TimerId) {
        let Some(event) = self.timers.take(id) else {
            debug!(id, "handle_timer: already cancelled");
            return;
        };
        match event {
            TimerEvent::ReplyTimeout { slave, seq } => {
                let waiting = self.slaves.find_by_name(&slave).and_then(|s| s.queue.waiting_seq());
                if waiting == Some(seq) {
                    warn!(%slave, seq, "Worker did not reply in time");
                    self.slave_stalled(&slave, "reply timeout");
                }
            }
            TimerEvent::PingTimeout { slave } => {
                let current = self.slaves.get_mut(&slave).filter(|s| s.ping_timer == Some(id));
                if let Some(s) = current {
                    s.ping_timer = None;
                    warn!(%slave, "Worker stopped pinging");
                    self.slave_stalled(&slave, "ping timeout");
                }
            }
            TimerEvent::SlaveIdle { slave } => self.reap_idle_slave(&slave, id),
            TimerEvent::Monitor { pkg, id: inst, kind } => {
                debug!(%pkg, %inst, ?kind, "handle_timer: monitor expired");
                self.complete_monitor(&pkg, &inst, id, Err(ErrorCode::Timeout));
            }
        }
    }

    fn handle_slave_exit(&mut self, name: &str, pid: u32, code: Option<i32>) {
        let matches = self
            .slaves
            .find_by_name(name)
            .is_some_and(|s| s.pid == Some(pid) && s.is_running());
        if !matches {
            debug!(%name, pid, ?code, "handle_slave_exit: stale exit ignored");
            return;
        }
        info!(%name, pid, ?code, "Worker process exited");
        self.slave_lost(name, "exited");
    }

    fn handle_input(&mut self, event: InputEvent) {
        let Some(focus) = self.input.focused().cloned() else {
            debug!(?event, "handle_input: no focus");
            return;
        };
        let args = crate::args![
            focus.target.as_str(),
            focus.pkg.as_str(),
            focus.id.as_str(),
            event.timestamp,
            event.x,
            event.y
        ];
        if let Err(e) = self.forward_to_slave(&focus.pkg, &focus.id, event.kind.verb(), args) {
            debug!(pkg = %focus.pkg, id = %focus.id, error = %e, "handle_input: dropped");
        }
    }

    fn shutdown(&mut self) {
        info!(slaves = self.slaves.len(), clients = self.clients.len(), "Master shutting down");
        for name in self.slaves.names() {
            self.destroy_slave(&name);
        }
    }

    fn queue_mut(&mut self, peer: &Peer) -> Option<&mut CommandQueue> {
        match peer {
            Peer::Slave(name) => self.slaves.get_mut(name).map(|s| &mut s.queue),
            Peer::Client(pid) => self.clients.get_mut(*pid).map(|c| &mut c.queue),
        }
    }

    /// Connection of a peer able to take commands now
    fn peer_conn(&self, peer: &Peer) -> Option<ConnId> {
        match peer {
            Peer::Slave(name) => self
                .slaves
                .find_by_name(name)
                .filter(|s| s.is_activated())
                .and_then(|s| s.conn),
            Peer::Client(pid) => self.clients.find_by_pid(*pid).map(|c| c.conn),
        }
    }

    /// Queue a command for a peer and start delivering if it was idle
    pub fn push_command(&mut self, peer: Peer, cmd: Command) {
        debug!(%peer, cmd = %cmd.cmd, pkg = ?cmd.pkg, "push_command: called");
        let Some(queue) = self.queue_mut(&peer) else {
            debug!(%peer, cmd = %cmd.cmd, "push_command: no such peer");
            if let Some(reply) = cmd.reply {
                reply(self, Err(ErrorCode::NotExist));
            }
            return;
        };
        queue.push(cmd);
        self.drain(&peer);
    }

    /// Deliver queued commands in order, stopping at the first one that needs a reply.
    ///
    /// Commands for a faulted package are dropped here; their continuation (if any)
    /// resolves with `Fault`.
    pub fn drain(&mut self, peer: &Peer) {
        loop {
            let Some(conn) = self.peer_conn(peer) else {
                return;
            };
            let Some(cmd) = self.queue_mut(peer).and_then(CommandQueue::pop_ready) else {
                return;
            };

            if matches!(peer, Peer::Slave(_))
                && let Some(pkg) = cmd.pkg.as_deref()
                && self.instances.is_fault(pkg)
            {
                debug!(%peer, cmd = %cmd.cmd, %pkg, "drain: package faulted, dropping command");
                if let Some(reply) = cmd.reply {
                    reply(self, Err(ErrorCode::Fault));
                }
                continue;
            }

            let Command {
                pkg,
                inst,
                cmd: verb,
                args,
                reply,
            } = cmd;
            let Some(reply) = reply else {
                if !self.conns.send(conn, Packet::notify(verb.clone(), args.clone())) {
                    warn!(%peer, cmd = %verb, "drain: send failed, requeued");
                    if let Some(q) = self.queue_mut(peer) {
                        q.push_front(Command { pkg, inst, cmd: verb, args, reply: None });
                    }
                    return;
                }
                continue;
            };

            let Some(seq) = self.queue_mut(peer).map(CommandQueue::next_seq) else {
                return;
            };
            if !self.conns.send(conn, Packet::request(seq, verb.clone(), args.clone())) {
                warn!(%peer, cmd = %verb, "drain: send failed, requeued");
                if let Some(q) = self.queue_mut(peer) {
                    q.push_front(Command {
                        pkg,
                        inst,
                        cmd: verb,
                        args,
                        reply: Some(reply),
                    });
                }
                return;
            }
            let timer = match peer {
                Peer::Slave(name) => Some(self.timers.after(
                    self.config.slave.reply_timeout(),
                    TimerEvent::ReplyTimeout {
                        slave: name.clone(),
                        seq,
                    },
                )),
                Peer::Client(_) => None,
            };
            if let Some(q) = self.queue_mut(peer) {
                q.wait_for(InFlight {
                    seq,
                    cmd: verb,
                    pkg,
                    inst,
                    reply,
                    timer,
                });
            }
            return;
        }
    }

    /// One-way notification to every worker
    pub fn broadcast_slaves(&mut self, cmd: &str, args: Args) {
        for name in self.slaves.names() {
            self.push_command(Peer::Slave(name), Command::notify(cmd, args.clone()));
        }
    }

    /// One-way notification to every viewer
    pub fn broadcast_clients(&mut self, cmd: &str, args: Args) {
        for pid in self.clients.pids() {
            self.push_command(Peer::Client(pid), Command::notify(cmd, args.clone()));
        }
    }

    pub fn notify_client(&mut self, pid: u32, cmd: &str, args: Args) {
        if self.clients.find_by_pid(pid).is_some() {
            self.push_command(Peer::Client(pid), Command::notify(cmd, args));
        }
    }

    /// Notify the owner of an instance and every viewer subscribed to its group
    pub fn notify_viewers(&mut self, pkg: &str, id: &str, cmd: &str, args: Args) {
        let Some(inst) = self.instances.find_instance(pkg, id) else {
            return;
        };
        let mut pids = self.clients.subscribers_of(&inst.cluster, &inst.category);
        if let Some(owner) = inst.owner
            && !pids.contains(&owner)
        {
            pids.push(owner);
        }
        for pid in pids {
            self.notify_client(pid, cmd, args.clone());
        }
    }

    /// Send a command for an active instance to its package's worker
    pub fn forward_to_slave(&mut self, pkg: &str, id: &str, cmd: &str, args: Args) -> WmResult<()> {
        self.instances.live_instance(pkg, id)?.ensure_active()?;
        let slave = self.instances.slave_of(pkg).ok_or(ErrorCode::Fault)?.to_string();
        self.push_command(Peer::Slave(slave), Command::notify(cmd, args).for_instance(pkg, Some(id)));
        Ok(())
    }

    /// Send a request for an active instance; `reply` runs when the worker answers
    pub fn request_slave(
        &mut self,
        pkg: &str,
        id: &str,
        cmd: &str,
        args: Args,
        reply: crate::queue::ReplyFn,
    ) -> WmResult<()> {
        self.instances.live_instance(pkg, id)?.ensure_active()?;
        let slave = self.instances.slave_of(pkg).ok_or(ErrorCode::Fault)?.to_string();
        self.push_command(Peer::Slave(slave), Command::request(cmd, args, reply).for_instance(pkg, Some(id)));
        Ok(())
    }

    /// True when no viewer is showing anything
    pub fn all_paused(&self) -> bool {
        self.all_paused
    }

    /// Recompute the viewer pause aggregate and propagate a transition to workers
    pub fn update_pause_state(&mut self) {
        let now = self.clients.all_paused();
        if now == self.all_paused {
            return;
        }
        self.all_paused = now;
        info!(paused = now, viewers = self.clients.len(), "Viewer pause state changed");
        for name in self.slaves.names() {
            self.set_slave_paused(&name, now);
        }
    }

    /// Pause or resume one worker (one-way notification)
    pub fn set_slave_paused(&mut self, name: &str, paused: bool) {
        let Some(slave) = self.slaves.get_mut(name) else {
            return;
        };
        if slave.paused == paused {
            return;
        }
        slave.paused = paused;
        if slave.is_activated() {
            slave.state = if paused {
                crate::slave::SlaveState::Paused
            } else {
                crate::slave::SlaveState::Resumed
            };
        }
        let cmd = if paused { "pause" } else { "resume" };
        let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.push_command(Peer::Slave(name.to_string()), Command::notify(cmd, crate::args![timestamp]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::render::MemorySurfaceBackend;
    use crate::slave::ExternalLauncher;
    use crate::store::MemoryPackageStore;

    fn master() -> Master {
        Master::new(
            Config::default(),
            Box::new(ExternalLauncher::new()),
            Box::new(MemoryPackageStore::new()),
            Box::new(MemorySurfaceBackend::new()),
            Timers::manual(),
        )
    }

    fn attach_slave(m: &mut Master, name: &str, conn: ConnId) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        m.handle_event(ReactorEvent::Connected {
            channel: Channel::Slave,
            conn,
            pid: Some(500 + conn as u32),
            tx,
        });
        m.handle_event(ReactorEvent::Packet {
            conn,
            packet: Packet::notify("hello", args![0, name, "none", "c"]),
        });
        rx
    }

    fn drain_rx(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Vec<Packet> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_commands_wait_for_connection() {
        let mut m = master();
        m.slaves.create("s", false, "c");
        m.push_command(Peer::Slave("s".into()), Command::notify("a", args![]));
        assert_eq!(m.slaves.find_by_name("s").unwrap().queue.len(), 1);

        let mut rx = attach_slave(&mut m, "s", 1);
        let cmds: Vec<_> = drain_rx(&mut rx).into_iter().map(|p| p.cmd).collect();
        assert!(cmds.contains(&"a".to_string()));
    }

    #[test]
    fn test_request_blocks_queue_until_reply() {
        let mut m = master();
        let mut rx = attach_slave(&mut m, "s", 1);
        drain_rx(&mut rx);

        m.push_command(Peer::Slave("s".into()), Command::request("a", args![], Box::new(|_: &mut Master, _| {})));
        m.push_command(Peer::Slave("s".into()), Command::notify("b", args![]));
        let sent = drain_rx(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].cmd, "a");
        let reply_timer = |m: &Master| m.timers.find(|e| matches!(e, TimerEvent::ReplyTimeout { .. }));
        assert!(reply_timer(&m).is_some(), "reply timeout armed");

        m.handle_event(ReactorEvent::Packet {
            conn: 1,
            packet: sent[0].reply(args![0]),
        });
        let sent = drain_rx(&mut rx);
        assert_eq!(sent.iter().map(|p| p.cmd.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert!(reply_timer(&m).is_none());
    }

    #[test]
    fn test_push_to_unknown_peer_fails_continuation() {
        let mut m = master();
        let hit = std::sync::Arc::new(std::sync::Mutex::new(None));
        let seen = hit.clone();
        m.push_command(
            Peer::Slave("ghost".into()),
            Command::request(
                "x",
                args![],
                Box::new(move |_: &mut Master, res: WmResult<Args>| {
                    *seen.lock().unwrap() = Some(res.err());
                }),
            ),
        );
        assert_eq!(*hit.lock().unwrap(), Some(Some(ErrorCode::NotExist)));
    }

    #[test]
    fn test_shutdown_stops_reactor() {
        let mut m = master();
        assert!(m.handle_event(ReactorEvent::Timer { id: 42 }));
        assert!(!m.handle_event(ReactorEvent::Shutdown));
    }
}
