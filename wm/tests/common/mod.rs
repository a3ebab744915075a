//! Shared harness: a master driven event by event over in-memory connections

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use widgetmaster::args;
use widgetmaster::config::Config;
use widgetmaster::connection::ConnId;
use widgetmaster::instance::{InstanceKey, NewInstance};
use widgetmaster::protocol::{Args, Channel, Packet, PacketKind};
use widgetmaster::render::MemorySurfaceBackend;
use widgetmaster::slave::{ExternalLauncher, LaunchLog};
use widgetmaster::store::{MemoryPackageStore, PackageInfo};
use widgetmaster::timer::Timers;
use widgetmaster::{Master, ReactorEvent};

/// One side of an in-memory connection
pub struct Endpoint {
    pub conn: ConnId,
    pub rx: mpsc::UnboundedReceiver<Packet>,
    seq: u64,
    /// Packets that arrived alongside a reply and have not been drained yet
    pending: Vec<Packet>,
}

impl Endpoint {
    /// Everything the master has written so far
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets = std::mem::take(&mut self.pending);
        packets.extend(std::iter::from_fn(|| self.rx.try_recv().ok()));
        packets
    }

    /// Send a request and return its reply
    pub fn request(&mut self, m: &mut Master, cmd: &str, args: Args) -> Args {
        self.seq += 1;
        let seq = self.seq;
        m.handle_event(ReactorEvent::Packet {
            conn: self.conn,
            packet: Packet::request(seq, cmd, args),
        });
        let (mut replies, others): (Vec<_>, Vec<_>) = self
            .drain()
            .into_iter()
            .partition(|p| p.kind == PacketKind::Reply && p.seq == seq);
        self.pending = others;
        replies.pop().map(|p| p.args).unwrap_or_else(|| panic!("no reply to {cmd}"))
    }

    pub fn notify(&mut self, m: &mut Master, cmd: &str, args: Args) {
        m.handle_event(ReactorEvent::Packet {
            conn: self.conn,
            packet: Packet::notify(cmd, args),
        });
    }
}

pub fn clock() -> PackageInfo {
    PackageInfo {
        period: 60.0,
        width: 172,
        height: 172,
        gbar_width: 360,
        gbar_height: 240,
        ..PackageInfo::fallback("clock")
    }
}

pub fn master_with(packages: Vec<PackageInfo>) -> (Master, Arc<Mutex<LaunchLog>>) {
    let mut store = MemoryPackageStore::new();
    for info in packages {
        store.insert(info);
    }
    let launcher = ExternalLauncher::new();
    let log = launcher.log();
    let master = Master::new(
        Config::default(),
        Box::new(launcher),
        Box::new(store),
        Box::new(MemorySurfaceBackend::new()),
        Timers::manual(),
    );
    (master, log)
}

pub fn connect(m: &mut Master, channel: Channel, conn: ConnId, pid: u32) -> Endpoint {
    let (tx, rx) = mpsc::unbounded_channel();
    m.handle_event(ReactorEvent::Connected {
        channel,
        conn,
        pid: Some(pid),
        tx,
    });
    Endpoint {
        conn,
        rx,
        seq: 0,
        pending: Vec::new(),
    }
}

/// Connect a worker and say hello under `name`
pub fn attach_worker(m: &mut Master, conn: ConnId, name: &str) -> Endpoint {
    let mut worker = connect(m, Channel::Slave, conn, 7000 + conn as u32);
    worker.notify(m, "hello", args![0, name, "none", "c"]);
    worker
}

/// Connect a viewer and complete the `acquire` handshake
pub fn acquire_viewer(m: &mut Master, conn: ConnId, pid: u32) -> Endpoint {
    let mut viewer = connect(m, Channel::Client, conn, pid);
    let reply = viewer.request(m, "acquire", args![]);
    assert_eq!(reply.ret(), 0);
    viewer
}

/// Answer every request the worker receives with `(0, 0, 1.0)` until it goes quiet
pub fn serve_worker(m: &mut Master, worker: &mut Endpoint) -> Vec<Packet> {
    let mut seen = Vec::new();
    loop {
        let batch = worker.drain();
        if batch.is_empty() {
            return seen;
        }
        for packet in batch {
            if packet.kind == PacketKind::Request {
                m.handle_event(ReactorEvent::Packet {
                    conn: worker.conn,
                    packet: packet.reply(args![0, 0, 1.0]),
                });
            }
            seen.push(packet);
        }
    }
}

pub fn unowned(pkg: &str, timestamp: f64) -> NewInstance {
    NewInstance {
        owner: None,
        timestamp,
        pkg: pkg.to_string(),
        content: String::new(),
        cluster: "home".to_string(),
        category: "time".to_string(),
        period: 60.0,
        width: 0,
        height: 0,
    }
}

/// Viewer-side `new`; returns the key of the instance it created
pub fn viewer_new(m: &mut Master, viewer: &mut Endpoint, pkg: &str, timestamp: f64) -> InstanceKey {
    let before = m.instances.instances_of(pkg);
    let reply = viewer.request(m, "new", args![timestamp, pkg, "", "home", "time", 60.0, 0, 0]);
    assert_eq!(reply.ret(), 0);
    m.instances
        .instances_of(pkg)
        .into_iter()
        .find(|k| !before.contains(k))
        .expect("instance created")
}

pub fn cmds(packets: &[Packet]) -> Vec<&str> {
    packets.iter().map(|p| p.cmd.as_str()).collect()
}
