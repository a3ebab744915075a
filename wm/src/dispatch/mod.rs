//! Verb tables for the four channels
//!
//! Handlers never block. Anything that needs a worker round-trip is queued and the
//! handler returns immediately; the real outcome reaches the viewer later as a
//! separate notification.

mod client;
mod debug;
mod service;
mod slave;

pub use debug::EOD;

use tracing::{debug, warn};

use crate::args;
use crate::connection::ConnId;
use crate::error::WmResult;
use crate::master::Master;
use crate::protocol::{Args, Channel, Packet, PacketKind};

/// Who sent the packet being handled
#[derive(Debug, Clone, Copy)]
pub struct Ctx {
    pub conn: ConnId,
    /// Peer pid from socket credentials
    pub pid: Option<u32>,
}

/// `Ok(None)` replies `[0]`; `Err(code)` replies `[code]`
pub type HandlerResult = WmResult<Option<Args>>;

pub type Handler = fn(&mut Master, &Ctx, &Args) -> HandlerResult;

/// Verb table for a channel
pub fn table(channel: Channel) -> &'static [(&'static str, Handler)] {
    match channel {
        Channel::Slave => slave::VERBS,
        Channel::Client => client::VERBS,
        Channel::Service => service::VERBS,
        Channel::Debug => debug::VERBS,
    }
}

pub fn lookup(channel: Channel, verb: &str) -> Option<Handler> {
    table(channel).iter().find(|(name, _)| *name == verb).map(|(_, h)| *h)
}

/// Run the handler for an inbound request or notification and answer requests
pub fn handle(master: &mut Master, channel: Channel, conn: ConnId, packet: Packet) {
    let ctx = Ctx {
        conn,
        pid: master.conns.get(conn).and_then(|c| c.pid),
    };
    debug!(%channel, conn, cmd = %packet.cmd, kind = ?packet.kind, "dispatch: called");

    let result = match lookup(channel, &packet.cmd) {
        Some(handler) => handler(master, &ctx, &packet.args),
        None => {
            warn!(%channel, cmd = %packet.cmd, "Unknown verb");
            Err(crate::error::ErrorCode::InvalidParameter)
        }
    };

    match packet.kind {
        PacketKind::Request => {
            let reply = match result {
                Ok(Some(args)) => args,
                Ok(None) => args![0],
                Err(e) => args![e.code()],
            };
            if !master.conns.send(conn, packet.reply(reply)) {
                debug!(conn, cmd = %packet.cmd, "dispatch: reply dropped, connection gone");
            }
        }
        PacketKind::Notify | PacketKind::Reply => {
            if let Err(e) = result {
                debug!(%channel, cmd = %packet.cmd, error = %e, "dispatch: notification failed");
            }
        }
    }
}

/// Empty or `*` matches anything
pub(crate) fn matches_filter(filter: &str, value: &str) -> bool {
    filter.is_empty() || filter == "*" || filter == value
}
