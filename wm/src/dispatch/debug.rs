//! Debug channel: listings and a narrow control surface
//!
//! Listings reply `(0, text)` where `text` holds one JSON record per line followed
//! by an [`EOD`] line.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::{Ctx, Handler, HandlerResult, matches_filter};
use crate::args;
use crate::error::ErrorCode;
use crate::instance::{InstanceSummary, PackageSummary};
use crate::master::{Master, Peer};
use crate::protocol::Args;
use crate::queue::Command;

/// Last line of every listing
pub const EOD: &str = "EOD";

pub(super) const VERBS: &[(&str, Handler)] = &[
    ("pkgList", pkg_list),
    ("instList", inst_list),
    ("slaveList", slave_list),
    ("pkgCtrl", pkg_ctrl),
    ("masterCtrl", master_ctrl),
];

fn listing<T: Serialize>(rows: impl IntoIterator<Item = T>) -> HandlerResult {
    let mut text = String::new();
    for row in rows {
        let line = serde_json::to_string(&row).map_err(|_| ErrorCode::Io)?;
        text.push_str(&line);
        text.push('\n');
    }
    text.push_str(EOD);
    text.push('\n');
    Ok(Some(args![0, text]))
}

fn pkg_list(m: &mut Master, _ctx: &Ctx, _args: &Args) -> HandlerResult {
    listing(m.instances.packages().map(PackageSummary::from))
}

/// `instList(pkg)`; empty or `*` lists every instance
fn inst_list(m: &mut Master, _ctx: &Ctx, args: &Args) -> HandlerResult {
    let pkg = args.str(0).unwrap_or("");
    listing(
        m.instances
            .instances()
            .filter(|i| matches_filter(pkg, &i.pkg))
            .map(InstanceSummary::from),
    )
}

fn slave_list(m: &mut Master, _ctx: &Ctx, _args: &Args) -> HandlerResult {
    listing(m.slaves.summaries())
}

/// `pkgCtrl(rmpack, pkg)`, `pkgCtrl(rminst, pkg, id)`, `pkgCtrl(faultinst, pkg, id)`
fn pkg_ctrl(m: &mut Master, _ctx: &Ctx, args: &Args) -> HandlerResult {
    let op = args.name(0)?;
    let pkg = args.name(1)?;
    match op {
        "rmpack" => {
            warn!(%pkg, "Removing package on request");
            for key in m.instances.instances_of(pkg) {
                remove_instance(m, &key.0, &key.1);
            }
            m.instances.remove_package(pkg)?;
        }
        "rminst" => {
            let id = args.name(2)?;
            m.instances.live_instance(pkg, id)?;
            remove_instance(m, pkg, id);
        }
        "faultinst" => {
            let id = args.str(2).unwrap_or("");
            warn!(%pkg, %id, "Faulting package on request");
            m.fault_package(pkg, pkg, "faultinst")?;
        }
        _ => return Err(ErrorCode::InvalidParameter),
    }
    Ok(None)
}

/// Tell the worker, tell the viewers, then drop the instance
fn remove_instance(m: &mut Master, pkg: &str, id: &str) {
    if let Some(slave) = m.instances.slave_of(pkg).map(str::to_string) {
        let cmd = Command::notify("delete", args![pkg, id, "debug"]).for_instance(pkg, Some(id));
        m.push_command(Peer::Slave(slave), cmd);
    }
    m.notify_viewers(pkg, id, "deleted", args![pkg, id, 0]);
    m.destroy_instance(&(pkg.to_string(), id.to_string()));
}

/// `masterCtrl(get|set, key[, value])`; keys are `network` (0/1) and `gbar-timeout` (ms)
fn master_ctrl(m: &mut Master, _ctx: &Ctx, args: &Args) -> HandlerResult {
    let op = args.name(0)?;
    let key = args.name(1)?;
    match (op, key) {
        ("get", "network") => Ok(Some(args![0, i32::from(m.tunables.network)])),
        ("get", "gbar-timeout") => Ok(Some(args![0, m.tunables.gbar_timeout.as_millis() as u64])),
        ("set", "network") => {
            m.tunables.network = args.bool(2)?;
            info!(network = m.tunables.network, "Tunable changed");
            Ok(Some(args![0, i32::from(m.tunables.network)]))
        }
        ("set", "gbar-timeout") => {
            let ms = u64::try_from(args.i32(2)?).map_err(|_| ErrorCode::InvalidParameter)?;
            if ms == 0 {
                return Err(ErrorCode::InvalidParameter);
            }
            m.tunables.gbar_timeout = Duration::from_millis(ms);
            info!(gbar_timeout_ms = ms, "Tunable changed");
            Ok(Some(args![0, ms]))
        }
        _ => Err(ErrorCode::InvalidParameter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_ends_with_eod() {
        let reply = listing(vec![1, 2]).unwrap().unwrap();
        assert_eq!(reply.ret(), 0);
        assert_eq!(reply.str(1).unwrap(), "1\n2\nEOD\n");
    }

    #[test]
    fn test_empty_listing() {
        let reply = listing(Vec::<u8>::new()).unwrap().unwrap();
        assert_eq!(reply.str(1).unwrap(), "EOD\n");
    }
}
