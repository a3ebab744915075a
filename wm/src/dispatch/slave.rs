//! Worker channel

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{Ctx, Handler, HandlerResult};
use crate::args;
use crate::buffer::{BufferSlot, SurfaceName};
use crate::error::{ErrorCode, WmResult};
use crate::instance::{Instance, InstanceState};
use crate::master::Master;
use crate::protocol::{Args, Target};
use crate::slave::CallRecord;

pub(super) const VERBS: &[(&str, Handler)] = &[
    ("hello", hello),
    ("ping", ping),
    ("call", call),
    ("ret", ret),
    ("updated", updated),
    ("gbarUpdated", gbar_updated),
    ("descUpdated", desc_updated),
    ("deleted", deleted),
    ("faulted", faulted),
    ("acquireBuffer", acquire_buffer),
    ("resizeBuffer", resize_buffer),
    ("releaseBuffer", release_buffer),
    ("acquireExtraBuffer", acquire_extra_buffer),
    ("resizeExtraBuffer", resize_extra_buffer),
    ("releaseExtraBuffer", release_extra_buffer),
    ("updateBegin", update_begin),
    ("updateEnd", update_end),
];

/// Name of the attached worker on this connection
fn sender(m: &Master, ctx: &Ctx) -> WmResult<String> {
    m.slaves
        .find_by_conn(ctx.conn)
        .filter(|s| s.is_activated())
        .map(|s| s.name.clone())
        .ok_or(ErrorCode::NotExist)
}

/// The sending worker must be the one hosting `pkg`
fn check_host(m: &Master, ctx: &Ctx, pkg: &str) -> WmResult<String> {
    let name = sender(m, ctx)?;
    match m.instances.slave_of(pkg) {
        Some(host) if host == name => Ok(name),
        Some(host) => {
            warn!(slave = %name, %pkg, %host, "Worker addressed a package it does not host");
            Err(ErrorCode::PermissionDenied)
        }
        None => Err(ErrorCode::NotExist),
    }
}

/// Validate that `(pkg, id)` is a live instance of a healthy package the sender hosts
fn check_hosted(m: &Master, ctx: &Ctx, pkg: &str, id: &str) -> WmResult<()> {
    check_host(m, ctx, pkg)?;
    if m.instances.is_fault(pkg) {
        return Err(ErrorCode::Fault);
    }
    m.instances.live_instance(pkg, id).map(|_| ())
}

/// `hello(secured, name, acceleration, abi)`
fn hello(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let secured = args.bool(0)?;
    let name = args.name(1)?;
    let acceleration = args.str(2)?;
    let abi = args.name(3)?;
    m.attach_slave(ctx.conn, ctx.pid, name, secured, acceleration, abi)?;
    Ok(None)
}

fn ping(m: &mut Master, ctx: &Ctx, _args: &Args) -> HandlerResult {
    let name = sender(m, ctx)?;
    m.arm_ping_timer(&name);
    Ok(None)
}

/// `call(pkg, id, func)`: the worker is entering package code
fn call(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id, func) = (args.name(0)?, args.str(1)?, args.str(2)?);
    let name = sender(m, ctx)?;
    let slave = m.slaves.get_mut(&name).ok_or(ErrorCode::NotExist)?;
    slave.calls.push(CallRecord {
        pkg: pkg.to_string(),
        id: id.to_string(),
        func: func.to_string(),
        at: Utc::now(),
    });
    Ok(None)
}

/// `ret(pkg, id, func)`: the matching `call` finished
fn ret(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id, func) = (args.name(0)?, args.str(1)?, args.str(2)?);
    let name = sender(m, ctx)?;
    let slave = m.slaves.get_mut(&name).ok_or(ErrorCode::NotExist)?;
    let pos = slave
        .calls
        .iter()
        .rposition(|c| c.pkg == pkg && c.id == id && c.func == func)
        .ok_or(ErrorCode::NotExist)?;
    slave.calls.remove(pos);
    Ok(None)
}

/// `updated(pkg, id, file, x, y, w, h)`: primary view content changed
fn updated(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    let file = args.str(2)?;
    let (x, y, w, h) = (args.i32(3)?, args.i32(4)?, args.i32(5)?, args.i32(6)?);
    check_hosted(m, ctx, pkg, id)?;
    let inst = m.instances.live_instance(pkg, id)?;
    if inst.state == InstanceState::Created {
        debug!(%pkg, %id, "updated: first content, activating");
        m.activate_instance(&(pkg.to_string(), id.to_string()));
        return Ok(None);
    }
    m.notify_viewers(pkg, id, "updated", args![pkg, id, file, x, y, w, h]);
    Ok(None)
}

/// `gbarUpdated(pkg, id, file, x, y, w, h)`: detail view content changed
fn gbar_updated(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    let file = args.str(2)?;
    let (x, y, w, h) = (args.i32(3)?, args.i32(4)?, args.i32(5)?, args.i32(6)?);
    check_hosted(m, ctx, pkg, id)?;
    m.instances.live_instance(pkg, id)?.ensure_active()?;
    m.gbar_content_arrived(pkg, id);
    m.notify_viewers(pkg, id, "gbarUpdated", args![pkg, id, file, x, y, w, h]);
    Ok(None)
}

/// `descUpdated(target, pkg, id, desc)`
fn desc_updated(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    let (pkg, id) = (args.name(1)?, args.name(2)?);
    let desc = args.str(3)?;
    check_hosted(m, ctx, pkg, id)?;
    m.instances.live_instance(pkg, id)?.ensure_active()?;
    if target == Target::Gbar {
        m.gbar_content_arrived(pkg, id);
    }
    m.notify_viewers(pkg, id, "descUpdated", args![target.as_str(), pkg, id, desc]);
    Ok(None)
}

/// `deleted(pkg, id)`: the worker dropped the instance on its own
fn deleted(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    check_host(m, ctx, pkg)?;
    m.instances.live_instance(pkg, id)?;
    info!(%pkg, %id, "Worker deleted instance");
    m.notify_viewers(pkg, id, "deleted", args![pkg, id, 0]);
    m.destroy_instance(&(pkg.to_string(), id.to_string()));
    Ok(None)
}

/// `faulted(pkg, id, file, func)`: the worker caught package code misbehaving
fn faulted(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let pkg = args.name(0)?;
    let id = args.str(1)?;
    let (file, func) = (args.str(2)?, args.str(3)?);
    check_host(m, ctx, pkg)?;
    warn!(%pkg, %id, %file, %func, "Worker reported package fault");
    m.fault_package(pkg, file, func)?;
    Ok(None)
}

fn label(target: Target, extra: Option<usize>) -> String {
    match extra {
        Some(idx) => format!("{target}-extra{idx}"),
        None => target.as_str().to_string(),
    }
}

/// Slot addressed by a buffer verb, created on demand for extra buffers
fn slot_of(inst: &mut Instance, target: Target, extra: Option<usize>) -> &mut BufferSlot {
    match extra {
        None => inst.slot_mut(target),
        Some(idx) => {
            let (w, h) = inst.slot(target).size();
            inst.extra.entry((target, idx)).or_insert_with(|| BufferSlot::new(w, h))
        }
    }
}

fn extra_index(m: &Master, args: &Args, idx: usize) -> WmResult<usize> {
    let n = usize::try_from(args.i32(idx)?).map_err(|_| ErrorCode::InvalidParameter)?;
    if n >= m.buffers.max_extra() {
        return Err(ErrorCode::NoSpace);
    }
    Ok(n)
}

/// `(w, h[, depth])` starting at `at`; zero size keeps the slot's desired size
fn acquire_slot(m: &mut Master, ctx: &Ctx, args: &Args, target: Target, extra: Option<usize>, at: usize) -> HandlerResult {
    let (pkg, id) = (args.name(at)?, args.name(at + 1)?);
    let (w, h) = (args.size(at + 2)?, args.size(at + 3)?);
    let depth = args.size(at + 4).ok().filter(|d| *d > 0);
    let surface = label(target, extra);

    check_hosted(m, ctx, pkg, id)?;
    let inst = m.instances.live_instance_mut(pkg, id)?;
    let slot = slot_of(inst, target, extra);
    if w > 0 && h > 0 && !slot.is_allocated() {
        slot.desired = (w, h);
    }
    let name = SurfaceName {
        pkg,
        id,
        label: &surface,
    };
    let resource = m.buffers.acquire(slot, name, depth)?;
    debug!(%pkg, %id, label = %surface, %resource, "acquire_slot: acquired");
    Ok(Some(args![0, resource]))
}

fn resize_slot(m: &mut Master, ctx: &Ctx, args: &Args, target: Target, extra: Option<usize>, at: usize) -> HandlerResult {
    let (pkg, id) = (args.name(at)?, args.name(at + 1)?);
    let (w, h) = (args.size(at + 2)?, args.size(at + 3)?);
    let surface = label(target, extra);

    check_hosted(m, ctx, pkg, id)?;
    let inst = m.instances.live_instance_mut(pkg, id)?;
    let slot = slot_of(inst, target, extra);
    let name = SurfaceName {
        pkg,
        id,
        label: &surface,
    };
    let resource = m.buffers.resize(slot, name, w, h)?.ok_or(ErrorCode::NotExist)?;
    if extra.is_none() {
        m.notify_viewers(pkg, id, "bufferChanged", args![target.as_str(), pkg, id, w, h, resource.as_str()]);
    }
    Ok(Some(args![0, resource]))
}

fn release_slot(m: &mut Master, ctx: &Ctx, args: &Args, target: Target, extra: Option<usize>, at: usize) -> HandlerResult {
    let (pkg, id) = (args.name(at)?, args.name(at + 1)?);
    check_hosted(m, ctx, pkg, id)?;
    let inst = m.instances.live_instance_mut(pkg, id)?;
    match extra {
        None => m.buffers.release(inst.slot_mut(target))?,
        Some(idx) => {
            let slot = inst.extra.get_mut(&(target, idx)).ok_or(ErrorCode::NotExist)?;
            m.buffers.release(slot)?;
            if !slot.is_allocated() {
                inst.extra.remove(&(target, idx));
            }
        }
    }
    Ok(None)
}

/// `acquireBuffer(target, pkg, id, w, h[, depth])` returns `(0, resource)`
fn acquire_buffer(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    acquire_slot(m, ctx, args, target, None, 1)
}

/// `resizeBuffer(target, pkg, id, w, h)` returns `(0, resource)`; the id may change
fn resize_buffer(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    resize_slot(m, ctx, args, target, None, 1)
}

fn release_buffer(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    release_slot(m, ctx, args, target, None, 1)
}

/// `acquireExtraBuffer(target, idx, pkg, id, w, h[, depth])`
fn acquire_extra_buffer(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    let idx = extra_index(m, args, 1)?;
    acquire_slot(m, ctx, args, target, Some(idx), 2)
}

fn resize_extra_buffer(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    let idx = extra_index(m, args, 1)?;
    resize_slot(m, ctx, args, target, Some(idx), 2)
}

fn release_extra_buffer(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    let idx = extra_index(m, args, 1)?;
    release_slot(m, ctx, args, target, Some(idx), 2)
}

/// `updateBegin(target, pkg, id, priority, content, title)`
fn update_begin(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    let (pkg, id) = (args.name(1)?, args.name(2)?);
    let priority = args.f64(3)?;
    let (content, title) = (args.str(4)?, args.str(5)?);

    check_hosted(m, ctx, pkg, id)?;
    let inst = m.instances.live_instance_mut(pkg, id)?;
    inst.ensure_active()?;
    if inst.updating.contains(&target) {
        return Err(ErrorCode::Already);
    }
    inst.updating.push(target);
    if target == Target::Dbox {
        inst.priority = priority;
        inst.content = content.to_string();
        inst.title = title.to_string();
    }
    m.notify_viewers(pkg, id, "updateBegin", args![target.as_str(), pkg, id, priority, content, title]);
    Ok(None)
}

/// `updateEnd(target, pkg, id)`
fn update_end(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    let (pkg, id) = (args.name(1)?, args.name(2)?);

    check_hosted(m, ctx, pkg, id)?;
    let inst = m.instances.live_instance_mut(pkg, id)?;
    let pos = inst
        .updating
        .iter()
        .position(|t| *t == target)
        .ok_or(ErrorCode::InvalidState)?;
    inst.updating.remove(pos);
    if target == Target::Gbar {
        m.gbar_content_arrived(pkg, id);
    }
    m.notify_viewers(pkg, id, "updateEnd", args![target.as_str(), pkg, id]);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_labels() {
        assert_eq!(label(Target::Dbox, None), "dbox");
        assert_eq!(label(Target::Gbar, Some(2)), "gbar-extra2");
    }
}
