//! Viewer channel

use tracing::{debug, info};

use super::service::{request_updates, select};
use super::{Ctx, Handler, HandlerResult};
use crate::args;
use crate::error::{ErrorCode, WmResult};
use crate::instance::{GbarState, NewInstance};
use crate::master::{Master, Peer};
use crate::protocol::Args;
use crate::queue::Command;

pub(super) const VERBS: &[(&str, Handler)] = &[
    ("acquire", acquire),
    ("release", release),
    ("pause", pause),
    ("resume", resume),
    ("new", new),
    ("delete", delete),
    ("resize", resize),
    ("setPeriod", set_period),
    ("changeGroup", change_group),
    ("pinupChanged", pinup_changed),
    ("activatePackage", activate_package),
    ("clicked", clicked),
    ("createDetail", create_detail),
    ("destroyDetail", destroy_detail),
    ("moveDetail", move_detail),
    ("mouseDown", mouse_down),
    ("mouseMove", mouse_move),
    ("mouseUp", mouse_up),
    ("mouseEnter", mouse_enter),
    ("mouseLeave", mouse_leave),
    ("mouseSet", mouse_set),
    ("mouseUnset", mouse_unset),
    ("keyDown", key_down),
    ("keyUp", key_up),
    ("keyFocusIn", key_focus_in),
    ("keyFocusOut", key_focus_out),
    ("accessHighlight", access_highlight),
    ("accessHighlightNext", access_highlight_next),
    ("accessHighlightPrev", access_highlight_prev),
    ("accessActivate", access_activate),
    ("accessAction", access_action),
    ("accessScroll", access_scroll),
    ("accessValueChange", access_value_change),
    ("accessMouse", access_mouse),
    ("accessBack", access_back),
    ("accessOver", access_over),
    ("accessRead", access_read),
    ("accessEnable", access_enable),
    ("acquirePixmap", acquire_pixmap),
    ("releasePixmap", release_pixmap),
    ("subscribe", subscribe),
    ("unsubscribe", unsubscribe),
    ("refreshGroup", refresh_group),
];

/// Pid of the acquired viewer on this connection
fn viewer(m: &Master, ctx: &Ctx) -> WmResult<u32> {
    m.clients
        .find_by_connection(ctx.conn)
        .map(|c| c.pid)
        .ok_or(ErrorCode::NotExist)
}

/// Live instance owned by (or open to) this viewer
fn owned(m: &Master, ctx: &Ctx, pkg: &str, id: &str) -> WmResult<u32> {
    let pid = viewer(m, ctx)?;
    m.instances.live_instance(pkg, id)?.check_owner(pid)?;
    Ok(pid)
}

fn acquire(m: &mut Master, ctx: &Ctx, _args: &Args) -> HandlerResult {
    let pid = ctx.pid.ok_or(ErrorCode::PermissionDenied)?;
    m.create_client(pid, ctx.conn)?;
    Ok(Some(args![0, i32::from(m.tunables.network)]))
}

fn release(m: &mut Master, ctx: &Ctx, _args: &Args) -> HandlerResult {
    let pid = viewer(m, ctx)?;
    m.destroy_client(pid);
    Ok(None)
}

fn pause(m: &mut Master, ctx: &Ctx, _args: &Args) -> HandlerResult {
    let pid = viewer(m, ctx)?;
    m.clients.pause(pid)?;
    m.update_pause_state();
    Ok(None)
}

fn resume(m: &mut Master, ctx: &Ctx, _args: &Args) -> HandlerResult {
    let pid = viewer(m, ctx)?;
    m.clients.resume(pid)?;
    m.update_pause_state();
    Ok(None)
}

/// `new(timestamp, pkg, content, cluster, category, period, w, h)`
fn new(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let pid = viewer(m, ctx)?;
    let req = NewInstance {
        owner: Some(pid),
        timestamp: args.f64(0)?,
        pkg: args.name(1)?.to_string(),
        content: args.str(2)?.to_string(),
        cluster: args.str(3)?.to_string(),
        category: args.str(4)?.to_string(),
        period: args.f64(5)?,
        width: args.size(6)?,
        height: args.size(7)?,
    };
    let (pkg, id) = m.create_instance(&req)?;
    info!(pid, %pkg, %id, "Instance requested");
    Ok(None)
}

/// `delete(pkg, id)`: the worker drops it first, viewers hear `deleted` afterwards
fn delete(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    owned(m, ctx, pkg, id)?;
    let key = (pkg.to_string(), id.to_string());

    let Some(slave) = m.instances.slave_of(pkg).map(str::to_string) else {
        m.notify_viewers(pkg, id, "deleted", args![pkg, id, 0]);
        m.destroy_instance(&key);
        return Ok(None);
    };
    let reply = Box::new(move |m: &mut Master, res: WmResult<Args>| {
        let ret = res.map(|a| a.ret()).unwrap_or_else(|e| e.code());
        m.notify_viewers(&key.0, &key.1, "deleted", args![key.0.as_str(), key.1.as_str(), ret]);
        m.destroy_instance(&key);
    });
    let cmd = Command::request("delete", args![pkg, id, "user"], reply).for_instance(pkg, Some(id));
    m.push_command(Peer::Slave(slave), cmd);
    Ok(None)
}

/// `resize(pkg, id, w, h)`: answered later with `sizeChanged`
fn resize(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let pid = viewer(m, ctx)?;
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    m.resize_instance(Some(pid), pkg, id, (args.size(2)?, args.size(3)?))?;
    Ok(None)
}

fn set_period(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    let period = args.f64(2)?;
    if !period.is_finite() || period < 0.0 {
        return Err(ErrorCode::InvalidParameter);
    }
    owned(m, ctx, pkg, id)?;

    let (p, i) = (pkg.to_string(), id.to_string());
    m.request_slave(
        pkg,
        id,
        "set_period",
        args![pkg, id, period],
        Box::new(move |m: &mut Master, res| {
            let ret = res.map(|a| a.ret()).unwrap_or_else(|e| e.code());
            let Some(inst) = m.instances.instance_mut(&p, &i) else {
                return;
            };
            if ret == 0 {
                inst.period = period;
            }
            let current = inst.period;
            m.notify_viewers(&p, &i, "periodChanged", args![p.as_str(), i.as_str(), ret, current]);
        }),
    )?;
    Ok(None)
}

/// Shared by the viewer and service channels
pub(super) fn apply_group_change(m: &mut Master, pkg: &str, id: &str, cluster: &str, category: &str) -> WmResult<()> {
    let inst = m.instances.live_instance_mut(pkg, id)?;
    inst.cluster = cluster.to_string();
    inst.category = category.to_string();
    let active = inst.ensure_active().is_ok();
    if active {
        m.forward_to_slave(pkg, id, "change_group", args![pkg, id, cluster, category])?;
    }
    m.notify_viewers(pkg, id, "groupChanged", args![pkg, id, 0, cluster, category]);
    Ok(())
}

fn change_group(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    owned(m, ctx, pkg, id)?;
    apply_group_change(m, pkg, id, args.str(2)?, args.str(3)?)?;
    Ok(None)
}

fn pinup_changed(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    let pinned = args.bool(2)?;
    owned(m, ctx, pkg, id)?;
    let inst = m.instances.live_instance(pkg, id)?;
    if !inst.pinup.supported {
        return Err(ErrorCode::Disabled);
    }
    if inst.pinup.pinned == pinned {
        return Err(ErrorCode::Already);
    }

    let (p, i) = (pkg.to_string(), id.to_string());
    m.request_slave(
        pkg,
        id,
        "pinup",
        args![pkg, id, i32::from(pinned)],
        Box::new(move |m: &mut Master, res| {
            let ret = res.map(|a| a.ret()).unwrap_or_else(|e| e.code());
            let Some(inst) = m.instances.instance_mut(&p, &i) else {
                return;
            };
            if ret == 0 {
                inst.pinup.pinned = pinned;
            }
            let state = i32::from(inst.pinup.pinned);
            m.notify_viewers(&p, &i, "pinupChanged", args![p.as_str(), i.as_str(), ret, state]);
        }),
    )?;
    Ok(None)
}

fn activate_package(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    viewer(m, ctx)?;
    m.activate_package(args.name(0)?)?;
    Ok(None)
}

/// `clicked(pkg, id, event, timestamp, x, y)`
fn clicked(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    owned(m, ctx, pkg, id)?;
    let fwd = args![pkg, id, args.str(2)?, args.f64(3)?, args.f64(4)?, args.f64(5)?];
    m.forward_to_slave(pkg, id, "clicked", fwd)?;
    Ok(None)
}

/// `createDetail(pkg, id, x, y)`: answered later with `gbarCreated`
fn create_detail(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let pid = viewer(m, ctx)?;
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    m.open_gbar(pid, pkg, id, (args.f64(2)?, args.f64(3)?))?;
    Ok(None)
}

/// `destroyDetail(pkg, id)`: answered later with `gbarDestroyed`
fn destroy_detail(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let pid = viewer(m, ctx)?;
    m.close_gbar(pid, args.name(0)?, args.name(1)?)?;
    Ok(None)
}

fn move_detail(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let (pkg, id) = (args.name(0)?, args.name(1)?);
    let (x, y) = (args.f64(2)?, args.f64(3)?);
    owned(m, ctx, pkg, id)?;
    let inst = m.instances.live_instance_mut(pkg, id)?;
    if inst.gbar_state != GbarState::Open {
        return Err(ErrorCode::InvalidState);
    }
    inst.gbar_pos = (x, y);
    m.forward_to_slave(pkg, id, "gbar_move", args![pkg, id, x, y])?;
    Ok(None)
}

/// `(target, pkg, id, timestamp, x, y)` pointer events go straight to the worker
fn forward_pointer(m: &mut Master, ctx: &Ctx, args: &Args, verb: &str) -> HandlerResult {
    let target = args.target(0)?;
    let (pkg, id) = (args.name(1)?, args.name(2)?);
    owned(m, ctx, pkg, id)?;
    let fwd = args![target.as_str(), pkg, id, args.f64(3)?, args.f64(4)?, args.f64(5)?];
    m.forward_to_slave(pkg, id, verb, fwd)?;
    Ok(None)
}

fn mouse_down(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_pointer(m, ctx, args, "mouseDown")
}

fn mouse_move(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_pointer(m, ctx, args, "mouseMove")
}

fn mouse_up(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_pointer(m, ctx, args, "mouseUp")
}

fn mouse_enter(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_pointer(m, ctx, args, "mouseEnter")
}

fn mouse_leave(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_pointer(m, ctx, args, "mouseLeave")
}

/// `mouseSet(target, pkg, id)`: route raw input-device events to this view
fn mouse_set(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    let (pkg, id) = (args.name(1)?, args.name(2)?);
    owned(m, ctx, pkg, id)?;
    m.instances.live_instance(pkg, id)?.ensure_active()?;
    m.input.register(pkg, id, target)?;
    if let Some(inst) = m.instances.instance_mut(pkg, id)
        && !inst.input_focus.contains(&target)
    {
        inst.input_focus.push(target);
    }
    Ok(None)
}

fn mouse_unset(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    let (pkg, id) = (args.name(1)?, args.name(2)?);
    owned(m, ctx, pkg, id)?;
    m.input.unregister(pkg, id, target)?;
    if let Some(inst) = m.instances.instance_mut(pkg, id) {
        inst.input_focus.retain(|t| *t != target);
    }
    Ok(None)
}

/// Forward as a request; the worker's answer reaches the viewer as `status_cmd`
fn forward_with_status(m: &mut Master, ctx: &Ctx, args: &Args, verb: &str, status_cmd: &'static str) -> HandlerResult {
    let target = args.target(0)?;
    let (pkg, id) = (args.name(1)?, args.name(2)?);
    let pid = owned(m, ctx, pkg, id)?;
    let (p, i) = (pkg.to_string(), id.to_string());
    m.request_slave(
        pkg,
        id,
        verb,
        args.clone(),
        Box::new(move |m: &mut Master, res| {
            let ret = res.map(|a| a.ret()).unwrap_or_else(|e| e.code());
            debug!(pkg = %p, id = %i, ret, status = status_cmd, "forward_with_status: answered");
            m.notify_client(pid, status_cmd, args![target.as_str(), p.as_str(), i.as_str(), ret]);
        }),
    )?;
    Ok(None)
}

fn key_down(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "keyDown", "keyStatus")
}

fn key_up(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "keyUp", "keyStatus")
}

fn key_focus_in(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "keyFocusIn", "keyStatus")
}

fn key_focus_out(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "keyFocusOut", "keyStatus")
}

fn access_highlight(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessHighlight", "accessStatus")
}

fn access_highlight_next(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessHighlightNext", "accessStatus")
}

fn access_highlight_prev(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessHighlightPrev", "accessStatus")
}

fn access_activate(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessActivate", "accessStatus")
}

fn access_action(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessAction", "accessStatus")
}

fn access_scroll(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessScroll", "accessStatus")
}

fn access_value_change(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessValueChange", "accessStatus")
}

fn access_mouse(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessMouse", "accessStatus")
}

fn access_back(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessBack", "accessStatus")
}

fn access_over(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessOver", "accessStatus")
}

fn access_read(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessRead", "accessStatus")
}

fn access_enable(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    forward_with_status(m, ctx, args, "accessEnable", "accessStatus")
}

/// `acquirePixmap(target, pkg, id)` returns `(0, resource)`
fn acquire_pixmap(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let target = args.target(0)?;
    let (pkg, id) = (args.name(1)?, args.name(2)?);
    let pid = viewer(m, ctx)?;
    let inst = m.instances.live_instance(pkg, id)?;
    let resource = m
        .buffers
        .resource_of(inst.slot(target))
        .ok_or(ErrorCode::NotExist)?
        .to_string();
    m.buffers.ref_handle(&resource)?;
    if let Some(client) = m.clients.get_mut(pid) {
        client.handles.push(resource.clone());
    }
    debug!(pid, %pkg, %id, %resource, "acquire_pixmap: referenced");
    Ok(Some(args![0, resource]))
}

/// `releasePixmap(pkg, id, resource)`
fn release_pixmap(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let resource = args.name(2)?;
    let pid = viewer(m, ctx)?;
    let client = m.clients.get_mut(pid).ok_or(ErrorCode::NotExist)?;
    let pos = client
        .handles
        .iter()
        .position(|r| r == resource)
        .ok_or(ErrorCode::NotExist)?;
    client.handles.swap_remove(pos);
    m.buffers.unref_handle(resource)?;
    Ok(None)
}

fn subscribe(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let pid = viewer(m, ctx)?;
    m.clients.subscribe(pid, args.str(0)?, args.str(1)?)?;
    Ok(None)
}

fn unsubscribe(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    let pid = viewer(m, ctx)?;
    m.clients.unsubscribe(pid, args.str(0)?, args.str(1)?)?;
    Ok(None)
}

/// `refreshGroup(cluster, category)`: ask every matching active instance to update
fn refresh_group(m: &mut Master, ctx: &Ctx, args: &Args) -> HandlerResult {
    viewer(m, ctx)?;
    let (cluster, category) = (args.str(0)?, args.str(1)?);
    let keys = select(m, "", cluster, category);
    let count = request_updates(m, keys, true)?;
    Ok(Some(args![0, count]))
}
