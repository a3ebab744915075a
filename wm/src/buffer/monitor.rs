//! Detail-view and resize monitors
//!
//! An instance carries at most one pending monitor. Each monitor owns a timeout timer
//! and a worker-deactivation hook; whichever of reply, timeout, crash or a newer
//! request comes first completes it, and completion always notifies the viewer.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::SurfaceName;
use crate::args;
use crate::error::{ErrorCode, WmResult, ret_code};
use crate::instance::GbarState;
use crate::master::Master;
use crate::protocol::{Args, Target};
use crate::subscribers::{HookResult, SubscriptionToken};
use crate::timer::{TimerEvent, TimerId};

/// What a monitor is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    /// Detail view shown, waiting for its first frame
    Open,
    /// Detail view hide requested
    Close,
    /// Worker asked to resize a view
    Resize,
}

/// A pending monitor on an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub kind: MonitorKind,
    pub target: Target,
    /// Also identifies the monitor; continuations compare against it
    pub timer: TimerId,
    pub hook: SubscriptionToken,
    /// Viewer that asked, notified on completion
    pub viewer: Option<u32>,
    pub size: (u32, u32),
}

impl Master {
    /// Arm a monitor, completing any pending one with `Canceled` first
    #[allow(clippy::too_many_arguments)]
    pub fn arm_monitor(
        &mut self,
        pkg: &str,
        id: &str,
        kind: MonitorKind,
        target: Target,
        viewer: Option<u32>,
        size: (u32, u32),
        timeout: Duration,
    ) -> WmResult<TimerId> {
        debug!(%pkg, %id, ?kind, %target, ?viewer, ?timeout, "arm_monitor: called");
        if let Some(prev) = self.instances.live_instance(pkg, id)?.monitor.as_ref().map(|m| m.timer) {
            self.complete_monitor(pkg, id, prev, Err(ErrorCode::Canceled));
        }
        let slave = self.instances.slave_of(pkg).ok_or(ErrorCode::Fault)?.to_string();

        let timer = self.timers.after(
            timeout,
            TimerEvent::Monitor {
                pkg: pkg.to_string(),
                id: id.to_string(),
                kind,
            },
        );
        let (p, i) = (pkg.to_string(), id.to_string());
        let hook = self.slave_hooks.subscribe(Box::new(move |m: &mut Master, lost: &str| {
            if lost != slave {
                return HookResult::Keep;
            }
            m.complete_monitor(&p, &i, timer, Err(ErrorCode::Fault));
            HookResult::Done
        }));

        let Some(inst) = self.instances.instance_mut(pkg, id) else {
            self.timers.cancel(timer);
            self.slave_hooks.unsubscribe(hook);
            return Err(ErrorCode::NotExist);
        };
        inst.monitor = Some(Monitor {
            kind,
            target,
            timer,
            hook,
            viewer,
            size,
        });
        Ok(timer)
    }

    /// Finish the monitor identified by `timer`. Returns false if it is no longer pending.
    pub fn complete_monitor(&mut self, pkg: &str, id: &str, timer: TimerId, result: WmResult<()>) -> bool {
        let Some(inst) = self.instances.instance_mut(pkg, id) else {
            return false;
        };
        if inst.monitor.as_ref().map(|m| m.timer) != Some(timer) {
            debug!(%pkg, %id, timer, "complete_monitor: stale");
            return false;
        }
        let Some(monitor) = inst.monitor.take() else {
            return false;
        };
        match monitor.kind {
            MonitorKind::Open => {
                inst.gbar_state = if result.is_ok() { GbarState::Open } else { GbarState::Closed };
            }
            MonitorKind::Close => inst.gbar_state = GbarState::Closed,
            MonitorKind::Resize => {}
        }
        let current = inst.slot(monitor.target).size();
        self.timers.cancel(monitor.timer);
        self.slave_hooks.unsubscribe(monitor.hook);

        let ret = ret_code(&result);
        match &result {
            Ok(()) => info!(%pkg, %id, kind = ?monitor.kind, "Monitor completed"),
            Err(e) => warn!(%pkg, %id, kind = ?monitor.kind, error = %e, "Monitor failed"),
        }

        let (cmd, args) = match monitor.kind {
            MonitorKind::Open => {
                if result == Err(ErrorCode::Timeout)
                    && let Err(e) = self.forward_to_slave(pkg, id, "gbar_hide", args![pkg, id])
                {
                    debug!(%pkg, %id, error = %e, "complete_monitor: gbar_hide not sent");
                }
                ("gbarCreated", args![pkg, id, ret])
            }
            MonitorKind::Close => ("gbarDestroyed", args![pkg, id, ret]),
            MonitorKind::Resize => {
                let (ret, (w, h), resource) = match result {
                    Ok(()) => match self.resize_slot(pkg, id, monitor.target, monitor.size) {
                        Ok(resource) => (0, monitor.size, resource.unwrap_or_default()),
                        Err(e) => (e.code(), current, String::new()),
                    },
                    Err(e) => (e.code(), current, String::new()),
                };
                ("sizeChanged", args![monitor.target.as_str(), pkg, id, ret, w, h, resource])
            }
        };
        self.notify_requester(pkg, id, monitor.viewer, cmd, args);
        true
    }

    fn notify_requester(&mut self, pkg: &str, id: &str, viewer: Option<u32>, cmd: &str, args: Args) {
        match viewer {
            Some(pid) => self.notify_client(pid, cmd, args),
            None => self.notify_viewers(pkg, id, cmd, args),
        }
    }

    /// Resize one of an instance's surfaces. Returns the (possibly new) resource id.
    pub fn resize_slot(&mut self, pkg: &str, id: &str, target: Target, size: (u32, u32)) -> WmResult<Option<String>> {
        let inst = self.instances.live_instance_mut(pkg, id)?;
        let name = SurfaceName {
            pkg,
            id,
            label: target.as_str(),
        };
        self.buffers.resize(inst.slot_mut(target), name, size.0, size.1)
    }

    /// Viewer `createDetail`
    pub fn open_gbar(&mut self, viewer: u32, pkg: &str, id: &str, pos: (f64, f64)) -> WmResult<()> {
        let inst = self.instances.live_instance(pkg, id)?;
        inst.ensure_active()?;
        inst.check_owner(viewer)?;
        if matches!(inst.gbar_state, GbarState::Open | GbarState::Opening) {
            return Err(ErrorCode::Already);
        }
        let size = inst.gbar.size();
        let timeout = self.tunables.gbar_timeout;

        let timer = self.arm_monitor(pkg, id, MonitorKind::Open, Target::Gbar, Some(viewer), size, timeout)?;
        if let Some(inst) = self.instances.instance_mut(pkg, id) {
            inst.gbar_state = GbarState::Opening;
            inst.gbar_pos = pos;
        }

        let (p, i) = (pkg.to_string(), id.to_string());
        let sent = self.request_slave(
            pkg,
            id,
            "gbar_show",
            args![pkg, id, size.0, size.1, pos.0, pos.1],
            Box::new(move |m: &mut Master, res| {
                if let Err(e) = res.and_then(|a| ErrorCode::check(a.ret())) {
                    m.complete_monitor(&p, &i, timer, Err(e));
                }
            }),
        );
        if let Err(e) = sent {
            self.complete_monitor(pkg, id, timer, Err(e));
        }
        Ok(())
    }

    /// Viewer `destroyDetail`
    pub fn close_gbar(&mut self, viewer: u32, pkg: &str, id: &str) -> WmResult<()> {
        let inst = self.instances.live_instance(pkg, id)?;
        inst.check_owner(viewer)?;
        if matches!(inst.gbar_state, GbarState::Closed | GbarState::Closing) {
            return Err(ErrorCode::Already);
        }
        let size = inst.gbar.size();
        let timeout = self.tunables.gbar_timeout;

        let timer = self.arm_monitor(pkg, id, MonitorKind::Close, Target::Gbar, Some(viewer), size, timeout)?;
        if let Some(inst) = self.instances.instance_mut(pkg, id) {
            inst.gbar_state = GbarState::Closing;
        }

        let (p, i) = (pkg.to_string(), id.to_string());
        let sent = self.request_slave(
            pkg,
            id,
            "gbar_hide",
            args![pkg, id],
            Box::new(move |m: &mut Master, res| {
                let result = res.and_then(|a| ErrorCode::check(a.ret())).map(|_| ());
                m.complete_monitor(&p, &i, timer, result);
            }),
        );
        if let Err(e) = sent {
            self.complete_monitor(pkg, id, timer, Err(e));
        }
        Ok(())
    }

    /// The worker produced detail-view content; completes a pending open
    pub fn gbar_content_arrived(&mut self, pkg: &str, id: &str) {
        let pending = self
            .instances
            .find_instance(pkg, id)
            .and_then(|i| i.monitor.as_ref())
            .filter(|m| m.kind == MonitorKind::Open)
            .map(|m| m.timer);
        if let Some(timer) = pending {
            self.complete_monitor(pkg, id, timer, Ok(()));
        }
    }

    /// Viewer `resize`: ask the worker, resize the surface once it agrees
    pub fn resize_instance(&mut self, viewer: Option<u32>, pkg: &str, id: &str, size: (u32, u32)) -> WmResult<()> {
        if size.0 == 0 || size.1 == 0 {
            return Err(ErrorCode::InvalidParameter);
        }
        let inst = self.instances.live_instance(pkg, id)?;
        inst.ensure_active()?;
        if let Some(viewer) = viewer {
            inst.check_owner(viewer)?;
        }
        let timeout = self.config.monitor.resize_timeout();

        let timer = self.arm_monitor(pkg, id, MonitorKind::Resize, Target::Dbox, viewer, size, timeout)?;
        let (p, i) = (pkg.to_string(), id.to_string());
        let sent = self.request_slave(
            pkg,
            id,
            "resize",
            args![pkg, id, size.0, size.1],
            Box::new(move |m: &mut Master, res| {
                let result = res.and_then(|a| ErrorCode::check(a.ret())).map(|_| ());
                m.complete_monitor(&p, &i, timer, result);
            }),
        );
        if let Err(e) = sent {
            self.complete_monitor(pkg, id, timer, Err(e));
        }
        Ok(())
    }
}
