//! Instance, viewer and worker lifecycles
//!
//! Everything that cascades across registries lives here: binding packages to
//! workers, asking workers to create instances, and unwinding instances when their
//! viewer or worker goes away.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{Master, Peer};
use crate::args;
use crate::buffer::SurfaceName;
use crate::error::{ErrorCode, WmResult};
use crate::instance::{GbarState, InstanceKey, InstanceState, NewInstance};
use crate::protocol::Args;
use crate::queue::{Command, InFlight};
use crate::slave::SlaveState;
use crate::subscribers::HookResult;
use crate::timer::{TimerEvent, TimerId};

/// Why instances are being removed from a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// The worker crashed or stalled; unowned instances are recreated
    Fault,
    /// The worker is being torn down on purpose
    Teardown,
}

impl Master {
    /// Create (or find) an instance and ask its worker to load it.
    ///
    /// Returns as soon as the request is queued; the outcome reaches viewers as a
    /// `created` or `deleted` notification.
    pub fn create_instance(&mut self, req: &NewInstance) -> WmResult<InstanceKey> {
        let (key, created) = self.instances.create_instance(req)?;
        if !created {
            return Ok(key);
        }
        if let Err(e) = self.bind_package(&key.0) {
            warn!(pkg = %key.0, id = %key.1, error = %e, "No worker available for instance");
            self.instances.remove_instance(&key.0, &key.1);
            return Err(e);
        }
        self.request_create(&key);
        Ok(key)
    }

    /// Bind a package to a worker, creating and launching one if needed
    pub(crate) fn bind_package(&mut self, pkg: &str) -> WmResult<String> {
        let package = self.instances.find_package(pkg).ok_or(ErrorCode::NotExist)?;
        if let Some(name) = package.slave.as_deref()
            && self.slaves.find_by_name(name).is_some()
        {
            return Ok(name.to_string());
        }
        let secured = package.info.secured;
        let abi = package.info.abi.clone();

        let name = if secured {
            pkg.to_string()
        } else {
            let max_load = self.slaves.max_load();
            match self.slaves.find_usable(&abi, max_load) {
                Some(name) => name,
                None => self.slaves.generate_name(),
            }
        };
        debug!(%pkg, slave = %name, secured, "bind_package: selected worker");

        self.slaves.create(&name, secured, &abi);
        self.slaves.ref_slave(&name)?;
        if let Some(slave) = self.slaves.get_mut(&name)
            && let Some(timer) = slave.idle_timer.take()
        {
            self.timers.cancel(timer);
        }
        if let Err(e) = self.slaves.launch(&name) {
            warn!(slave = %name, error = %e, "Worker launch failed");
            if let Ok(0) = self.slaves.unref_slave(&name) {
                self.arm_idle_timer(&name);
            }
            return Err(e);
        }

        if let Some(package) = self.instances.package_mut(pkg) {
            package.slave = Some(name.clone());
        }
        info!(%pkg, slave = %name, "Package bound to worker");
        Ok(name)
    }

    /// Drop a package's worker binding and its reference on the worker
    pub(crate) fn unbind_package(&mut self, pkg: &str) {
        let Some(name) = self.instances.package_mut(pkg).and_then(|p| p.slave.take()) else {
            return;
        };
        debug!(%pkg, slave = %name, "unbind_package: called");
        match self.slaves.unref_slave(&name) {
            Ok(0) => self.arm_idle_timer(&name),
            Ok(_) => {}
            Err(e) => debug!(%pkg, slave = %name, error = %e, "unbind_package: worker already gone"),
        }
    }

    fn arm_idle_timer(&mut self, name: &str) {
        let timeout = self.config.slave.idle_timeout();
        let Some(slave) = self.slaves.get_mut(name) else {
            return;
        };
        if let Some(old) = slave.idle_timer.take() {
            self.timers.cancel(old);
        }
        slave.idle_timer = Some(self.timers.after(
            timeout,
            TimerEvent::SlaveIdle {
                slave: name.to_string(),
            },
        ));
    }

    pub(crate) fn arm_ping_timer(&mut self, name: &str) {
        let Some(timeout) = self.config.slave.ping_timeout() else {
            return;
        };
        let Some(slave) = self.slaves.get_mut(name) else {
            return;
        };
        if let Some(old) = slave.ping_timer.take() {
            self.timers.cancel(old);
        }
        slave.ping_timer = Some(self.timers.after(
            timeout,
            TimerEvent::PingTimeout {
                slave: name.to_string(),
            },
        ));
    }

    pub(crate) fn reap_idle_slave(&mut self, name: &str, timer: TimerId) {
        let Some(slave) = self.slaves.get_mut(name) else {
            return;
        };
        if slave.idle_timer != Some(timer) {
            return;
        }
        slave.idle_timer = None;
        if slave.refcnt() > 0 {
            return;
        }
        info!(slave = %name, "Reaping idle worker");
        self.destroy_slave(name);
    }

    /// Push a `new` request for an instance to its package's worker
    pub(crate) fn request_create(&mut self, key: &InstanceKey) {
        let (pkg, id) = (key.0.as_str(), key.1.as_str());
        let Some(slave) = self.instances.slave_of(pkg).map(str::to_string) else {
            return;
        };
        let Some((timeout, abi)) = self
            .instances
            .find_package(pkg)
            .map(|p| (p.info.timeout, p.info.abi.clone()))
        else {
            return;
        };
        let Some(inst) = self.instances.instance_mut(pkg, id) else {
            return;
        };
        inst.attempt += 1;
        let attempt = inst.attempt;
        let (w, h) = inst.dbox.desired;
        let args = args![
            pkg,
            id,
            inst.content.as_str(),
            timeout,
            inst.period,
            inst.cluster.as_str(),
            inst.category.as_str(),
            i32::from(inst.pinup.supported),
            w,
            h,
            abi
        ];
        debug!(%pkg, %id, %slave, attempt, "request_create: queued");

        let key = key.clone();
        let cmd = Command::request("new", args, Box::new(move |m: &mut Master, res| m.on_created(&key, attempt, res)))
            .for_instance(pkg, Some(id));
        self.push_command(Peer::Slave(slave), cmd);
    }

    /// Worker answered `new` with `(ret, need_create, priority)`
    fn on_created(&mut self, key: &InstanceKey, attempt: u64, res: WmResult<Args>) {
        let (pkg, id) = (key.0.as_str(), key.1.as_str());
        let Some(inst) = self.instances.instance_mut(pkg, id) else {
            debug!(%pkg, %id, "on_created: instance gone");
            return;
        };
        if inst.attempt != attempt || inst.state != InstanceState::Created {
            debug!(%pkg, %id, attempt, current = inst.attempt, "on_created: stale reply");
            return;
        }

        match res.and_then(|args| ErrorCode::check(args.ret()).map(|_| args)) {
            Err(e) => {
                warn!(%pkg, %id, error = %e, "Worker rejected instance");
                self.notify_viewers(pkg, id, "deleted", args![pkg, id, e.code()]);
                self.destroy_instance(key);
            }
            Ok(args) => {
                if let Ok(priority) = args.f64(2) {
                    inst.priority = priority;
                }
                if args.i32(1).unwrap_or(0) != 0 {
                    debug!(%pkg, %id, "on_created: waiting for first update");
                    return;
                }
                self.activate_instance(key);
            }
        }
    }

    /// The worker has the instance live: allocate its primary surface and announce it
    pub(crate) fn activate_instance(&mut self, key: &InstanceKey) {
        let (pkg, id) = (key.0.as_str(), key.1.as_str());
        let Some(inst) = self.instances.instance_mut(pkg, id) else {
            return;
        };
        if inst.activate().is_err() {
            return;
        }
        let name = SurfaceName {
            pkg,
            id,
            label: "dbox",
        };
        let resource = match self.buffers.acquire(&mut inst.dbox, name, None) {
            Ok(resource) => resource,
            Err(e) => {
                warn!(%pkg, %id, error = %e, "Primary surface unavailable");
                String::new()
            }
        };
        let (w, h) = inst.dbox.size();
        let args = args![
            0,
            pkg,
            id,
            inst.timestamp,
            inst.content.as_str(),
            inst.cluster.as_str(),
            inst.category.as_str(),
            inst.period,
            w,
            h,
            inst.priority,
            i32::from(inst.pinup.supported),
            resource
        ];
        info!(%pkg, %id, width = w, height = h, "Instance active");
        self.notify_viewers(pkg, id, "created", args);
    }

    /// Remove an instance: cancel its monitor, tear down surfaces, drop input focus,
    /// and release the package's worker when it was the last instance.
    pub fn destroy_instance(&mut self, key: &InstanceKey) {
        let (pkg, id) = (key.0.as_str(), key.1.as_str());
        let Some(inst) = self.instances.instance_mut(pkg, id) else {
            return;
        };
        inst.state = InstanceState::Destroyed;
        if let Some(timer) = inst.monitor.as_ref().map(|m| m.timer) {
            self.complete_monitor(pkg, id, timer, Err(ErrorCode::Canceled));
        }

        let Some(mut inst) = self.instances.remove_instance(pkg, id) else {
            return;
        };
        self.buffers.teardown(&mut inst.dbox);
        self.buffers.teardown(&mut inst.gbar);
        for slot in inst.extra.values_mut() {
            self.buffers.teardown(slot);
        }
        self.input.unregister_instance(pkg, id);
        info!(%pkg, %id, "Instance destroyed");

        if self.instances.instances_of(pkg).is_empty() {
            self.unbind_package(pkg);
        }
    }

    /// Reset an instance whose worker died and ask a replacement worker for it
    fn recreate_instance(&mut self, key: &InstanceKey) {
        let (pkg, id) = (key.0.as_str(), key.1.as_str());
        if self.instances.is_fault(pkg) {
            debug!(%pkg, %id, "recreate_instance: package faulted, deleting instead");
            self.notify_viewers(pkg, id, "deleted", args![pkg, id, ErrorCode::Fault.code()]);
            self.destroy_instance(key);
            return;
        }
        if let Some(timer) = self
            .instances
            .find_instance(pkg, id)
            .and_then(|i| i.monitor.as_ref())
            .map(|m| m.timer)
        {
            self.complete_monitor(pkg, id, timer, Err(ErrorCode::Fault));
        }
        let Some(inst) = self.instances.instance_mut(pkg, id) else {
            return;
        };
        inst.state = InstanceState::Created;
        inst.gbar_state = GbarState::Closed;
        inst.updating.clear();
        self.buffers.teardown(&mut inst.dbox);
        self.buffers.teardown(&mut inst.gbar);
        for slot in inst.extra.values_mut() {
            self.buffers.teardown(slot);
        }
        inst.extra.clear();
        self.input.unregister_instance(pkg, id);

        match self.bind_package(pkg) {
            Ok(slave) => {
                info!(%pkg, %id, %slave, "Recreating unowned instance");
                self.request_create(key);
            }
            Err(e) => {
                warn!(%pkg, %id, error = %e, "Cannot recreate instance");
                self.notify_viewers(pkg, id, "deleted", args![pkg, id, e.code()]);
                self.destroy_instance(key);
            }
        }
    }

    /// Unwind every instance bound to a worker.
    ///
    /// Owned instances are deleted (viewers get `deleted`); on a fault, unowned ones
    /// are recreated on a replacement worker instead.
    pub fn delete_by_slave(&mut self, name: &str, reason: DeleteReason) {
        let packages = self.instances.packages_of_slave(name);
        debug!(slave = %name, ?reason, packages = packages.len(), "delete_by_slave: called");
        let code = match reason {
            DeleteReason::Fault => ErrorCode::Fault.code(),
            DeleteReason::Teardown => 0,
        };

        let mut recreate = Vec::new();
        for pkg in packages {
            for key in self.instances.instances_of(&pkg) {
                let owned = self
                    .instances
                    .find_instance(&key.0, &key.1)
                    .is_some_and(|i| i.owner.is_some());
                if reason == DeleteReason::Fault && !owned {
                    recreate.push(key);
                    continue;
                }
                self.notify_viewers(&key.0, &key.1, "deleted", args![key.0.as_str(), key.1.as_str(), code]);
                self.destroy_instance(&key);
            }
            self.unbind_package(&pkg);
        }

        for key in recreate {
            self.recreate_instance(&key);
        }
    }

    /// Unwind every instance owned by a viewer that is going away
    pub fn delete_by_viewer(&mut self, pid: u32) {
        let owned = self.instances.instances_owned_by(pid);
        debug!(pid, instances = owned.len(), "delete_by_viewer: called");
        for key in owned {
            let (pkg, id) = (key.0.as_str(), key.1.as_str());
            if let Some(slave) = self.instances.slave_of(pkg).map(str::to_string) {
                let cmd = Command::notify("delete", args![pkg, id, "viewer"]).for_instance(pkg, Some(id));
                self.push_command(Peer::Slave(slave), cmd);
            }
            self.notify_viewers(pkg, id, "deleted", args![pkg, id, 0]);
            self.destroy_instance(&key);
        }
    }

    /// Viewer `acquire` handshake
    pub fn create_client(&mut self, pid: u32, conn: crate::connection::ConnId) -> WmResult<()> {
        self.clients.create(pid, conn)?;
        self.update_pause_state();
        Ok(())
    }

    /// Viewer `release` or disconnect
    pub fn destroy_client(&mut self, pid: u32) {
        let Some(mut client) = self.clients.remove(pid) else {
            return;
        };
        for resource in client.handles.drain(..) {
            if let Err(e) = self.buffers.unref_handle(&resource) {
                debug!(pid, %resource, error = %e, "destroy_client: handle already gone");
            }
        }
        let (flight, pending) = client.queue.clear();
        self.fail_commands(flight, pending, ErrorCode::Canceled);
        self.delete_by_viewer(pid);
        self.update_pause_state();
    }

    /// Worker `hello`: attach the connection and start delivering its queue
    pub fn attach_slave(
        &mut self,
        conn: crate::connection::ConnId,
        pid: Option<u32>,
        name: &str,
        secured: bool,
        acceleration: &str,
        abi: &str,
    ) -> WmResult<()> {
        if let Some(existing) = self.slaves.find_by_name(name)
            && existing.is_activated()
            && existing.conn != Some(conn)
        {
            warn!(slave = %name, "Duplicate hello for a connected worker");
            return Err(ErrorCode::Exist);
        }
        let paused = self.all_paused();
        let slave = self.slaves.create(name, secured, abi);
        slave.conn = Some(conn);
        if pid.is_some() {
            slave.pid = pid;
        }
        slave.acceleration = Some(acceleration.to_string());
        slave.activated_at = Some(Utc::now());
        slave.calls.clear();
        slave.paused = paused;
        slave.state = if paused { SlaveState::Paused } else { SlaveState::Resumed };
        if paused {
            let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;
            slave.queue.push_front(Command::notify("pause", args![timestamp]));
        }
        let unreferenced = slave.refcnt() == 0;
        info!(slave = %name, ?pid, conn, paused, "Worker attached");

        self.arm_ping_timer(name);
        if unreferenced {
            self.arm_idle_timer(name);
        }
        self.drain(&Peer::Slave(name.to_string()));
        Ok(())
    }

    /// Explicit teardown: delete its instances, kill the process, fail its queue
    pub fn destroy_slave(&mut self, name: &str) {
        if self.slaves.find_by_name(name).is_none() {
            return;
        }
        info!(slave = %name, "Destroying worker");
        self.delete_by_slave(name, DeleteReason::Teardown);
        self.notify_slave_hooks(name);
        if self.slaves.find_by_name(name).is_some_and(|s| s.is_running())
            && let Err(e) = self.slaves.kill(name)
        {
            debug!(slave = %name, error = %e, "destroy_slave: kill failed");
        }
        let Some(mut slave) = self.slaves.remove(name) else {
            return;
        };
        for timer in [slave.ping_timer.take(), slave.idle_timer.take()].into_iter().flatten() {
            self.timers.cancel(timer);
        }
        if let Some(conn) = slave.conn.take() {
            self.conns.remove(conn);
        }
        let (flight, pending) = slave.queue.clear();
        self.fail_commands(flight, pending, ErrorCode::Fault);
    }

    /// Resolve continuations of commands that will never be delivered
    pub(crate) fn fail_commands(&mut self, flight: Option<InFlight>, pending: Vec<Command>, err: ErrorCode) {
        if let Some(flight) = flight {
            if let Some(timer) = flight.timer {
                self.timers.cancel(timer);
            }
            debug!(cmd = %flight.cmd, seq = flight.seq, %err, "fail_commands: in-flight");
            (flight.reply)(self, Err(err));
        }
        for cmd in pending {
            if let Some(reply) = cmd.reply {
                reply(self, Err(err));
            }
        }
    }

    /// Run every worker-deactivation hook; hooks returning `Keep` stay registered
    pub(crate) fn notify_slave_hooks(&mut self, name: &str) {
        let hooks = self.slave_hooks.take_all();
        debug!(slave = %name, hooks = hooks.len(), "notify_slave_hooks: called");
        let mut kept = Vec::with_capacity(hooks.len());
        for (token, mut hook) in hooks {
            if hook(self, name) == HookResult::Keep {
                kept.push((token, hook));
            }
        }
        self.slave_hooks.restore(kept);
    }
}
