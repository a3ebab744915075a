//! Worker failure handling
//!
//! A worker is lost when its connection drops, its process exits, or it stalls
//! (missed ping or reply deadline). Loss faults the packages it was executing,
//! fails its queue, wakes deactivation hooks and self-heals unowned instances.

use tracing::{debug, info, warn};

use crate::error::{ErrorCode, WmResult};
use crate::master::{DeleteReason, Master};
use crate::slave::SlaveState;

impl Master {
    /// A worker stopped responding: kill it and run the loss path
    pub fn slave_stalled(&mut self, name: &str, reason: &str) {
        warn!(slave = %name, %reason, "Worker stalled, killing");
        if let Err(e) = self.slaves.kill(name) {
            debug!(slave = %name, error = %e, "slave_stalled: kill failed");
        }
        self.slave_lost(name, reason);
    }

    /// Run the loss path once per process lifetime
    pub fn slave_lost(&mut self, name: &str, reason: &str) {
        let max_fault_count = self.config.slave.max_fault_count;
        let Some(slave) = self.slaves.get_mut(name) else {
            return;
        };
        if !slave.is_running() {
            debug!(slave = %name, %reason, state = %slave.state, "slave_lost: already handled");
            return;
        }

        slave.state = SlaveState::Terminated;
        slave.fault_count += 1;
        let fault_count = slave.fault_count;
        let conn = slave.conn.take();
        let calls = std::mem::take(&mut slave.calls);
        let timers = [slave.ping_timer.take(), slave.idle_timer.take()];
        let (flight, pending) = slave.queue.clear();
        warn!(slave = %name, %reason, fault_count, open_calls = calls.len(), "Worker lost");

        for timer in timers.into_iter().flatten() {
            self.timers.cancel(timer);
        }
        if let Some(flight) = &flight
            && let Some(timer) = flight.timer
        {
            self.timers.cancel(timer);
        }
        if let Some(conn) = conn {
            self.conns.remove(conn);
        }

        for call in &calls {
            let file = self
                .instances
                .find_package(&call.pkg)
                .and_then(|p| p.info.script_path.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| call.pkg.clone());
            if let Err(e) = self.instances.set_fault(&call.pkg, &file, &call.func) {
                debug!(pkg = %call.pkg, error = %e, "slave_lost: package unknown");
            }
        }

        let repeated = fault_count >= max_fault_count;
        if repeated {
            warn!(slave = %name, fault_count, "Worker faulted repeatedly, disabling its packages");
            for pkg in self.instances.packages_of_slave(name) {
                if !self.instances.is_fault(&pkg)
                    && let Err(e) = self.instances.set_fault(&pkg, &pkg, "repeated worker fault")
                {
                    warn!(%pkg, error = %e, "slave_lost: cannot fault package");
                }
            }
        }

        self.notify_slave_hooks(name);
        self.delete_by_slave(name, DeleteReason::Fault);
        self.fail_commands(flight, pending, ErrorCode::Fault);

        if repeated {
            self.destroy_slave(name);
        }
    }

    /// Debug/viewer `faultinst` and worker `faulted`: fault a package and drop its instances
    pub fn fault_package(&mut self, pkg: &str, file: &str, func: &str) -> WmResult<()> {
        self.instances.set_fault(pkg, file, func)?;
        let keys = self.instances.instances_of(pkg);
        info!(%pkg, instances = keys.len(), "Deleting instances of faulted package");
        for key in keys {
            self.notify_viewers(
                &key.0,
                &key.1,
                "deleted",
                crate::args![key.0.as_str(), key.1.as_str(), ErrorCode::Fault.code()],
            );
            self.destroy_instance(&key);
        }
        Ok(())
    }

    /// Viewer `activatePackage`: clear the fault so the package may run again
    pub fn activate_package(&mut self, pkg: &str) -> WmResult<()> {
        self.instances.clear_fault(pkg)
    }
}
