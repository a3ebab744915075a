//! Package and instance tables
//!
//! Pure bookkeeping: lookups, idempotent creation, fault records. Anything that also
//! touches workers, buffers or viewers is done by the master on top of these tables.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::model::{Instance, NewInstance, instance_id};
use super::package::{FaultInfo, Package};
use crate::error::{ErrorCode, WmResult};
use crate::store::{PackageInfo, PackageStore, StoreError};

/// Key of an instance: (package name, instance id)
pub type InstanceKey = (String, String);

/// The widget catalog and its live instances
pub struct InstanceManager {
    store: Box<dyn PackageStore>,
    packages: BTreeMap<String, Package>,
    instances: BTreeMap<InstanceKey, Instance>,
}

impl InstanceManager {
    pub fn new(store: Box<dyn PackageStore>) -> Self {
        Self {
            store,
            packages: BTreeMap::new(),
            instances: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &dyn PackageStore {
        self.store.as_ref()
    }

    pub fn find_package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn package_mut(&mut self, name: &str) -> Option<&mut Package> {
        self.packages.get_mut(name)
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    /// Get or create a package, pulling defaults from the store.
    ///
    /// Missing or unreadable metadata falls back to conservative defaults.
    pub fn create_package(&mut self, name: &str) -> WmResult<&mut Package> {
        if name.is_empty() {
            return Err(ErrorCode::InvalidParameter);
        }
        if !self.packages.contains_key(name) {
            let (info, from_store) = match self.store.load(name) {
                Ok(info) => (info, true),
                Err(StoreError::NotFound(_)) => {
                    debug!(%name, "create_package: no metadata, using fallback defaults");
                    (PackageInfo::fallback(name), false)
                }
                Err(e) => {
                    warn!(%name, error = %e, "create_package: metadata unusable, using fallback defaults");
                    (PackageInfo::fallback(name), false)
                }
            };
            info!(%name, from_store, "Package created");
            self.packages.insert(name.to_string(), Package::new(name, info, from_store));
        }
        self.packages.get_mut(name).ok_or(ErrorCode::NotExist)
    }

    /// Drop a package record. Fails while it still has instances.
    pub fn remove_package(&mut self, name: &str) -> WmResult<Package> {
        let pkg = self.packages.get(name).ok_or(ErrorCode::NotExist)?;
        if !pkg.instances.is_empty() {
            return Err(ErrorCode::Busy);
        }
        self.packages.remove(name).ok_or(ErrorCode::NotExist)
    }

    pub fn find_instance(&self, pkg: &str, id: &str) -> Option<&Instance> {
        self.instances.get(&(pkg.to_string(), id.to_string()))
    }

    pub fn instance_mut(&mut self, pkg: &str, id: &str) -> Option<&mut Instance> {
        self.instances.get_mut(&(pkg.to_string(), id.to_string()))
    }

    /// Live instance lookup used by every handler: missing or destroyed is `NotExist`
    pub fn live_instance(&self, pkg: &str, id: &str) -> WmResult<&Instance> {
        let inst = self.find_instance(pkg, id).ok_or(ErrorCode::NotExist)?;
        inst.ensure_alive()?;
        Ok(inst)
    }

    pub fn live_instance_mut(&mut self, pkg: &str, id: &str) -> WmResult<&mut Instance> {
        let inst = self.instance_mut(pkg, id).ok_or(ErrorCode::NotExist)?;
        inst.ensure_alive()?;
        Ok(inst)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Create an instance, or return the existing one for the same request.
    ///
    /// Returns the key and whether a new instance was made.
    pub fn create_instance(&mut self, req: &NewInstance) -> WmResult<(InstanceKey, bool)> {
        debug!(pkg = %req.pkg, owner = ?req.owner, timestamp = req.timestamp, "create_instance: called");
        if !req.period.is_finite() || req.period < 0.0 || !req.timestamp.is_finite() {
            return Err(ErrorCode::InvalidParameter);
        }
        if self.create_package(&req.pkg)?.is_fault() {
            warn!(pkg = %req.pkg, "create_instance: package is faulted");
            return Err(ErrorCode::Fault);
        }

        let id = instance_id(req.owner, req.timestamp);
        let key = (req.pkg.clone(), id.clone());
        if self.instances.contains_key(&key) {
            debug!(pkg = %req.pkg, %id, "create_instance: already exists");
            return Ok((key, false));
        }

        let pkg = self.packages.get_mut(&req.pkg).ok_or(ErrorCode::NotExist)?;
        let gbar_size = (pkg.info.gbar_width, pkg.info.gbar_height);
        let pinup_supported = pkg.info.pinup;
        let mut req = req.clone();
        if req.width == 0 || req.height == 0 {
            req.width = pkg.info.width;
            req.height = pkg.info.height;
        }
        pkg.instances.push(id.clone());

        let mut inst = Instance::new(&req, id.clone(), gbar_size);
        inst.pinup.supported = pinup_supported;
        self.instances.insert(key.clone(), inst);
        info!(pkg = %req.pkg, %id, "Instance created");
        Ok((key, true))
    }

    /// Remove an instance from both tables
    pub fn remove_instance(&mut self, pkg: &str, id: &str) -> Option<Instance> {
        let inst = self.instances.remove(&(pkg.to_string(), id.to_string()))?;
        if let Some(p) = self.packages.get_mut(pkg) {
            p.instances.retain(|i| i != id);
        }
        Some(inst)
    }

    /// Instance keys of one package, in creation order
    pub fn instances_of(&self, pkg: &str) -> Vec<InstanceKey> {
        self.packages
            .get(pkg)
            .map(|p| p.instances.iter().map(|id| (pkg.to_string(), id.clone())).collect())
            .unwrap_or_default()
    }

    /// Instance keys owned by one viewer
    pub fn instances_owned_by(&self, viewer: u32) -> Vec<InstanceKey> {
        self.instances
            .values()
            .filter(|i| i.owner == Some(viewer))
            .map(Instance::key)
            .collect()
    }

    /// Packages bound to a worker
    pub fn packages_of_slave(&self, slave: &str) -> Vec<String> {
        self.packages
            .values()
            .filter(|p| p.slave.as_deref() == Some(slave))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Worker hosting an instance's package
    pub fn slave_of(&self, pkg: &str) -> Option<&str> {
        self.packages.get(pkg).and_then(|p| p.slave.as_deref())
    }

    /// Record a failure: bumps the counter and replaces the previous record
    pub fn set_fault(&mut self, pkg: &str, file: &str, func: &str) -> WmResult<()> {
        let p = self.packages.get_mut(pkg).ok_or(ErrorCode::NotExist)?;
        p.fault_count += 1;
        p.fault = Some(FaultInfo {
            at: Utc::now(),
            file: file.to_string(),
            func: func.to_string(),
        });
        warn!(%pkg, %file, %func, fault_count = p.fault_count, "Package faulted");
        Ok(())
    }

    /// Clear the fault record. Fails with `InvalidState` if there is none.
    pub fn clear_fault(&mut self, pkg: &str) -> WmResult<()> {
        let p = self.packages.get_mut(pkg).ok_or(ErrorCode::NotExist)?;
        if p.fault.take().is_none() {
            return Err(ErrorCode::InvalidState);
        }
        info!(%pkg, "Package fault cleared");
        Ok(())
    }

    pub fn is_fault(&self, pkg: &str) -> bool {
        self.packages.get(pkg).is_some_and(Package::is_fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceState;
    use crate::store::MemoryPackageStore;

    fn manager() -> InstanceManager {
        let store = MemoryPackageStore::new().with(PackageInfo {
            width: 100,
            height: 50,
            gbar_width: 300,
            gbar_height: 400,
            pinup: true,
            ..PackageInfo::fallback("clock")
        });
        InstanceManager::new(Box::new(store))
    }

    fn req(owner: Option<u32>, ts: f64) -> NewInstance {
        NewInstance {
            owner,
            timestamp: ts,
            pkg: "clock".to_string(),
            content: String::new(),
            cluster: "home".to_string(),
            category: "time".to_string(),
            period: 60.0,
            width: 0,
            height: 0,
        }
    }

    #[test]
    fn test_create_package_fallback_defaults() {
        let mut mgr = manager();
        let pkg = mgr.create_package("unknown").unwrap();
        assert!(!pkg.from_store);
        assert_eq!(pkg.info, PackageInfo::fallback("unknown"));
        assert!(mgr.create_package("clock").unwrap().from_store);
        assert_eq!(mgr.create_package("").err(), Some(ErrorCode::InvalidParameter));
    }

    #[test]
    fn test_create_instance_is_idempotent() {
        let mut mgr = manager();
        let (key, created) = mgr.create_instance(&req(Some(1), 10.0)).unwrap();
        assert!(created);
        let (again, created) = mgr.create_instance(&req(Some(1), 10.0)).unwrap();
        assert!(!created);
        assert_eq!(key, again);
        assert_eq!(mgr.instances_of("clock").len(), 1);

        let inst = mgr.find_instance(&key.0, &key.1).unwrap();
        assert_eq!(inst.state, InstanceState::Created);
        assert_eq!(inst.dbox.size(), (100, 50), "zero size falls back to package default");
        assert_eq!(inst.gbar.size(), (300, 400));
        assert!(inst.pinup.supported);
    }

    #[test]
    fn test_create_instance_registers_package() {
        let mut mgr = manager();
        assert!(mgr.find_package("weather").is_none());
        let (key, created) = mgr.create_instance(&NewInstance {
            pkg: "weather".to_string(),
            width: 20,
            height: 10,
            ..req(None, 2.0)
        })
        .unwrap();
        assert!(created);
        let pkg = mgr.find_package("weather").unwrap();
        assert_eq!(pkg.instances, vec![key.1.clone()]);
        assert_eq!(mgr.find_instance(&key.0, &key.1).unwrap().dbox.size(), (20, 10));
    }

    #[test]
    fn test_create_instance_rejects_faulted_package() {
        let mut mgr = manager();
        mgr.create_package("clock").unwrap();
        mgr.set_fault("clock", "clock.so", "update").unwrap();
        assert_eq!(mgr.create_instance(&req(Some(1), 1.0)).err(), Some(ErrorCode::Fault));
    }

    #[test]
    fn test_create_instance_rejects_bad_period() {
        let mut mgr = manager();
        let mut r = req(None, 1.0);
        r.period = -1.0;
        assert_eq!(mgr.create_instance(&r).err(), Some(ErrorCode::InvalidParameter));
        r.period = f64::NAN;
        assert_eq!(mgr.create_instance(&r).err(), Some(ErrorCode::InvalidParameter));
    }

    #[test]
    fn test_fault_record_invariants() {
        let mut mgr = manager();
        mgr.create_package("clock").unwrap();
        assert!(!mgr.is_fault("clock"));
        assert_eq!(mgr.clear_fault("clock"), Err(ErrorCode::InvalidState));

        mgr.set_fault("clock", "a.so", "f1").unwrap();
        mgr.set_fault("clock", "b.so", "f2").unwrap();
        let pkg = mgr.find_package("clock").unwrap();
        assert!(mgr.is_fault("clock"));
        assert_eq!(pkg.fault_count, 2);
        assert_eq!(pkg.fault.as_ref().unwrap().func, "f2");

        mgr.clear_fault("clock").unwrap();
        assert!(!mgr.is_fault("clock"));
        assert_eq!(mgr.find_package("clock").unwrap().fault_count, 2);
        assert_eq!(mgr.set_fault("nope", "", ""), Err(ErrorCode::NotExist));
    }

    #[test]
    fn test_remove_instance_updates_package() {
        let mut mgr = manager();
        let (a, _) = mgr.create_instance(&req(Some(1), 1.0)).unwrap();
        let (b, _) = mgr.create_instance(&req(Some(2), 1.0)).unwrap();
        assert_eq!(mgr.remove_package("clock").err(), Some(ErrorCode::Busy));

        mgr.remove_instance(&a.0, &a.1).unwrap();
        assert_eq!(mgr.instances_of("clock"), vec![b.clone()]);
        assert_eq!(mgr.instances_owned_by(2), vec![b.clone()]);
        assert!(mgr.instances_owned_by(1).is_empty());

        mgr.remove_instance(&b.0, &b.1).unwrap();
        assert!(mgr.remove_package("clock").is_ok());
    }

    #[test]
    fn test_live_instance_rejects_destroyed() {
        let mut mgr = manager();
        let (key, _) = mgr.create_instance(&req(None, 1.0)).unwrap();
        mgr.instance_mut(&key.0, &key.1).unwrap().state = InstanceState::Destroyed;
        assert_eq!(mgr.live_instance(&key.0, &key.1).err(), Some(ErrorCode::NotExist));
        assert_eq!(mgr.live_instance("clock", "missing").err(), Some(ErrorCode::NotExist));
    }

    #[test]
    fn test_packages_of_slave() {
        let mut mgr = manager();
        mgr.create_package("clock").unwrap().slave = Some("slave.1".to_string());
        mgr.create_package("weather").unwrap().slave = Some("slave.2".to_string());
        assert_eq!(mgr.packages_of_slave("slave.1"), vec!["clock".to_string()]);
        assert_eq!(mgr.slave_of("weather"), Some("slave.2"));
    }
}
