//! Widget packages

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::PackageInfo;

/// Most recent recorded failure of a package
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultInfo {
    pub at: DateTime<Utc>,
    pub file: String,
    pub func: String,
}

/// A widget package and its live instances
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub info: PackageInfo,
    /// False when the store had no metadata and fallback defaults are in use
    pub from_store: bool,
    pub fault: Option<FaultInfo>,
    pub fault_count: u32,
    /// Worker hosting every instance of this package
    pub slave: Option<String>,
    /// Instance ids in creation order
    pub instances: Vec<String>,
}

impl Package {
    pub fn new(name: &str, info: PackageInfo, from_store: bool) -> Self {
        Self {
            name: name.to_string(),
            info,
            from_store,
            fault: None,
            fault_count: 0,
            slave: None,
            instances: Vec::new(),
        }
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }
}

/// Summary row for the debug channel
#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub name: String,
    pub slave: Option<String>,
    pub abi: String,
    pub secured: bool,
    pub instances: usize,
    pub fault_count: u32,
    pub fault: Option<FaultInfo>,
}

impl From<&Package> for PackageSummary {
    fn from(p: &Package) -> Self {
        Self {
            name: p.name.clone(),
            slave: p.slave.clone(),
            abi: p.info.abi.clone(),
            secured: p.info.secured,
            instances: p.instances.len(),
            fault_count: p.fault_count,
            fault: p.fault.clone(),
        }
    }
}
