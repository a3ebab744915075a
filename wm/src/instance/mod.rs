//! Package and instance tables
//!
//! A package is bound to at most one worker; every instance of the package lives on
//! that worker. Operations that cascade into workers, buffers or viewers
//! (destroy, delete-by-worker, delete-by-viewer) are driven by the master.

mod manager;
mod model;
mod package;

pub use manager::{InstanceKey, InstanceManager};
pub use model::{GbarState, Instance, InstanceState, InstanceSummary, NewInstance, PinUp, instance_id};
pub use package::{FaultInfo, Package, PackageSummary};
