//! Worker (slave) processes
//!
//! The registry tracks every worker by name along with its connection, reference
//! count, security tier and outgoing command queue. Operations that need to unwind
//! instances (destroy, pause propagation) live on [`Master`](crate::master::Master).

mod launcher;
mod registry;

pub use launcher::{ExternalLauncher, LaunchLog, ProcessLauncher, SlaveLauncher};
pub use registry::{CallRecord, SecurityTier, Slave, SlaveRegistry, SlaveState, SlaveSummary};
