//! Render surfaces and detail-view monitors
//!
//! Each instance has a primary (`dbox`) and a detail (`gbar`) slot plus a bounded
//! set of extra slots. Slots point into the broker's handle arena; viewers reference
//! handles independently of the worker's acquire/release cycle.

mod broker;
mod monitor;

pub use broker::{BufferBroker, BufferHandle, BufferSlot, HandleKey, SurfaceName};
pub use monitor::{Monitor, MonitorKind};
