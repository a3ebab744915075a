//! Viewer (client) processes
//!
//! Mirrors the worker registry without load balancing or security tiers. The paused
//! counter feeds the "are all viewers paused?" aggregate that throttles workers.

mod registry;

pub use registry::{Client, ClientRegistry, GroupFilter};
