//! Unix socket plumbing shared by the master and its command-line tools

mod client;
mod listener;

pub use client::{DebugClient, parse_listing};
pub use listener::{cleanup_socket, create_listener_at};
