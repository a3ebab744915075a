//! widgetmaster - widget hosting master
//!
//! The master sits between viewer processes (which display widgets) and worker
//! processes (which render them). It owns the package and instance tables, brokers
//! render buffers, queues commands per peer, and recovers when workers crash.
//!
//! # Modules
//!
//! - [`master`] - single-task reactor owning all state
//! - [`dispatch`] - verb tables for the slave, client, service and debug channels
//! - [`slave`], [`client`] - worker and viewer registries
//! - [`instance`] - packages and widget instances
//! - [`buffer`] - render surfaces and detail-view monitors
//! - [`fault`] - crash attribution and recovery
//! - [`server`] - listeners and per-connection tasks
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod buffer;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod input;
pub mod instance;
pub mod ipc;
pub mod master;
pub mod protocol;
pub mod queue;
pub mod render;
pub mod server;
pub mod slave;
pub mod store;
pub mod subscribers;
pub mod timer;

pub use config::Config;
pub use error::{ErrorCode, WmResult};
pub use master::{Master, ReactorEvent};
