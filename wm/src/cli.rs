//! CLI command definitions and subcommands

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// widgetmaster - widget hosting master
#[derive(Parser)]
#[command(
    name = "wm",
    about = "Brokers widget instances between viewer and worker processes",
    version,
    after_help = "Logs are written to: ~/.local/share/widgetmaster/logs/wm.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Manage the background master
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// List known packages
    PkgList,

    /// List instances, optionally of one package
    InstList {
        /// Package name
        pkg: Option<String>,
    },

    /// List workers
    SlaveList,

    /// Remove or fault a package or instance
    PkgCtrl {
        #[arg(value_enum)]
        op: PkgOp,

        /// Package name
        pkg: String,

        /// Instance id (rminst, faultinst)
        id: Option<String>,
    },

    /// Read or change a runtime tunable (network, gbar-timeout)
    MasterCtrl {
        #[arg(value_enum)]
        op: CtrlOp,

        key: String,

        value: Option<String>,
    },

    /// Internal: Run as daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,
}

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the master in the background
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running master
    Stop,

    /// Show master status
    Status,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PkgOp {
    Rmpack,
    Rminst,
    Faultinst,
}

impl PkgOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rmpack => "rmpack",
            Self::Rminst => "rminst",
            Self::Faultinst => "faultinst",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CtrlOp {
    Get,
    Set,
}

impl CtrlOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
        }
    }
}

/// Where `wm` writes its log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("widgetmaster")
        .join("logs")
        .join("wm.log")
}
