//! Widget master configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (overridden by --log-level)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Listening sockets, one per channel
    pub sockets: SocketsConfig,

    /// Worker process settings
    pub slave: SlaveConfig,

    /// Detail-view and resize monitor timeouts
    pub monitor: MonitorConfig,

    /// Render surface settings
    pub buffer: BufferConfig,

    /// Package metadata store
    pub store: StoreConfig,

    /// Raw input device
    pub input: InputConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: widgetmaster.yml
        let local_config = PathBuf::from("widgetmaster.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/widgetmaster/widgetmaster.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("widgetmaster").join("widgetmaster.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = config_path.cloned().or_else(|| {
            let local = PathBuf::from("widgetmaster.yml");
            local.exists().then_some(local)
        })?;
        Self::load_from_file(path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn runtime_base() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("widgetmaster")
}

/// Socket paths for the four channels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketsConfig {
    /// Directory holding the sockets
    pub dir: PathBuf,

    pub slave: String,
    pub client: String,
    pub service: String,
    pub debug: String,
}

impl Default for SocketsConfig {
    fn default() -> Self {
        Self {
            dir: runtime_base(),
            slave: "slave.sock".to_string(),
            client: "client.sock".to_string(),
            service: "service.sock".to_string(),
            debug: "debug.sock".to_string(),
        }
    }
}

impl SocketsConfig {
    pub fn slave_path(&self) -> PathBuf {
        self.dir.join(&self.slave)
    }

    pub fn client_path(&self) -> PathBuf {
        self.dir.join(&self.client)
    }

    pub fn service_path(&self) -> PathBuf {
        self.dir.join(&self.service)
    }

    pub fn debug_path(&self) -> PathBuf {
        self.dir.join(&self.debug)
    }
}

/// Worker process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    /// Executable launched for each worker
    pub command: String,

    /// Extra arguments; the worker name and secured flag are appended
    pub args: Vec<String>,

    /// Maximum packages a shared worker may host
    #[serde(rename = "max-load")]
    pub max_load: u32,

    /// Faults tolerated before a worker is torn down for good
    #[serde(rename = "max-fault-count")]
    pub max_fault_count: u32,

    /// How long a queued command may wait for its reply
    #[serde(rename = "reply-timeout-ms")]
    pub reply_timeout_ms: u64,

    /// How long a worker may stay silent between pings (0 disables)
    #[serde(rename = "ping-timeout-ms")]
    pub ping_timeout_ms: u64,

    /// How long an unreferenced worker is kept alive
    #[serde(rename = "idle-timeout-ms")]
    pub idle_timeout_ms: u64,

    /// ABI assumed for packages that do not declare one
    #[serde(rename = "default-abi")]
    pub default_abi: String,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            command: "widget-provider".to_string(),
            args: Vec::new(),
            max_load: 30,
            max_fault_count: 3,
            reply_timeout_ms: 10_000,
            ping_timeout_ms: 240_000,
            idle_timeout_ms: 30_000,
            default_abi: "c".to_string(),
        }
    }
}

impl SlaveConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Option<Duration> {
        (self.ping_timeout_ms > 0).then(|| Duration::from_millis(self.ping_timeout_ms))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Monitor timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(rename = "gbar-timeout-ms")]
    pub gbar_timeout_ms: u64,

    #[serde(rename = "resize-timeout-ms")]
    pub resize_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            gbar_timeout_ms: 5_000,
            resize_timeout_ms: 5_000,
        }
    }
}

impl MonitorConfig {
    pub fn gbar_timeout(&self) -> Duration {
        Duration::from_millis(self.gbar_timeout_ms)
    }

    pub fn resize_timeout(&self) -> Duration {
        Duration::from_millis(self.resize_timeout_ms)
    }
}

/// Which surface backend hands out buffer handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferBackendKind {
    /// Surfaces are sized files in `buffer.dir`
    File,
    /// Surfaces only exist as bookkeeping (no backing storage)
    Memory,
}

/// Render surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub backend: BufferBackendKind,

    /// Directory for file-backed surfaces
    pub dir: PathBuf,

    /// Bytes per pixel used when a request does not say
    #[serde(rename = "pixel-depth")]
    pub pixel_depth: u32,

    /// Extra surfaces allowed per instance
    #[serde(rename = "max-extra-buffers")]
    pub max_extra_buffers: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            backend: BufferBackendKind::File,
            dir: runtime_base().join("surfaces"),
            pixel_depth: 4,
            max_extra_buffers: 4,
        }
    }
}

/// Package metadata store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory of `<package>.yml` metadata files
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let dir = dirs::data_dir()
            .map(|d| d.join("widgetmaster").join("packages"))
            .unwrap_or_else(|| PathBuf::from(".widgetmaster/packages"));
        Self { dir }
    }
}

/// Raw input device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// evdev node to read, e.g. /dev/input/event1 (disabled when unset)
    pub device: Option<PathBuf>,
}
