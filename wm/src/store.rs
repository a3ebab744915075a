//! Package metadata store
//!
//! Read-only from the master's point of view: given a package name it returns the
//! defaults a new instance starts from. A package whose metadata cannot be loaded
//! still gets conservative fallback defaults.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from package metadata lookups
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Package not found: {0}")]
    NotFound(String),

    #[error("Failed to read package metadata {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse package metadata {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Static defaults for one package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageInfo {
    pub name: String,

    /// Worker ABI that can host the package
    pub abi: String,

    /// Must run on an exclusive worker
    pub secured: bool,

    /// Update period in seconds (0 = no periodic update)
    pub period: f64,

    /// Seconds a worker may take to answer for this package
    pub timeout: u64,

    /// Default primary view size
    pub width: u32,
    pub height: u32,

    /// Default detail view size
    #[serde(rename = "gbar-width")]
    pub gbar_width: u32,
    #[serde(rename = "gbar-height")]
    pub gbar_height: u32,

    /// Supports pinning its content
    pub pinup: bool,

    #[serde(rename = "script-path")]
    pub script_path: Option<String>,

    #[serde(rename = "group-path")]
    pub group_path: Option<String>,

    pub category: Option<String>,
}

impl Default for PackageInfo {
    fn default() -> Self {
        Self::fallback("")
    }
}

impl PackageInfo {
    /// Conservative defaults for a package with no usable metadata
    pub fn fallback(name: &str) -> Self {
        Self {
            name: name.to_string(),
            abi: "c".to_string(),
            secured: false,
            period: 0.0,
            timeout: 60,
            width: 0,
            height: 0,
            gbar_width: 0,
            gbar_height: 0,
            pinup: false,
            script_path: None,
            group_path: None,
            category: None,
        }
    }
}

/// Source of package defaults
pub trait PackageStore: Send {
    fn load(&self, name: &str) -> Result<PackageInfo, StoreError>;

    /// Every package name the store knows about
    fn names(&self) -> Vec<String>;
}

/// Store backed by `<dir>/<package>.yml` files
#[derive(Debug, Clone)]
pub struct DirPackageStore {
    dir: PathBuf,
}

impl DirPackageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.yml"))
    }
}

impl PackageStore for DirPackageStore {
    fn load(&self, name: &str) -> Result<PackageInfo, StoreError> {
        debug!(%name, dir = %self.dir.display(), "DirPackageStore::load: called");
        if name.contains('/') || name.starts_with('.') {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let path = self.path_for(name);
        if !path.exists() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let content = fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let mut info: PackageInfo =
            serde_yaml::from_str(&content).map_err(|source| StoreError::Parse { path, source })?;
        info.name = name.to_string();
        Ok(info)
    }

    fn names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                (path.extension().and_then(|x| x.to_str()) == Some("yml"))
                    .then(|| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
                    .flatten()
            })
            .collect();
        names.sort();
        names
    }
}

/// In-memory store, handy for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct MemoryPackageStore {
    packages: HashMap<String, PackageInfo>,
}

impl MemoryPackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: PackageInfo) {
        self.packages.insert(info.name.clone(), info);
    }

    pub fn with(mut self, info: PackageInfo) -> Self {
        self.insert(info);
        self
    }
}

impl PackageStore for MemoryPackageStore {
    fn load(&self, name: &str) -> Result<PackageInfo, StoreError> {
        self.packages
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.packages.keys().cloned().collect();
        names.sort();
        names
    }
}
