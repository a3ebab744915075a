//! Render surface backends
//!
//! The master never draws. It only asks a backend for a surface of a given size and
//! hands the resulting resource id (e.g. `file:///run/.../clock-1-dbox-3.buf`) to
//! workers and viewers.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::{BufferBackendKind, BufferConfig};
use crate::error::{ErrorCode, WmResult};

/// Shape of a surface to allocate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSpec {
    pub pkg: String,
    pub id: String,
    /// `dbox`, `gbar` or `extra<N>`
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel
    pub depth: u32,
}

impl SurfaceSpec {
    pub fn bytes(&self) -> WmResult<u64> {
        u64::from(self.width)
            .checked_mul(u64::from(self.height))
            .and_then(|n| n.checked_mul(u64::from(self.depth)))
            .ok_or(ErrorCode::OutOfMemory)
    }
}

/// Allocates, resizes and frees render surfaces
pub trait RenderBackend: Send {
    /// Allocate a surface, returning its resource id
    fn load(&mut self, spec: &SurfaceSpec) -> WmResult<String>;

    fn unload(&mut self, resource: &str) -> WmResult<()>;

    /// Resize in place. The returned id may differ from `resource`.
    fn resize(&mut self, resource: &str, width: u32, height: u32) -> WmResult<String>;

    fn is_loaded(&self, resource: &str) -> bool;
}

/// Build the backend named in the config
pub fn create_backend(config: &BufferConfig) -> Box<dyn RenderBackend> {
    match config.backend {
        BufferBackendKind::File => Box::new(FileSurfaceBackend::new(config.dir.clone())),
        BufferBackendKind::Memory => Box::new(MemorySurfaceBackend::new()),
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Surfaces are sparse files sized `w * h * depth`
pub struct FileSurfaceBackend {
    dir: PathBuf,
    serial: u64,
    loaded: HashMap<String, (PathBuf, u32)>,
}

impl FileSurfaceBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            serial: 0,
            loaded: HashMap::new(),
        }
    }
}

impl RenderBackend for FileSurfaceBackend {
    fn load(&mut self, spec: &SurfaceSpec) -> WmResult<String> {
        debug!(?spec, "FileSurfaceBackend::load: called");
        let bytes = spec.bytes()?;
        fs::create_dir_all(&self.dir)?;

        self.serial += 1;
        let path = self.dir.join(format!(
            "{}-{}-{}-{}.buf",
            sanitize(&spec.pkg),
            sanitize(&spec.id),
            spec.label,
            self.serial
        ));
        let file = fs::File::create(&path)?;
        file.set_len(bytes)?;

        let resource = format!("file://{}", path.display());
        self.loaded.insert(resource.clone(), (path, spec.depth));
        Ok(resource)
    }

    fn unload(&mut self, resource: &str) -> WmResult<()> {
        debug!(%resource, "FileSurfaceBackend::unload: called");
        let (path, _) = self.loaded.remove(resource).ok_or(ErrorCode::NotExist)?;
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove surface file");
        }
        Ok(())
    }

    fn resize(&mut self, resource: &str, width: u32, height: u32) -> WmResult<String> {
        debug!(%resource, width, height, "FileSurfaceBackend::resize: called");
        let (path, depth) = self.loaded.get(resource).ok_or(ErrorCode::NotExist)?;
        let bytes = u64::from(width)
            .checked_mul(u64::from(height))
            .and_then(|n| n.checked_mul(u64::from(*depth)))
            .ok_or(ErrorCode::OutOfMemory)?;
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(bytes)?;
        Ok(resource.to_string())
    }

    fn is_loaded(&self, resource: &str) -> bool {
        self.loaded.contains_key(resource)
    }
}

/// Bookkeeping-only surfaces (`shm://<n>`)
#[derive(Default)]
pub struct MemorySurfaceBackend {
    serial: u64,
    loaded: HashMap<String, (u32, u32)>,
}

impl MemorySurfaceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size recorded for a surface
    pub fn size_of(&self, resource: &str) -> Option<(u32, u32)> {
        self.loaded.get(resource).copied()
    }
}

impl RenderBackend for MemorySurfaceBackend {
    fn load(&mut self, spec: &SurfaceSpec) -> WmResult<String> {
        spec.bytes()?;
        self.serial += 1;
        let resource = format!("shm://{}", self.serial);
        self.loaded.insert(resource.clone(), (spec.width, spec.height));
        Ok(resource)
    }

    fn unload(&mut self, resource: &str) -> WmResult<()> {
        self.loaded.remove(resource).map(|_| ()).ok_or(ErrorCode::NotExist)
    }

    fn resize(&mut self, resource: &str, width: u32, height: u32) -> WmResult<String> {
        let size = self.loaded.get_mut(resource).ok_or(ErrorCode::NotExist)?;
        *size = (width, height);
        Ok(resource.to_string())
    }

    fn is_loaded(&self, resource: &str) -> bool {
        self.loaded.contains_key(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(w: u32, h: u32) -> SurfaceSpec {
        SurfaceSpec {
            pkg: "clock".to_string(),
            id: "1/2".to_string(),
            label: "dbox".to_string(),
            width: w,
            height: h,
            depth: 4,
        }
    }

    #[test]
    fn test_file_backend_lifecycle() {
        let temp = TempDir::new().unwrap();
        let mut backend = FileSurfaceBackend::new(temp.path().join("surfaces"));

        let res = backend.load(&spec(10, 10)).unwrap();
        assert!(res.starts_with("file://"));
        assert!(!res.contains("1/2"), "instance id must be sanitized");
        assert!(backend.is_loaded(&res));

        let path = PathBuf::from(res.trim_start_matches("file://"));
        assert_eq!(fs::metadata(&path).unwrap().len(), 400);

        let resized = backend.resize(&res, 20, 10).unwrap();
        assert_eq!(resized, res);
        assert_eq!(fs::metadata(&path).unwrap().len(), 800);

        backend.unload(&res).unwrap();
        assert!(!backend.is_loaded(&res));
        assert!(!path.exists());
        assert_eq!(backend.unload(&res), Err(ErrorCode::NotExist));
    }

    #[test]
    fn test_memory_backend_ids_are_unique() {
        let mut backend = MemorySurfaceBackend::new();
        let a = backend.load(&spec(1, 1)).unwrap();
        let b = backend.load(&spec(1, 1)).unwrap();
        assert_ne!(a, b);
        backend.resize(&a, 5, 6).unwrap();
        assert_eq!(backend.size_of(&a), Some((5, 6)));
        assert_eq!(backend.resize("shm://999", 1, 1), Err(ErrorCode::NotExist));
    }

    #[test]
    fn test_overflowing_size_rejected() {
        let mut backend = MemorySurfaceBackend::new();
        let mut s = spec(u32::MAX, u32::MAX);
        s.depth = u32::MAX;
        assert_eq!(backend.load(&s), Err(ErrorCode::OutOfMemory));
    }
}
