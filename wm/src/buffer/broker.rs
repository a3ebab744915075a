//! Render-surface handles shared between workers and viewers

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::{ErrorCode, WmResult};
use crate::render::{RenderBackend, SurfaceSpec};

/// Generation-checked index into the handle arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleKey {
    index: u32,
    generation: u32,
}

/// A loaded surface and who still references it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    pub resource: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// References held by viewers through `acquirePixmap`
    pub viewer_refs: u32,
    /// False once the owning slot has been torn down
    pub slot_alive: bool,
}

struct Entry {
    generation: u32,
    handle: Option<BufferHandle>,
}

/// One of an instance's surface slots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSlot {
    pub handle: Option<HandleKey>,
    /// Outstanding acquires from the worker (and the master on activation)
    pub acquired: u32,
    pub desired: (u32, u32),
    pub allocated: Option<(u32, u32)>,
}

impl BufferSlot {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            desired: (width, height),
            ..Self::default()
        }
    }

    /// Allocated size if a surface exists, otherwise the desired one
    pub fn size(&self) -> (u32, u32) {
        self.allocated.unwrap_or(self.desired)
    }

    pub fn is_allocated(&self) -> bool {
        self.handle.is_some()
    }
}

/// Naming information for a surface
#[derive(Debug, Clone, Copy)]
pub struct SurfaceName<'a> {
    pub pkg: &'a str,
    pub id: &'a str,
    pub label: &'a str,
}

/// Owns every live surface handle
pub struct BufferBroker {
    backend: Box<dyn RenderBackend>,
    entries: Vec<Entry>,
    free: Vec<u32>,
    by_resource: HashMap<String, HandleKey>,
    default_depth: u32,
    max_extra: usize,
}

impl BufferBroker {
    pub fn new(backend: Box<dyn RenderBackend>, default_depth: u32, max_extra: usize) -> Self {
        Self {
            backend,
            entries: Vec::new(),
            free: Vec::new(),
            by_resource: HashMap::new(),
            default_depth: default_depth.max(1),
            max_extra,
        }
    }

    pub fn max_extra(&self) -> usize {
        self.max_extra
    }

    /// Live handles (including ones kept alive only by viewers)
    pub fn len(&self) -> usize {
        self.by_resource.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }

    pub fn get(&self, key: HandleKey) -> Option<&BufferHandle> {
        let entry = self.entries.get(key.index as usize)?;
        if entry.generation != key.generation {
            return None;
        }
        entry.handle.as_ref()
    }

    fn get_mut(&mut self, key: HandleKey) -> Option<&mut BufferHandle> {
        let entry = self.entries.get_mut(key.index as usize)?;
        if entry.generation != key.generation {
            return None;
        }
        entry.handle.as_mut()
    }

    pub fn find(&self, resource: &str) -> Option<&BufferHandle> {
        self.by_resource.get(resource).and_then(|key| self.get(*key))
    }

    /// Resource id of a slot's current surface
    pub fn resource_of(&self, slot: &BufferSlot) -> Option<&str> {
        slot.handle.and_then(|k| self.get(k)).map(|h| h.resource.as_str())
    }

    fn insert(&mut self, handle: BufferHandle) -> HandleKey {
        let resource = handle.resource.clone();
        let key = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.handle = Some(handle);
                HandleKey {
                    index,
                    generation: entry.generation,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    handle: Some(handle),
                });
                HandleKey { index, generation: 0 }
            }
        };
        self.by_resource.insert(resource, key);
        key
    }

    fn load(&mut self, name: SurfaceName<'_>, width: u32, height: u32, depth: u32) -> WmResult<HandleKey> {
        if width == 0 || height == 0 {
            return Err(ErrorCode::InvalidParameter);
        }
        let spec = SurfaceSpec {
            pkg: name.pkg.to_string(),
            id: name.id.to_string(),
            label: name.label.to_string(),
            width,
            height,
            depth,
        };
        let resource = self.backend.load(&spec)?;
        info!(pkg = %name.pkg, id = %name.id, label = %name.label, %resource, width, height, "Surface loaded");
        Ok(self.insert(BufferHandle {
            resource,
            width,
            height,
            depth,
            viewer_refs: 0,
            slot_alive: true,
        }))
    }

    /// Frees the handle once nothing references it
    fn on_zero(&mut self, key: HandleKey) {
        let Some(handle) = self.get(key) else {
            return;
        };
        if handle.viewer_refs > 0 || handle.slot_alive {
            return;
        }
        let entry = &mut self.entries[key.index as usize];
        let Some(handle) = entry.handle.take() else {
            return;
        };
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(key.index);
        self.by_resource.remove(&handle.resource);
        if let Err(e) = self.backend.unload(&handle.resource) {
            warn!(resource = %handle.resource, error = %e, "Surface unload failed");
        }
        debug!(resource = %handle.resource, "BufferBroker::on_zero: freed");
    }

    /// Acquire a slot's surface, loading it at the desired size on first use.
    ///
    /// A second acquire without release returns the same resource.
    pub fn acquire(&mut self, slot: &mut BufferSlot, name: SurfaceName<'_>, depth: Option<u32>) -> WmResult<String> {
        debug!(pkg = %name.pkg, id = %name.id, label = %name.label, acquired = slot.acquired, "BufferBroker::acquire: called");
        if let Some(key) = slot.handle
            && let Some(handle) = self.get(key)
        {
            let resource = handle.resource.clone();
            slot.acquired += 1;
            return Ok(resource);
        }

        let (w, h) = slot.desired;
        let key = self.load(name, w, h, depth.unwrap_or(self.default_depth))?;
        slot.handle = Some(key);
        slot.allocated = Some((w, h));
        slot.acquired = 1;
        Ok(self.resource_of(slot).unwrap_or_default().to_string())
    }

    /// Drop one acquire. The surface is torn down when the count reaches zero.
    pub fn release(&mut self, slot: &mut BufferSlot) -> WmResult<()> {
        if slot.handle.is_none() || slot.acquired == 0 {
            return Err(ErrorCode::NotExist);
        }
        slot.acquired -= 1;
        debug!(acquired = slot.acquired, "BufferBroker::release");
        if slot.acquired == 0 {
            self.teardown(slot);
        }
        Ok(())
    }

    /// Tear the slot down regardless of outstanding acquires.
    ///
    /// Viewers still holding the surface keep it loaded until they unref it.
    pub fn teardown(&mut self, slot: &mut BufferSlot) {
        slot.acquired = 0;
        slot.allocated = None;
        let Some(key) = slot.handle.take() else {
            return;
        };
        if let Some(handle) = self.get_mut(key) {
            handle.slot_alive = false;
        }
        self.on_zero(key);
    }

    /// Resize a slot. Returns the (possibly new) resource id if the slot is allocated.
    ///
    /// A surface that viewers still reference is left intact and a fresh one is
    /// loaded in its place, so callers must not assume the id survives a resize.
    pub fn resize(
        &mut self,
        slot: &mut BufferSlot,
        name: SurfaceName<'_>,
        width: u32,
        height: u32,
    ) -> WmResult<Option<String>> {
        debug!(pkg = %name.pkg, id = %name.id, label = %name.label, width, height, "BufferBroker::resize: called");
        if width == 0 || height == 0 {
            return Err(ErrorCode::InvalidParameter);
        }
        slot.desired = (width, height);
        let Some(key) = slot.handle else {
            return Ok(None);
        };
        let Some(handle) = self.get(key).cloned() else {
            slot.handle = None;
            return Ok(None);
        };

        if handle.viewer_refs > 0 {
            let new_key = self.load(name, width, height, handle.depth)?;
            if let Some(old) = self.get_mut(key) {
                old.slot_alive = false;
            }
            self.on_zero(key);
            slot.handle = Some(new_key);
        } else {
            let resource = self.backend.resize(&handle.resource, width, height)?;
            if resource != handle.resource {
                self.by_resource.remove(&handle.resource);
                self.by_resource.insert(resource.clone(), key);
            }
            if let Some(h) = self.get_mut(key) {
                h.resource = resource;
                h.width = width;
                h.height = height;
            }
        }
        slot.allocated = Some((width, height));
        Ok(self.resource_of(slot).map(str::to_string))
    }

    /// A viewer starts using a surface
    pub fn ref_handle(&mut self, resource: &str) -> WmResult<u32> {
        let key = *self.by_resource.get(resource).ok_or(ErrorCode::NotExist)?;
        let handle = self.get_mut(key).ok_or(ErrorCode::NotExist)?;
        if !handle.slot_alive {
            return Err(ErrorCode::NotExist);
        }
        handle.viewer_refs += 1;
        Ok(handle.viewer_refs)
    }

    /// A viewer stops using a surface
    pub fn unref_handle(&mut self, resource: &str) -> WmResult<u32> {
        let key = *self.by_resource.get(resource).ok_or(ErrorCode::NotExist)?;
        let handle = self.get_mut(key).ok_or(ErrorCode::NotExist)?;
        if handle.viewer_refs == 0 {
            return Err(ErrorCode::InvalidState);
        }
        handle.viewer_refs -= 1;
        let refs = handle.viewer_refs;
        self.on_zero(key);
        Ok(refs)
    }

    pub fn is_loaded(&self, resource: &str) -> bool {
        self.backend.is_loaded(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::MemorySurfaceBackend;

    const NAME: SurfaceName<'static> = SurfaceName {
        pkg: "clock",
        id: "1",
        label: "dbox",
    };

    fn broker() -> BufferBroker {
        BufferBroker::new(Box::new(MemorySurfaceBackend::new()), 4, 2)
    }

    #[test]
    fn test_acquire_twice_returns_same_handle() {
        let mut b = broker();
        let mut slot = BufferSlot::new(10, 10);
        let first = b.acquire(&mut slot, NAME, None).unwrap();
        let second = b.acquire(&mut slot, NAME, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(slot.acquired, 2);
        assert_eq!(b.len(), 1);

        b.release(&mut slot).unwrap();
        assert!(slot.is_allocated(), "one acquire still outstanding");
        assert!(b.is_loaded(&first));

        b.release(&mut slot).unwrap();
        assert!(!slot.is_allocated());
        assert!(!b.is_loaded(&first));
        assert!(b.is_empty());
        assert_eq!(b.release(&mut slot), Err(ErrorCode::NotExist));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut b = broker();
        let mut slot = BufferSlot::new(0, 10);
        assert_eq!(b.acquire(&mut slot, NAME, None), Err(ErrorCode::InvalidParameter));
    }

    #[test]
    fn test_viewer_ref_outlives_slot() {
        let mut b = broker();
        let mut slot = BufferSlot::new(10, 10);
        let res = b.acquire(&mut slot, NAME, None).unwrap();
        b.ref_handle(&res).unwrap();

        b.teardown(&mut slot);
        assert!(b.is_loaded(&res), "viewer still holds it");
        assert_eq!(b.ref_handle(&res), Err(ErrorCode::NotExist), "no new refs after teardown");

        assert_eq!(b.unref_handle(&res), Ok(0));
        assert!(!b.is_loaded(&res));
        assert_eq!(b.unref_handle(&res), Err(ErrorCode::NotExist));
    }

    #[test]
    fn test_unref_without_teardown_keeps_surface() {
        let mut b = broker();
        let mut slot = BufferSlot::new(10, 10);
        let res = b.acquire(&mut slot, NAME, None).unwrap();
        b.ref_handle(&res).unwrap();
        b.unref_handle(&res).unwrap();
        assert!(b.is_loaded(&res));
        assert_eq!(b.unref_handle(&res), Err(ErrorCode::InvalidState));
    }

    #[test]
    fn test_resize_in_place_when_unreferenced() {
        let mut b = broker();
        let mut slot = BufferSlot::new(10, 10);
        let res = b.acquire(&mut slot, NAME, None).unwrap();
        let resized = b.resize(&mut slot, NAME, 20, 30).unwrap();
        assert_eq!(resized.as_deref(), Some(res.as_str()));
        assert_eq!(slot.size(), (20, 30));
        assert_eq!(b.find(&res).map(|h| (h.width, h.height)), Some((20, 30)));
    }

    #[test]
    fn test_resize_with_viewer_refs_allocates_new_surface() {
        let mut b = broker();
        let mut slot = BufferSlot::new(10, 10);
        let old = b.acquire(&mut slot, NAME, None).unwrap();
        b.ref_handle(&old).unwrap();

        let new = b.resize(&mut slot, NAME, 20, 20).unwrap().unwrap();
        assert_ne!(new, old);
        assert!(b.is_loaded(&old), "old surface pinned by the viewer");
        assert_eq!(slot.acquired, 1);

        b.unref_handle(&old).unwrap();
        assert!(!b.is_loaded(&old));
        assert!(b.is_loaded(&new));
    }

    #[test]
    fn test_resize_unallocated_updates_desired() {
        let mut b = broker();
        let mut slot = BufferSlot::new(10, 10);
        assert_eq!(b.resize(&mut slot, NAME, 5, 5), Ok(None));
        assert_eq!(slot.size(), (5, 5));
    }

    #[test]
    fn test_stale_key_is_rejected() {
        let mut b = broker();
        let mut slot = BufferSlot::new(1, 1);
        b.acquire(&mut slot, NAME, None).unwrap();
        let stale = slot.handle.unwrap();
        b.release(&mut slot).unwrap();

        let mut other = BufferSlot::new(1, 1);
        b.acquire(&mut other, NAME, None).unwrap();
        assert_eq!(other.handle.unwrap().index, stale.index, "arena slot reused");
        assert!(b.get(stale).is_none());
    }
}
