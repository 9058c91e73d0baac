//! Buffer import and the imported-handle cache.
//!
//! Clients identify buffers by `(stream_id, buffer_id)` plus a raw handle on
//! first use; later submissions may omit the raw handle. The session imports
//! each raw handle once and resolves repeats from the cache. Remapping a pair
//! to a different raw handle is a client bug and is rejected without
//! disturbing the existing mapping.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{HalError, HalResult};
use crate::types::{BufferId, ImportedHandle, RawBufferHandle, StreamBuffer, StreamId};

/// Import seam between the session and the platform buffer mapper.
pub trait BufferImporter: Send + Sync {
    /// Imports a client buffer, returning a handle usable by the pipeline.
    fn import(&self, raw: RawBufferHandle) -> HalResult<ImportedHandle>;

    /// Releases an imported handle.
    fn free(&self, handle: ImportedHandle);

    /// Maps an imported handle to its backing bytes.
    fn lock(&self, handle: ImportedHandle) -> HalResult<Arc<Mutex<Vec<u8>>>>;
}

struct MapEntry {
    raw: RawBufferHandle,
    imported: ImportedHandle,
}

/// Cache of imported handles keyed by `(stream_id, buffer_id)`.
pub struct HandleMap {
    importer: Arc<dyn BufferImporter>,
    entries: Mutex<HashMap<(StreamId, BufferId), MapEntry>>,
}

impl HandleMap {
    /// Creates an empty map backed by `importer`.
    pub fn new(importer: Arc<dyn BufferImporter>) -> Self {
        Self {
            importer,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves or imports the handles for a batch of submitted buffers.
    ///
    /// On success each buffer's `handle` is populated and its `raw_handle`
    /// cleared. Fails with `BadValue` when a pair arrives with a raw handle
    /// different from its cached one, or with no raw handle and no cached
    /// mapping. The cache is left unchanged on failure.
    pub fn import_buffers<'a, I>(&self, buffers: I) -> HalResult<()>
    where
        I: IntoIterator<Item = &'a mut StreamBuffer>,
    {
        let mut entries = self.entries.lock();
        for buffer in buffers {
            let key = (buffer.stream_id, buffer.buffer_id);
            let imported = match (entries.get(&key), buffer.raw_handle) {
                (Some(entry), Some(raw)) if entry.raw == raw => entry.imported,
                (Some(entry), None) => entry.imported,
                (Some(entry), Some(raw)) => {
                    warn!(
                        stream_id = buffer.stream_id,
                        buffer_id = buffer.buffer_id,
                        cached = entry.raw.0,
                        submitted = raw.0,
                        "buffer id remapped to a different handle"
                    );
                    return Err(HalError::BadValue(format!(
                        "buffer ({}, {}) already mapped to a different handle",
                        buffer.stream_id, buffer.buffer_id
                    )));
                }
                (None, Some(raw)) => {
                    let imported = self.importer.import(raw)?;
                    entries.insert(key, MapEntry { raw, imported });
                    imported
                }
                (None, None) => {
                    return Err(HalError::BadValue(format!(
                        "buffer ({}, {}) has no handle and no cached import",
                        buffer.stream_id, buffer.buffer_id
                    )));
                }
            };
            buffer.handle = Some(imported);
            buffer.raw_handle = None;
        }
        Ok(())
    }

    /// Looks up a cached handle.
    pub fn handle_for(&self, stream_id: StreamId, buffer_id: BufferId) -> Option<ImportedHandle> {
        self.entries
            .lock()
            .get(&(stream_id, buffer_id))
            .map(|e| e.imported)
    }

    /// Frees every handle belonging to streams not in `live_streams`.
    ///
    /// Called on reconfiguration so handles of dropped streams do not leak
    /// across configurations.
    pub fn retain_streams(&self, live_streams: &[StreamId]) {
        let mut entries = self.entries.lock();
        let stale: Vec<(StreamId, BufferId)> = entries
            .keys()
            .filter(|(stream_id, _)| !live_streams.contains(stream_id))
            .copied()
            .collect();
        for key in stale {
            if let Some(entry) = entries.remove(&key) {
                debug!(stream_id = key.0, buffer_id = key.1, "freeing stale import");
                self.importer.free(entry.imported);
            }
        }
    }

    /// Frees every handle. Called on session teardown.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            self.importer.free(entry.imported);
        }
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

struct WarehouseState {
    next_raw: u64,
    next_imported: u64,
    backing: HashMap<u64, Arc<Mutex<Vec<u8>>>>,
    imported: HashMap<u64, u64>,
}

/// In-memory buffer allocator and importer.
///
/// Plays both sides of the platform allocator: tests and the demo binary
/// allocate raw handles from it, and the session imports through it. Backing
/// storage is plain byte vectors.
pub struct BufferWarehouse {
    state: Mutex<WarehouseState>,
}

impl Default for BufferWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferWarehouse {
    /// Creates an empty warehouse.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WarehouseState {
                next_raw: 1,
                next_imported: 1,
                backing: HashMap::new(),
                imported: HashMap::new(),
            }),
        }
    }

    /// Allocates a zeroed buffer of `size` bytes, returning its raw handle.
    pub fn allocate(&self, size: usize) -> RawBufferHandle {
        let mut state = self.state.lock();
        let raw = state.next_raw;
        state.next_raw += 1;
        state
            .backing
            .insert(raw, Arc::new(Mutex::new(vec![0u8; size])));
        RawBufferHandle(raw)
    }

    /// Client-side view of a buffer's bytes, for inspecting results.
    pub fn bytes(&self, raw: RawBufferHandle) -> Option<Arc<Mutex<Vec<u8>>>> {
        self.state.lock().backing.get(&raw.0).cloned()
    }
}

impl BufferImporter for BufferWarehouse {
    fn import(&self, raw: RawBufferHandle) -> HalResult<ImportedHandle> {
        let mut state = self.state.lock();
        if !state.backing.contains_key(&raw.0) {
            return Err(HalError::BadValue(format!(
                "unknown raw buffer handle {}",
                raw.0
            )));
        }
        let imported = state.next_imported;
        state.next_imported += 1;
        state.imported.insert(imported, raw.0);
        Ok(ImportedHandle(imported))
    }

    fn free(&self, handle: ImportedHandle) {
        self.state.lock().imported.remove(&handle.0);
    }

    fn lock(&self, handle: ImportedHandle) -> HalResult<Arc<Mutex<Vec<u8>>>> {
        let state = self.state.lock();
        let raw = state
            .imported
            .get(&handle.0)
            .ok_or_else(|| HalError::NotFound(format!("imported handle {}", handle.0)))?;
        state
            .backing
            .get(raw)
            .cloned()
            .ok_or_else(|| HalError::NotFound(format!("backing store for handle {}", handle.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(stream_id: StreamId, buffer_id: BufferId, raw: Option<RawBufferHandle>) -> StreamBuffer {
        StreamBuffer {
            stream_id,
            buffer_id,
            raw_handle: raw,
            ..StreamBuffer::default()
        }
    }

    #[test]
    fn test_import_is_idempotent() {
        let warehouse = Arc::new(BufferWarehouse::new());
        let map = HandleMap::new(warehouse.clone());
        let raw = warehouse.allocate(64);

        let mut first = [buffer(0, 1, Some(raw))];
        map.import_buffers(&mut first).unwrap();
        let handle = first[0].handle.unwrap();
        assert!(first[0].raw_handle.is_none());

        // Same pair with the same raw handle, then with no handle at all.
        let mut again = [buffer(0, 1, Some(raw))];
        map.import_buffers(&mut again).unwrap();
        assert_eq!(again[0].handle, Some(handle));

        let mut cached = [buffer(0, 1, None)];
        map.import_buffers(&mut cached).unwrap();
        assert_eq!(cached[0].handle, Some(handle));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remap_rejected_and_map_unchanged() {
        let warehouse = Arc::new(BufferWarehouse::new());
        let map = HandleMap::new(warehouse.clone());
        let raw_a = warehouse.allocate(64);
        let raw_b = warehouse.allocate(64);

        let mut first = [buffer(0, 1, Some(raw_a))];
        map.import_buffers(&mut first).unwrap();
        let handle = first[0].handle.unwrap();

        let mut remap = [buffer(0, 1, Some(raw_b))];
        let err = map.import_buffers(&mut remap).unwrap_err();
        assert!(matches!(err, HalError::BadValue(_)));
        assert_eq!(map.handle_for(0, 1), Some(handle));
    }

    #[test]
    fn test_unknown_pair_without_handle_rejected() {
        let warehouse = Arc::new(BufferWarehouse::new());
        let map = HandleMap::new(warehouse);
        let mut buffers = [buffer(2, 9, None)];
        assert!(matches!(
            map.import_buffers(&mut buffers),
            Err(HalError::BadValue(_))
        ));
    }

    #[test]
    fn test_retain_streams_drops_stale_imports() {
        let warehouse = Arc::new(BufferWarehouse::new());
        let map = HandleMap::new(warehouse.clone());
        let raw_a = warehouse.allocate(16);
        let raw_b = warehouse.allocate(16);

        let mut buffers = [buffer(0, 1, Some(raw_a)), buffer(1, 1, Some(raw_b))];
        map.import_buffers(&mut buffers).unwrap();
        assert_eq!(map.len(), 2);

        map.retain_streams(&[1]);
        assert_eq!(map.len(), 1);
        assert!(map.handle_for(0, 1).is_none());
        assert!(map.handle_for(1, 1).is_some());
    }

    #[test]
    fn test_warehouse_lock_reads_backing() {
        let warehouse = BufferWarehouse::new();
        let raw = warehouse.allocate(8);
        let imported = warehouse.import(raw).unwrap();
        warehouse.lock(imported).unwrap().lock()[0] = 0xAB;
        assert_eq!(warehouse.bytes(raw).unwrap().lock()[0], 0xAB);
    }
}
