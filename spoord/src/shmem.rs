//! Service-owned shared-memory regions.
//!
//! One region is created per connected producer and (in a full deployment)
//! handed over through fd passing on the producer socket; in-process
//! producers simply share the `Arc`. The service sizes the region from
//! the producer's hint, falling back to the default when the hint is
//! absent or bogus.

use std::sync::Arc;

use memmap2::MmapMut;
use spoor_shm::{ShmAbi, PAGE_SIZE};

use crate::config::ServiceConfig;
use crate::error::ServiceError;

pub struct SharedMemory {
    map: MmapMut,
    abi: ShmAbi,
}

// SAFETY: the mapping is anonymous and pinned for the lifetime of this
// struct; concurrent access goes through the ABI's atomic protocol.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Map a fresh zeroed region sized from the producer's hint. A
    /// mapping failure is fatal for the connecting producer only.
    pub fn allocate(hint_bytes: usize, cfg: &ServiceConfig) -> Result<Arc<SharedMemory>, ServiceError> {
        let size = size_from_hint(hint_bytes, cfg);
        let mut map = MmapMut::map_anon(size)
            .map_err(|source| ServiceError::ShmMapFailed { size, source })?;
        let abi = unsafe { ShmAbi::from_raw(map.as_mut_ptr(), size) }
            .expect("anonymous mapping is page-aligned and page-sized");
        Ok(Arc::new(SharedMemory { map, abi }))
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn num_pages(&self) -> usize {
        self.size() / PAGE_SIZE
    }

    /// A fresh view over the region. Views stay valid for as long as the
    /// `Arc<SharedMemory>` is alive.
    pub fn abi(&self) -> ShmAbi {
        self.abi.clone()
    }
}

/// Round the producer's size hint to the region actually granted:
/// capped at the maximum, and falling back to the default when the hint
/// is not a page multiple or below the minimum.
pub fn size_from_hint(hint_bytes: usize, cfg: &ServiceConfig) -> usize {
    let size = hint_bytes.min(cfg.max_shm_pages * PAGE_SIZE);
    if size % PAGE_SIZE != 0 || size < cfg.min_shm_pages * PAGE_SIZE {
        return cfg.default_shm_pages * PAGE_SIZE;
    }
    size
}
