//! Service-wide identifier types and the trace-buffer id pool.
//!
//! All ids are allocated monotonically and never reused within a service
//! lifetime, except [`BufferId`]s, which come from a bounded pool and are
//! recycled through [`BufferIdAllocator`].

use serde::{Deserialize, Serialize};

pub type ProducerId = u64;
pub type ConsumerId = u64;
pub type DataSourceId = u64;
pub type DataSourceInstanceId = u64;
pub type TracingSessionId = u64;
pub type FlushRequestId = u64;

/// Producer-local logical stream id; packet reassembly is keyed on it.
pub type WriterId = u16;
/// Producer-assigned, monotonic per writer.
pub type ChunkId = u16;

/// Service-wide 16-bit handle addressing one trace buffer. Id 0 is
/// reserved as invalid.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BufferId(pub u16);

impl BufferId {
    pub const INVALID: BufferId = BufferId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

const ID_WORDS: usize = (u16::MAX as usize + 1) / 64;

/// Bitmap allocator over buffer ids `[1, 0xffff]`.
pub struct BufferIdAllocator {
    words: [u64; ID_WORDS],
    cursor: usize,
    in_use: usize,
}

impl BufferIdAllocator {
    pub fn new() -> Self {
        let mut words = [0u64; ID_WORDS];
        words[0] = 1; // id 0 permanently taken
        BufferIdAllocator {
            words,
            cursor: 0,
            in_use: 0,
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Hand out an unused id, or `None` when the whole pool is taken.
    pub fn allocate(&mut self) -> Option<BufferId> {
        for step in 0..ID_WORDS {
            let wi = (self.cursor + step) % ID_WORDS;
            let word = self.words[wi];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            self.words[wi] |= 1 << bit;
            self.cursor = wi;
            self.in_use += 1;
            return Some(BufferId((wi * 64 + bit) as u16));
        }
        None
    }

    /// Return an id to the pool. Freeing an id that was never allocated
    /// is a bug on the caller's side.
    pub fn free(&mut self, id: BufferId) {
        debug_assert!(id.is_valid());
        let idx = id.0 as usize;
        let (wi, bit) = (idx / 64, idx % 64);
        debug_assert!(self.words[wi] & (1 << bit) != 0, "double free of {id}");
        self.words[wi] &= !(1 << bit);
        self.in_use -= 1;
    }
}

impl Default for BufferIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
