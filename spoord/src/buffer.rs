//! Per-session trace buffers.
//!
//! A trace buffer is a service-private ring of 4 KiB pages. Producers
//! never touch it: data arrives as whole-page copies lifted out of a
//! producer's shared-memory region. The ring never signals "full" —
//! when the write cursor laps an undrained page the old data is simply
//! overwritten and the loss is counted.

use bytes::Bytes;
use memmap2::MmapMut;
use spoor_shm::{chunk_payload, ChunkHeaderSnapshot, PageHeaderSnapshot, ShmAbi, PAGE_SIZE};

use crate::error::ServiceError;
use crate::ids::{BufferId, ChunkId, ProducerId, WriterId};

/// One non-free chunk lifted out of the ring during a drain.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub producer: ProducerId,
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
    pub packet_count: u16,
    pub flags: u8,
    pub payload: Bytes,
}

pub struct CopyOutcome {
    /// Ring slot the page landed in.
    pub slot: usize,
    /// An undrained page was overwritten to make room.
    pub overwrote: bool,
}

pub struct TraceBuffer {
    id: BufferId,
    map: MmapMut,
    num_pages: usize,
    write_cursor: usize,
    page_owners: Vec<ProducerId>,
}

impl TraceBuffer {
    /// Allocate a page-aligned ring of at least `size_bytes` (rounded up
    /// to a whole number of pages, minimum one).
    pub fn create(id: BufferId, size_bytes: usize) -> Result<TraceBuffer, ServiceError> {
        let size = size_bytes.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let map = MmapMut::map_anon(size)
            .map_err(|source| ServiceError::BufferAllocFailed { size, source })?;
        let num_pages = size / PAGE_SIZE;
        Ok(TraceBuffer {
            id,
            map,
            num_pages,
            write_cursor: 0,
            page_owners: vec![0; num_pages],
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    fn page(&self, slot: usize) -> &[u8] {
        &self.map[slot * PAGE_SIZE..(slot + 1) * PAGE_SIZE]
    }

    fn page_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.map[slot * PAGE_SIZE..(slot + 1) * PAGE_SIZE]
    }

    /// Record a whole page at the write cursor, advancing cyclically.
    /// The source page must be held in `BeingRead` by the caller.
    pub fn copy_page(
        &mut self,
        producer: ProducerId,
        src: &ShmAbi,
        src_page: usize,
    ) -> CopyOutcome {
        let slot = self.write_cursor;
        let overwrote = !PageHeaderSnapshot::read(self.page(slot)).is_free();
        src.copy_page_into(src_page, self.page_mut(slot));
        self.page_owners[slot] = producer;
        self.write_cursor = (slot + 1) % self.num_pages;
        CopyOutcome { slot, overwrote }
    }

    /// Chunk headers present on a copied page, as `(writer_id, chunk_id,
    /// chunk_index)`. Used to match pending patches against the page.
    pub fn chunk_keys(&self, slot: usize) -> Vec<(WriterId, ChunkId, usize)> {
        let page = self.page(slot);
        let hdr = PageHeaderSnapshot::read(page);
        let Some(layout) = hdr.layout() else {
            return Vec::new();
        };
        let mut keys = Vec::new();
        for idx in 0..layout.num_chunks() {
            if hdr.chunk_state(idx) == spoor_shm::ChunkState::Free {
                continue;
            }
            let ch = ChunkHeaderSnapshot::read(page, layout, idx);
            keys.push((ch.writer_id(), ch.chunk_id(), idx));
        }
        keys
    }

    /// Mutable payload of one chunk on a copied page, for applying
    /// out-of-band patches before the data is read out.
    pub fn chunk_payload_mut(&mut self, slot: usize, chunk_idx: usize) -> Option<&mut [u8]> {
        let layout = PageHeaderSnapshot::read(self.page(slot)).layout()?;
        if chunk_idx >= layout.num_chunks() {
            return None;
        }
        Some(spoor_shm::chunk_payload_mut(
            self.page_mut(slot),
            layout,
            chunk_idx,
        ))
    }

    /// Take every non-free chunk out of the ring in cursor-relative order
    /// (oldest page first), resetting the consumed pages to free. Chunk
    /// payloads are copied out so the ring can be reused immediately.
    pub fn drain(&mut self) -> Vec<ChunkRecord> {
        let mut records = Vec::new();
        for step in 0..self.num_pages {
            let slot = (self.write_cursor + step) % self.num_pages;
            let hdr = PageHeaderSnapshot::read(self.page(slot));
            if hdr.is_free() {
                continue;
            }
            let owner = self.page_owners[slot];
            if let Some(layout) = hdr.layout() {
                for idx in 0..layout.num_chunks() {
                    if hdr.chunk_state(idx) == spoor_shm::ChunkState::Free {
                        continue;
                    }
                    let page = self.page(slot);
                    let ch = ChunkHeaderSnapshot::read(page, layout, idx);
                    records.push(ChunkRecord {
                        producer: owner,
                        writer_id: ch.writer_id(),
                        chunk_id: ch.chunk_id(),
                        packet_count: ch.packet_count(),
                        flags: ch.flags(),
                        payload: Bytes::copy_from_slice(chunk_payload(page, layout, idx)),
                    });
                }
            }
            self.page_mut(slot)[..spoor_shm::PAGE_HEADER_SIZE].fill(0);
            self.page_owners[slot] = 0;
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::shmem::SharedMemory;
    use spoor_shm::{PacketStreamWriter, PageLayout};

    fn staged_page(packets: &[&[u8]], writer_id: u16) -> (std::sync::Arc<SharedMemory>, ShmAbi) {
        let shm = SharedMemory::allocate(0, &ServiceConfig::default()).unwrap();
        let abi = shm.abi();
        let mut w = PacketStreamWriter::new(abi.clone(), PageLayout::Fourteen, writer_id, 1);
        for p in packets {
            w.write_packet(p).unwrap();
        }
        w.flush();
        assert!(abi.try_acquire_all_chunks_for_reading(0));
        (shm, abi)
    }

    #[test]
    fn create_rounds_up_to_whole_pages() {
        let buf = TraceBuffer::create(BufferId(1), 5000).unwrap();
        assert_eq!(buf.size(), 2 * PAGE_SIZE);
        assert_eq!(buf.num_pages(), 2);
        let buf = TraceBuffer::create(BufferId(2), 0).unwrap();
        assert_eq!(buf.num_pages(), 1);
    }

    #[test]
    fn drain_returns_copied_chunks_then_nothing() {
        let (_shm, abi) = staged_page(&[b"one", b"two"], 7);
        let mut buf = TraceBuffer::create(BufferId(1), 4 * PAGE_SIZE).unwrap();
        let outcome = buf.copy_page(42, &abi, 0);
        assert!(!outcome.overwrote);
        abi.release_all_chunks_as_free(0);

        let records = buf.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].producer, 42);
        assert_eq!(records[0].writer_id, 7);
        assert_eq!(records[0].packet_count, 2);
        // A second drain finds an empty ring.
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn ring_overwrites_oldest_page_without_blocking() {
        let mut buf = TraceBuffer::create(BufferId(1), 2 * PAGE_SIZE).unwrap();
        for round in 0u64..3 {
            let (_shm, abi) = staged_page(&[b"x"], round as u16 + 1);
            let outcome = buf.copy_page(round + 1, &abi, 0);
            assert_eq!(outcome.overwrote, round >= 2);
            abi.release_all_chunks_as_free(0);
        }
        // Slot 0 was lapped: the survivors are rounds 2 and 3, oldest
        // first in cursor-relative order.
        let records = buf.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].producer, 2);
        assert_eq!(records[1].producer, 3);
    }
}
