//! Shared-memory chunk ABI between spoor producers and the spoord service.
//!
//! # Architecture
//!
//! A shared-memory region is a run of 4 KiB pages mapped into exactly one
//! producer process and the service. The first byte word of each page
//! describes how the page is partitioned into chunks; chunks are the unit
//! of hand-off from producer to service.
//!
//! The protocol is lock-free: all cross-process coordination goes through
//! a single 32-bit page-header word holding a 2-bit state per chunk plus
//! the partition layout, modified only with compare-and-swap.
//!
//! # Memory layout
//!
//! ```text
//! page (4096 bytes):
//!   [0..4]   layout word: bits 0..27  = 2-bit state per chunk (up to 14)
//!                         bits 28..30 = partition layout id
//!   [4..8]   target buffer id (low 16 bits), set by the producer
//!   [8..]    chunk storage, equal-size chunks per the layout
//!
//! chunk:
//!   [0..4]   writer id (low 16) | chunk id (high 16)
//!   [4..8]   packet count (low 16) | flags (bits 16..23)
//!   [8..]    payload: varint-length-prefixed packets
//! ```
//!
//! # Chunk state machine
//!
//! ```text
//!   Free -> BeingWritten   producer acquires a chunk for writing
//!   BeingWritten -> Complete   producer publishes count + flags
//!   Complete -> BeingRead  service acquires (whole page, all-or-nothing)
//!   BeingRead -> Free      service done copying the page out
//! ```
//!
//! Every transition is a CAS on the page word; the producer's release and
//! the service's acquire carry the release/acquire ordering that makes the
//! chunk payload visible. Any observation outside this lattice means a
//! buggy or malicious producer and the page is skipped.

use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

pub mod varint;
pub mod writer;

pub use writer::PacketStreamWriter;

/// Size of one shared-memory page. Fixed by the ABI.
pub const PAGE_SIZE: usize = 4096;

/// Bytes reserved for the page header at the start of each page.
pub const PAGE_HEADER_SIZE: usize = 8;

/// Bytes reserved for the chunk header at the start of each chunk.
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Upper bound on chunks per page; dictates the 28 state bits in the page
/// word and therefore the 32-bit word width.
pub const MAX_CHUNKS_PER_PAGE: usize = 14;

const LAYOUT_SHIFT: u32 = 28;
const LAYOUT_MASK: u32 = 0x7;
const STATE_MASK: u32 = 0b11;

/// Chunk continuation flags, stored in the chunk header.
pub mod chunk_flags {
    /// The first packet in this chunk is the tail of a packet that began
    /// in the previous chunk of the same writer.
    pub const FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK: u8 = 1 << 0;
    /// The last packet in this chunk continues in the next chunk of the
    /// same writer.
    pub const LAST_PACKET_CONTINUES_ON_NEXT_CHUNK: u8 = 1 << 1;
}

/// Per-chunk ownership state, two bits in the page word.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkState {
    /// Unowned; a producer may acquire it for writing.
    Free = 0,
    /// A producer holds it and is writing packets.
    BeingWritten = 1,
    /// Published by the producer; payload, count and flags are final.
    Complete = 2,
    /// The service holds it while copying the page out.
    BeingRead = 3,
}

impl ChunkState {
    pub fn from_bits(bits: u32) -> ChunkState {
        match bits & STATE_MASK {
            0 => ChunkState::Free,
            1 => ChunkState::BeingWritten,
            2 => ChunkState::Complete,
            _ => ChunkState::BeingRead,
        }
    }
}

/// The closed set of page partitions. The layout id lives in bits 28..30
/// of the page word; id 0 means the page is unpartitioned (free).
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageLayout {
    One = 1,
    Two = 2,
    Four = 3,
    Seven = 4,
    Fourteen = 5,
}

impl PageLayout {
    pub fn from_bits(bits: u32) -> Option<PageLayout> {
        match bits {
            1 => Some(PageLayout::One),
            2 => Some(PageLayout::Two),
            3 => Some(PageLayout::Four),
            4 => Some(PageLayout::Seven),
            5 => Some(PageLayout::Fourteen),
            _ => None,
        }
    }

    pub const fn num_chunks(self) -> usize {
        match self {
            PageLayout::One => 1,
            PageLayout::Two => 2,
            PageLayout::Four => 4,
            PageLayout::Seven => 7,
            PageLayout::Fourteen => 14,
        }
    }

    /// Whole-chunk size, header included. Chunk starts stay 4-byte aligned
    /// so the header words can be accessed atomically; the divide-by-four
    /// partition rounds down and wastes 8 bytes at the end of the page.
    pub const fn chunk_size(self) -> usize {
        match self {
            PageLayout::One => 4088,
            PageLayout::Two => 2044,
            PageLayout::Four => 1020,
            PageLayout::Seven => 584,
            PageLayout::Fourteen => 292,
        }
    }

    pub const fn payload_size(self) -> usize {
        self.chunk_size() - CHUNK_HEADER_SIZE
    }

    pub const fn chunk_offset(self, idx: usize) -> usize {
        PAGE_HEADER_SIZE + idx * self.chunk_size()
    }
}

/// Chunks a page partitioned with `layout_bits` carries, or 0 when the
/// bits name no valid layout.
pub fn num_chunks_for_layout(layout_bits: u32) -> usize {
    PageLayout::from_bits(layout_bits).map_or(0, PageLayout::num_chunks)
}

fn layout_bits(word: u32) -> u32 {
    (word >> LAYOUT_SHIFT) & LAYOUT_MASK
}

fn chunk_state_bits(word: u32, idx: usize) -> u32 {
    (word >> (2 * idx as u32)) & STATE_MASK
}

fn with_chunk_state(word: u32, idx: usize, state: ChunkState) -> u32 {
    let shift = 2 * idx as u32;
    (word & !(STATE_MASK << shift)) | ((state as u32) << shift)
}

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared-memory region must be a non-zero multiple of {PAGE_SIZE} bytes, got {0}")]
    BadRegionSize(usize),
    #[error("shared-memory region base must be at least 4-byte aligned")]
    MisalignedRegion,
    #[error("no free chunk available in the shared-memory region")]
    NoFreeChunk,
    #[error("fragment of {got} bytes does not fit the {room} bytes left in the chunk")]
    FragmentTooLarge { got: usize, room: usize },
}

// Page and chunk headers as seen through the live atomics. Both are
// 4-byte aligned by construction (pages are 4 KiB aligned, chunk sizes
// are multiples of 4).
#[repr(C)]
struct PageHeader {
    layout_word: AtomicU32,
    target_buffer: AtomicU32,
}

#[repr(C)]
struct ChunkHeader {
    // writer id (low 16) | chunk id (high 16)
    ids: AtomicU32,
    // packet count (low 16) | flags (bits 16..23)
    packets: AtomicU32,
}

/// Plain-old-data image of a page header, for parsing pages that have
/// already been copied into service-private memory.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PageHeaderSnapshot {
    pub layout_word: u32,
    pub target_buffer: u32,
}

impl PageHeaderSnapshot {
    pub fn read(page: &[u8]) -> PageHeaderSnapshot {
        bytemuck::pod_read_unaligned(&page[..PAGE_HEADER_SIZE])
    }

    pub fn layout(&self) -> Option<PageLayout> {
        PageLayout::from_bits(layout_bits(self.layout_word))
    }

    pub fn chunk_state(&self, idx: usize) -> ChunkState {
        ChunkState::from_bits(chunk_state_bits(self.layout_word, idx))
    }

    pub fn is_free(&self) -> bool {
        self.layout_word == 0
    }
}

/// Plain-old-data image of a chunk header.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ChunkHeaderSnapshot {
    pub ids: u32,
    pub packets: u32,
}

impl ChunkHeaderSnapshot {
    pub fn read(page: &[u8], layout: PageLayout, idx: usize) -> ChunkHeaderSnapshot {
        let off = layout.chunk_offset(idx);
        bytemuck::pod_read_unaligned(&page[off..off + CHUNK_HEADER_SIZE])
    }

    pub fn writer_id(&self) -> u16 {
        (self.ids & 0xffff) as u16
    }

    pub fn chunk_id(&self) -> u16 {
        (self.ids >> 16) as u16
    }

    pub fn packet_count(&self) -> u16 {
        (self.packets & 0xffff) as u16
    }

    pub fn flags(&self) -> u8 {
        ((self.packets >> 16) & 0xff) as u8
    }
}

/// Payload bytes of one chunk inside a page image held in private memory.
pub fn chunk_payload(page: &[u8], layout: PageLayout, idx: usize) -> &[u8] {
    let start = layout.chunk_offset(idx) + CHUNK_HEADER_SIZE;
    &page[start..start + layout.payload_size()]
}

/// Mutable variant of [`chunk_payload`], used to apply out-of-band patches
/// to pages already copied out of the shared region.
pub fn chunk_payload_mut(page: &mut [u8], layout: PageLayout, idx: usize) -> &mut [u8] {
    let start = layout.chunk_offset(idx) + CHUNK_HEADER_SIZE;
    &mut page[start..start + layout.payload_size()]
}

/// Outcome of a forced page acquisition (stalled-producer recovery).
#[derive(Debug, Default, Clone, Copy)]
pub struct ForcedAcquisition {
    /// Chunks demoted from `BeingWritten` straight to `Free`, losing
    /// whatever the producer had staged in them.
    pub demoted: usize,
    /// Chunks salvaged from `Complete` into `BeingRead`.
    pub salvaged: usize,
}

/// A view over a shared-memory region, usable from both sides of the
/// protocol. Cloning the view is cheap; it is just a pointer and a page
/// count.
///
/// The region outlives every view derived from it; the owner (the service
/// for producer SMBs, the trace buffer for its private pages) guarantees
/// that.
#[derive(Clone)]
pub struct ShmAbi {
    base: *mut u8,
    num_pages: usize,
}

// SAFETY: all shared mutation goes through the atomic page/chunk header
// words; payload accesses are ordered by the acquire/release transitions
// of the state machine.
unsafe impl Send for ShmAbi {}
unsafe impl Sync for ShmAbi {}

impl ShmAbi {
    /// Build a view over `size` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a readable and writable allocation of at least
    /// `size` bytes that stays alive and pinned for the lifetime of this
    /// view and everything derived from it.
    pub unsafe fn from_raw(base: *mut u8, size: usize) -> Result<ShmAbi, ShmError> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(ShmError::BadRegionSize(size));
        }
        if (base as usize) % 4 != 0 {
            return Err(ShmError::MisalignedRegion);
        }
        Ok(ShmAbi {
            base,
            num_pages: size / PAGE_SIZE,
        })
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    fn page_base(&self, page: usize) -> *mut u8 {
        debug_assert!(page < self.num_pages);
        unsafe { self.base.add(page * PAGE_SIZE) }
    }

    fn header(&self, page: usize) -> &PageHeader {
        unsafe { &*(self.page_base(page) as *const PageHeader) }
    }

    fn chunk_header(&self, page: usize, layout: PageLayout, idx: usize) -> &ChunkHeader {
        unsafe { &*(self.page_base(page).add(layout.chunk_offset(idx)) as *const ChunkHeader) }
    }

    // ---- introspection ------------------------------------------------

    pub fn page_layout(&self, page: usize) -> Option<PageLayout> {
        let word = self.header(page).layout_word.load(Ordering::Acquire);
        PageLayout::from_bits(layout_bits(word))
    }

    pub fn is_page_free(&self, page: usize) -> bool {
        self.header(page).layout_word.load(Ordering::Acquire) == 0
    }

    /// A page is complete when it is partitioned, every chunk is either
    /// `Complete` or `Free`, and at least one chunk is `Complete`.
    pub fn is_page_complete(&self, page: usize) -> bool {
        let word = self.header(page).layout_word.load(Ordering::Acquire);
        let Some(layout) = PageLayout::from_bits(layout_bits(word)) else {
            return false;
        };
        let mut any_complete = false;
        for idx in 0..layout.num_chunks() {
            match ChunkState::from_bits(chunk_state_bits(word, idx)) {
                ChunkState::Complete => any_complete = true,
                ChunkState::Free => {}
                _ => return false,
            }
        }
        any_complete
    }

    pub fn chunk_state(&self, page: usize, idx: usize) -> ChunkState {
        let word = self.header(page).layout_word.load(Ordering::Acquire);
        ChunkState::from_bits(chunk_state_bits(word, idx))
    }

    pub fn target_buffer(&self, page: usize) -> u16 {
        (self.header(page).target_buffer.load(Ordering::Relaxed) & 0xffff) as u16
    }

    /// Copy the whole page into `dst` (at least [`PAGE_SIZE`] bytes).
    /// Call only while holding the page's chunks in `BeingRead`.
    pub fn copy_page_into(&self, page: usize, dst: &mut [u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(self.page_base(page), dst.as_mut_ptr(), PAGE_SIZE);
        }
    }

    /// Header snapshot and payload of one chunk, with no state check.
    /// Call only while holding the chunk in `BeingRead` (the payload is
    /// not stable under any other state).
    pub fn get_chunk_unchecked(
        &self,
        page: usize,
        layout: PageLayout,
        idx: usize,
    ) -> (ChunkHeaderSnapshot, &[u8]) {
        let ch = self.chunk_header(page, layout, idx);
        let header = ChunkHeaderSnapshot {
            ids: ch.ids.load(Ordering::Relaxed),
            packets: ch.packets.load(Ordering::Relaxed),
        };
        let payload = unsafe {
            std::slice::from_raw_parts(
                self.page_base(page)
                    .add(layout.chunk_offset(idx) + CHUNK_HEADER_SIZE),
                layout.payload_size(),
            )
        };
        (header, payload)
    }

    // ---- service side -------------------------------------------------

    /// Try to take every `Complete` chunk of the page into `BeingRead` in
    /// one atomic step. Fails without side effects if any chunk is being
    /// written or already being read, or the page is unpartitioned.
    pub fn try_acquire_all_chunks_for_reading(&self, page: usize) -> bool {
        let hdr = self.header(page);
        let mut word = hdr.layout_word.load(Ordering::Acquire);
        loop {
            let Some(layout) = PageLayout::from_bits(layout_bits(word)) else {
                return false;
            };
            let mut next = word;
            for idx in 0..layout.num_chunks() {
                match ChunkState::from_bits(chunk_state_bits(word, idx)) {
                    ChunkState::Free => {}
                    ChunkState::Complete => {
                        next = with_chunk_state(next, idx, ChunkState::BeingRead)
                    }
                    _ => return false,
                }
            }
            match hdr.layout_word.compare_exchange(
                word,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    /// Forced variant used after the stall deadline: chunks stuck in
    /// `BeingWritten` are demoted to `Free` (their content is lost) and
    /// `Complete` chunks are salvaged into `BeingRead`.
    ///
    /// Returns `None` if the page is unpartitioned or a chunk is already
    /// `BeingRead` (which only the caller itself could have caused).
    pub fn force_acquire_all_chunks_for_reading(&self, page: usize) -> Option<ForcedAcquisition> {
        let hdr = self.header(page);
        let mut word = hdr.layout_word.load(Ordering::Acquire);
        loop {
            let layout = PageLayout::from_bits(layout_bits(word))?;
            let mut next = word;
            let mut outcome = ForcedAcquisition::default();
            for idx in 0..layout.num_chunks() {
                match ChunkState::from_bits(chunk_state_bits(word, idx)) {
                    ChunkState::Free => {}
                    ChunkState::Complete => {
                        next = with_chunk_state(next, idx, ChunkState::BeingRead);
                        outcome.salvaged += 1;
                    }
                    ChunkState::BeingWritten => {
                        next = with_chunk_state(next, idx, ChunkState::Free);
                        outcome.demoted += 1;
                    }
                    ChunkState::BeingRead => return None,
                }
            }
            match hdr.layout_word.compare_exchange(
                word,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(outcome),
                Err(actual) => word = actual,
            }
        }
    }

    /// Return the whole page to the producer: unpartitioned, all free.
    /// Call only after a successful acquisition and page copy.
    pub fn release_all_chunks_as_free(&self, page: usize) {
        let hdr = self.header(page);
        hdr.target_buffer.store(0, Ordering::Relaxed);
        hdr.layout_word.store(0, Ordering::Release);
    }

    // ---- producer side ------------------------------------------------

    /// Stamp the destination trace buffer for this page. Set at first
    /// write; published to the service by the chunk-completion release.
    pub fn set_target_buffer(&self, page: usize, buffer_id: u16) {
        self.header(page)
            .target_buffer
            .store(u32::from(buffer_id), Ordering::Relaxed);
    }

    /// Acquire one chunk for writing. A free page is partitioned with
    /// `layout` on the spot; a partitioned page must match `layout` and
    /// have the chunk free.
    pub fn try_acquire_chunk_for_writing(
        &self,
        page: usize,
        chunk_idx: usize,
        layout: PageLayout,
        writer_id: u16,
        chunk_id: u16,
    ) -> Option<ChunkWriter> {
        if chunk_idx >= layout.num_chunks() {
            return None;
        }
        let hdr = self.header(page);
        let mut word = hdr.layout_word.load(Ordering::Relaxed);
        loop {
            let next = if word == 0 {
                ((layout as u32) << LAYOUT_SHIFT)
                    | with_chunk_state(0, chunk_idx, ChunkState::BeingWritten)
            } else {
                if layout_bits(word) != layout as u32 {
                    return None;
                }
                if ChunkState::from_bits(chunk_state_bits(word, chunk_idx)) != ChunkState::Free {
                    return None;
                }
                with_chunk_state(word, chunk_idx, ChunkState::BeingWritten)
            };
            match hdr
                .layout_word
                .compare_exchange(word, next, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => word = actual,
            }
        }

        let ch = self.chunk_header(page, layout, chunk_idx);
        ch.ids.store(
            u32::from(writer_id) | (u32::from(chunk_id) << 16),
            Ordering::Relaxed,
        );
        ch.packets.store(0, Ordering::Relaxed);

        Some(ChunkWriter {
            abi: self.clone(),
            page,
            layout,
            chunk_idx,
            len: 0,
            packets: 0,
        })
    }
}

/// Producer-side handle to one chunk in the `BeingWritten` state.
///
/// Dropping the handle without releasing leaves the chunk stuck in
/// `BeingWritten`; the service's stall sweep will eventually reclaim it,
/// which is exactly what happens when a producer crashes mid-write.
pub struct ChunkWriter {
    abi: ShmAbi,
    page: usize,
    layout: PageLayout,
    chunk_idx: usize,
    len: usize,
    packets: u16,
}

impl ChunkWriter {
    pub fn page(&self) -> usize {
        self.page
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_idx
    }

    pub fn remaining(&self) -> usize {
        self.layout.payload_size() - self.len
    }

    pub fn packet_count(&self) -> u16 {
        self.packets
    }

    fn payload_base(&self) -> *mut u8 {
        unsafe {
            self.abi
                .page_base(self.page)
                .add(self.layout.chunk_offset(self.chunk_idx) + CHUNK_HEADER_SIZE)
        }
    }

    /// Append one varint-length-prefixed fragment to the chunk payload.
    pub fn push_fragment(&mut self, bytes: &[u8]) -> Result<(), ShmError> {
        let need = varint::encoded_len(bytes.len() as u64) + bytes.len();
        if need > self.remaining() {
            return Err(ShmError::FragmentTooLarge {
                got: bytes.len(),
                room: self.remaining(),
            });
        }
        let mut prefix = [0u8; varint::MAX_VARINT_LEN];
        let prefix_len = varint::encode(bytes.len() as u64, &mut prefix);
        unsafe {
            let dst = self.payload_base().add(self.len);
            std::ptr::copy_nonoverlapping(prefix.as_ptr(), dst, prefix_len);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.add(prefix_len), bytes.len());
        }
        self.len += need;
        self.packets += 1;
        Ok(())
    }

    /// Publish the chunk: store the final packet count and flags, then
    /// transition `BeingWritten -> Complete` with release ordering.
    pub fn release_as_complete(self, flags: u8) {
        let ch = self.abi.chunk_header(self.page, self.layout, self.chunk_idx);
        ch.packets.store(
            u32::from(self.packets) | (u32::from(flags) << 16),
            Ordering::Relaxed,
        );

        let hdr = self.abi.header(self.page);
        let mut word = hdr.layout_word.load(Ordering::Relaxed);
        loop {
            debug_assert_eq!(
                ChunkState::from_bits(chunk_state_bits(word, self.chunk_idx)),
                ChunkState::BeingWritten
            );
            let next = with_chunk_state(word, self.chunk_idx, ChunkState::Complete);
            match hdr
                .layout_word
                .compare_exchange(word, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::PAGE_SIZE;

    /// Page-aligned backing storage for ABI tests.
    #[repr(align(4096))]
    #[derive(Copy, Clone)]
    pub struct PageBuf(pub [u8; PAGE_SIZE]);

    pub fn region(pages: usize) -> Vec<PageBuf> {
        vec![PageBuf([0; PAGE_SIZE]); pages]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abi_over(buf: &mut [testutil::PageBuf]) -> ShmAbi {
        let len = buf.len() * PAGE_SIZE;
        unsafe { ShmAbi::from_raw(buf.as_mut_ptr() as *mut u8, len).expect("abi") }
    }

    #[test]
    fn layout_geometry_fits_the_page() {
        for layout in [
            PageLayout::One,
            PageLayout::Two,
            PageLayout::Four,
            PageLayout::Seven,
            PageLayout::Fourteen,
        ] {
            assert!(layout.num_chunks() <= MAX_CHUNKS_PER_PAGE);
            assert_eq!(layout.chunk_size() % 4, 0, "chunk headers need alignment");
            let end = layout.chunk_offset(layout.num_chunks() - 1) + layout.chunk_size();
            assert!(end <= PAGE_SIZE);
        }
        assert_eq!(num_chunks_for_layout(0), 0);
        assert_eq!(num_chunks_for_layout(6), 0);
        assert_eq!(num_chunks_for_layout(7), 0);
    }

    #[test]
    fn bad_regions_are_rejected() {
        let mut buf = testutil::region(1);
        let base = buf.as_mut_ptr() as *mut u8;
        assert!(unsafe { ShmAbi::from_raw(base, PAGE_SIZE - 1) }.is_err());
        assert!(unsafe { ShmAbi::from_raw(base, 0) }.is_err());
        assert!(unsafe { ShmAbi::from_raw(base.add(1), PAGE_SIZE) }.is_err());
    }

    #[test]
    fn write_release_acquire_roundtrip() {
        let mut buf = testutil::region(2);
        let abi = abi_over(&mut buf);

        assert!(abi.is_page_free(0));
        let mut w = abi
            .try_acquire_chunk_for_writing(0, 0, PageLayout::Four, 7, 42)
            .expect("acquire for writing");
        abi.set_target_buffer(0, 3);
        w.push_fragment(b"hello").unwrap();
        w.push_fragment(b"world!").unwrap();

        // Mid-write the page is neither free nor complete nor acquirable.
        assert!(!abi.is_page_free(0));
        assert!(!abi.is_page_complete(0));
        assert!(!abi.try_acquire_all_chunks_for_reading(0));

        w.release_as_complete(0);
        assert!(abi.is_page_complete(0));
        assert_eq!(abi.target_buffer(0), 3);
        assert!(abi.try_acquire_all_chunks_for_reading(0));
        assert_eq!(abi.chunk_state(0, 0), ChunkState::BeingRead);

        let (header, payload) = abi.get_chunk_unchecked(0, PageLayout::Four, 0);
        assert_eq!(header.writer_id(), 7);
        assert_eq!(header.packet_count(), 2);
        let (len, used) = varint::decode(payload).unwrap();
        assert_eq!(&payload[used..used + len as usize], b"hello");

        let mut page = [0u8; PAGE_SIZE];
        abi.copy_page_into(0, &mut page);
        let hdr = PageHeaderSnapshot::read(&page);
        let layout = hdr.layout().unwrap();
        assert_eq!(layout, PageLayout::Four);
        let ch = ChunkHeaderSnapshot::read(&page, layout, 0);
        assert_eq!(ch.writer_id(), 7);
        assert_eq!(ch.chunk_id(), 42);
        assert_eq!(ch.packet_count(), 2);

        let payload = chunk_payload(&page, layout, 0);
        let (len, used) = varint::decode(payload).unwrap();
        assert_eq!(&payload[used..used + len as usize], b"hello");

        abi.release_all_chunks_as_free(0);
        assert!(abi.is_page_free(0));
        assert_eq!(abi.target_buffer(0), 0);
    }

    #[test]
    fn acquire_fails_while_any_chunk_is_being_written() {
        let mut buf = testutil::region(1);
        let abi = abi_over(&mut buf);

        let first = abi
            .try_acquire_chunk_for_writing(0, 0, PageLayout::Two, 1, 0)
            .unwrap();
        first.release_as_complete(0);
        let _second = abi
            .try_acquire_chunk_for_writing(0, 1, PageLayout::Two, 1, 1)
            .unwrap();

        assert!(!abi.is_page_complete(0));
        assert!(!abi.try_acquire_all_chunks_for_reading(0));
        // Failure must not have committed anything.
        assert_eq!(abi.chunk_state(0, 0), ChunkState::Complete);
        assert_eq!(abi.chunk_state(0, 1), ChunkState::BeingWritten);
    }

    #[test]
    fn forced_acquisition_demotes_stuck_writers() {
        let mut buf = testutil::region(1);
        let abi = abi_over(&mut buf);

        let done = abi
            .try_acquire_chunk_for_writing(0, 0, PageLayout::Four, 1, 0)
            .unwrap();
        done.release_as_complete(0);
        // Simulated crash: acquired but never released.
        let stuck = abi
            .try_acquire_chunk_for_writing(0, 1, PageLayout::Four, 1, 1)
            .unwrap();
        std::mem::forget(stuck);

        let outcome = abi.force_acquire_all_chunks_for_reading(0).expect("forced");
        assert_eq!(outcome.salvaged, 1);
        assert_eq!(outcome.demoted, 1);
        assert_eq!(abi.chunk_state(0, 0), ChunkState::BeingRead);
        assert_eq!(abi.chunk_state(0, 1), ChunkState::Free);

        abi.release_all_chunks_as_free(0);
        // Subsequent writes on the same page proceed.
        assert!(abi
            .try_acquire_chunk_for_writing(0, 1, PageLayout::Four, 1, 2)
            .is_some());
    }

    #[test]
    fn layout_mismatch_and_taken_chunks_are_refused() {
        let mut buf = testutil::region(1);
        let abi = abi_over(&mut buf);

        let w = abi
            .try_acquire_chunk_for_writing(0, 0, PageLayout::Seven, 1, 0)
            .unwrap();
        assert!(abi
            .try_acquire_chunk_for_writing(0, 1, PageLayout::Two, 1, 1)
            .is_none());
        assert!(abi
            .try_acquire_chunk_for_writing(0, 0, PageLayout::Seven, 1, 1)
            .is_none());
        // Out-of-range chunk index for the layout.
        assert!(abi
            .try_acquire_chunk_for_writing(0, 7, PageLayout::Seven, 1, 1)
            .is_none());
        w.release_as_complete(0);
    }

    #[test]
    fn unknown_layout_bits_read_as_unreadable_page() {
        let mut buf = testutil::region(1);
        // Forge a header with a layout id outside the closed set.
        let forged: u32 = 7 << 28;
        buf[0].0[..4].copy_from_slice(&forged.to_le_bytes());
        let abi = abi_over(&mut buf);

        assert!(abi.page_layout(0).is_none());
        assert!(!abi.is_page_complete(0));
        assert!(!abi.try_acquire_all_chunks_for_reading(0));
        assert!(abi.force_acquire_all_chunks_for_reading(0).is_none());
    }
}
