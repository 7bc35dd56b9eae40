//! Producer-side packet stream writer.
//!
//! One `PacketStreamWriter` is one logical stream (one writer id) of
//! varint-framed packets into a shared-memory region. Packets that do not
//! fit the current chunk are split across chunks with the continuation
//! flags set, so the service can stitch the fragments back together.

use crate::{
    chunk_flags, varint, ChunkState, ChunkWriter, PageLayout, ShmAbi, ShmError,
};

pub struct PacketStreamWriter {
    abi: ShmAbi,
    layout: PageLayout,
    writer_id: u16,
    target_buffer: u16,
    next_chunk_id: u16,
    cur: Option<ChunkWriter>,
    cur_flags: u8,
    pending_first: bool,
    changed_pages: Vec<u32>,
    scan_cursor: usize,
}

impl PacketStreamWriter {
    pub fn new(abi: ShmAbi, layout: PageLayout, writer_id: u16, target_buffer: u16) -> Self {
        PacketStreamWriter {
            abi,
            layout,
            writer_id,
            target_buffer,
            next_chunk_id: 0,
            cur: None,
            cur_flags: 0,
            pending_first: false,
            changed_pages: Vec::new(),
            scan_cursor: 0,
        }
    }

    pub fn writer_id(&self) -> u16 {
        self.writer_id
    }

    /// Write one whole packet, splitting it across as many chunks as it
    /// needs. On `NoFreeChunk` the region is saturated and the packet is
    /// lost (possibly a partial fragment of it was already staged; the
    /// service discards the orphaned tail on reassembly).
    pub fn write_packet(&mut self, packet: &[u8]) -> Result<(), ShmError> {
        let mut offset = 0usize;
        loop {
            if let Err(err) = self.ensure_chunk() {
                self.pending_first = false;
                return Err(err);
            }
            let w = self.cur.as_mut().expect("chunk acquired");
            let rest = packet.len() - offset;
            let room = w.remaining();

            if rest == 0 {
                // Zero-length packet: just the varint 0 prefix.
                if room >= 1 {
                    w.push_fragment(&[])?;
                    return Ok(());
                }
                self.retire_chunk(false);
                continue;
            }

            let take = max_fragment_len(room, rest);
            if take == 0 {
                // Not even a one-byte fragment fits; move on.
                self.retire_chunk(false);
                continue;
            }
            w.push_fragment(&packet[offset..offset + take])?;
            offset += take;
            if offset == packet.len() {
                return Ok(());
            }
            self.retire_chunk(true);
        }
    }

    /// Publish the chunk currently being filled so the service can read
    /// everything written so far.
    pub fn flush(&mut self) {
        self.retire_chunk(false);
    }

    /// Pages touched since the last call, in the order they were retired.
    /// Feed these to the service's shared-memory-update notification.
    pub fn take_changed_pages(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.changed_pages)
    }

    fn ensure_chunk(&mut self) -> Result<(), ShmError> {
        if self.cur.is_some() {
            return Ok(());
        }
        let num_pages = self.abi.num_pages();
        for step in 0..num_pages {
            let page = (self.scan_cursor + step) % num_pages;
            if !self.abi.is_page_free(page)
                && (self.abi.page_layout(page) != Some(self.layout)
                    || self.abi.target_buffer(page) != self.target_buffer)
            {
                continue;
            }
            for idx in 0..self.layout.num_chunks() {
                if self.abi.chunk_state(page, idx) != ChunkState::Free {
                    continue;
                }
                if let Some(w) = self.abi.try_acquire_chunk_for_writing(
                    page,
                    idx,
                    self.layout,
                    self.writer_id,
                    self.next_chunk_id,
                ) {
                    self.abi.set_target_buffer(page, self.target_buffer);
                    self.next_chunk_id = self.next_chunk_id.wrapping_add(1);
                    self.scan_cursor = page;
                    self.cur_flags = if self.pending_first {
                        chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK
                    } else {
                        0
                    };
                    self.pending_first = false;
                    self.cur = Some(w);
                    return Ok(());
                }
            }
        }
        Err(ShmError::NoFreeChunk)
    }

    fn retire_chunk(&mut self, continues: bool) {
        if let Some(w) = self.cur.take() {
            let page = w.page() as u32;
            let mut flags = self.cur_flags;
            if continues {
                flags |= chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK;
            }
            w.release_as_complete(flags);
            if !self.changed_pages.contains(&page) {
                self.changed_pages.push(page);
            }
            self.pending_first = continues;
        }
    }
}

/// Largest fragment of `want` bytes whose varint prefix plus body fits in
/// `room` bytes of chunk payload.
fn max_fragment_len(room: usize, want: usize) -> usize {
    if room == 0 {
        return 0;
    }
    let mut n = want.min(room - 1);
    while n > 0 && varint::encoded_len(n as u64) + n > room {
        n -= 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::{chunk_payload, ChunkHeaderSnapshot, PageHeaderSnapshot, PAGE_SIZE};

    fn abi_over(buf: &mut [testutil::PageBuf]) -> ShmAbi {
        let len = buf.len() * PAGE_SIZE;
        unsafe { ShmAbi::from_raw(buf.as_mut_ptr() as *mut u8, len).expect("abi") }
    }

    fn snapshot_page(abi: &ShmAbi, page: usize) -> [u8; PAGE_SIZE] {
        let mut out = [0u8; PAGE_SIZE];
        abi.copy_page_into(page, &mut out);
        out
    }

    fn parse_fragments(page: &[u8], layout: PageLayout, idx: usize) -> Vec<Vec<u8>> {
        let hdr = ChunkHeaderSnapshot::read(page, layout, idx);
        let payload = chunk_payload(page, layout, idx);
        let mut frags = Vec::new();
        let mut off = 0;
        for _ in 0..hdr.packet_count() {
            let (len, used) = varint::decode(&payload[off..]).expect("varint");
            off += used;
            frags.push(payload[off..off + len as usize].to_vec());
            off += len as usize;
        }
        frags
    }

    #[test]
    fn packets_land_in_one_chunk_in_order() {
        let mut buf = testutil::region(1);
        let abi = abi_over(&mut buf);
        let mut w = PacketStreamWriter::new(abi.clone(), PageLayout::One, 1, 9);

        for i in 0..10 {
            w.write_packet(format!("evt_{i}").as_bytes()).unwrap();
        }
        w.flush();
        assert_eq!(w.take_changed_pages(), vec![0]);

        assert!(abi.try_acquire_all_chunks_for_reading(0));
        let page = snapshot_page(&abi, 0);
        let hdr = PageHeaderSnapshot::read(&page);
        assert_eq!(hdr.target_buffer, 9);
        let frags = parse_fragments(&page, PageLayout::One, 0);
        assert_eq!(frags.len(), 10);
        for (i, frag) in frags.iter().enumerate() {
            assert_eq!(frag, format!("evt_{i}").as_bytes());
        }
        let ch = ChunkHeaderSnapshot::read(&page, PageLayout::One, 0);
        assert_eq!(ch.flags(), 0);
        assert_eq!(ch.chunk_id(), 0);
    }

    #[test]
    fn oversize_packet_spans_chunks_with_continuation_flags() {
        let mut buf = testutil::region(2);
        let abi = abi_over(&mut buf);
        let mut w = PacketStreamWriter::new(abi.clone(), PageLayout::One, 3, 1);

        let packet: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        w.write_packet(&packet).unwrap();
        w.flush();
        let changed = w.take_changed_pages();
        assert_eq!(changed, vec![0, 1]);

        assert!(abi.try_acquire_all_chunks_for_reading(0));
        assert!(abi.try_acquire_all_chunks_for_reading(1));
        let first = snapshot_page(&abi, 0);
        let second = snapshot_page(&abi, 1);

        let h0 = ChunkHeaderSnapshot::read(&first, PageLayout::One, 0);
        let h1 = ChunkHeaderSnapshot::read(&second, PageLayout::One, 0);
        assert_eq!(
            h0.flags(),
            chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK
        );
        assert_eq!(
            h1.flags(),
            chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK
        );
        assert_eq!(h1.chunk_id(), h0.chunk_id().wrapping_add(1));

        let mut rebuilt = parse_fragments(&first, PageLayout::One, 0).concat();
        rebuilt.extend(parse_fragments(&second, PageLayout::One, 0).concat());
        assert_eq!(rebuilt, packet);
    }

    #[test]
    fn exact_fit_packet_does_not_set_a_continuation_flag() {
        let mut buf = testutil::region(1);
        let abi = abi_over(&mut buf);
        let mut w = PacketStreamWriter::new(abi.clone(), PageLayout::One, 1, 1);

        // Payload is 4080 bytes; a 2-byte varint prefix leaves 4078 for
        // the body, filling the chunk to the last byte.
        let body = vec![0xa5u8; PageLayout::One.payload_size() - 2];
        w.write_packet(&body).unwrap();
        w.flush();

        assert!(abi.try_acquire_all_chunks_for_reading(0));
        let page = snapshot_page(&abi, 0);
        let hdr = ChunkHeaderSnapshot::read(&page, PageLayout::One, 0);
        assert_eq!(hdr.packet_count(), 1);
        assert_eq!(hdr.flags(), 0);
        let frags = parse_fragments(&page, PageLayout::One, 0);
        assert_eq!(frags[0], body);
    }

    #[test]
    fn saturated_region_reports_no_free_chunk() {
        let mut buf = testutil::region(1);
        let abi = abi_over(&mut buf);
        let mut w = PacketStreamWriter::new(abi.clone(), PageLayout::One, 1, 1);

        w.write_packet(&[1u8; 3000]).unwrap();
        w.flush();
        // The only page's only chunk is Complete and un-drained.
        let err = w.write_packet(&[2u8; 8]).unwrap_err();
        assert!(matches!(err, ShmError::NoFreeChunk));

        // Once the service drains the page the writer recovers.
        assert!(abi.try_acquire_all_chunks_for_reading(0));
        abi.release_all_chunks_as_free(0);
        w.write_packet(&[2u8; 8]).unwrap();
    }
}
