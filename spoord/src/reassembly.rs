//! Packet reassembly over drained chunks.
//!
//! Chunks carry varint-length-prefixed packet fragments. Stitching is
//! strictly per `(producer, writer)` stream: fragments from different
//! writers never join, and within one writer chunks must arrive with
//! monotonically increasing (wrapping) chunk ids. A missing chunk id
//! discards whatever packet was under construction for that writer —
//! better to lose one packet than to deliver a frankenstein.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use spoor_shm::{chunk_flags, varint};

use crate::buffer::ChunkRecord;
use crate::ids::{ProducerId, WriterId};
use crate::metrics::Metrics;

pub struct PacketAssembler {
    max_packet_bytes: usize,
    metrics: Arc<Metrics>,
    streams: HashMap<(ProducerId, WriterId), WriterStream>,
}

#[derive(Default)]
struct WriterStream {
    next_chunk_id: Option<u16>,
    pending: Pending,
}

#[derive(Default)]
enum Pending {
    #[default]
    None,
    /// A packet under construction, waiting for its next fragment.
    Building(BytesMut),
    /// The packet under construction blew the size cap; its remaining
    /// fragments are swallowed until the packet boundary passes.
    Oversize,
}

impl PacketAssembler {
    pub fn new(max_packet_bytes: usize, metrics: Arc<Metrics>) -> Self {
        PacketAssembler {
            max_packet_bytes,
            metrics,
            streams: HashMap::new(),
        }
    }

    /// Feed one drained chunk, appending completed packets to `out` in
    /// write order.
    pub fn push_chunk(&mut self, rec: &ChunkRecord, out: &mut Vec<Bytes>) {
        let metrics = &self.metrics;
        let max = self.max_packet_bytes;
        let stream = self
            .streams
            .entry((rec.producer, rec.writer_id))
            .or_default();

        if let Some(expected) = stream.next_chunk_id {
            if rec.chunk_id != expected {
                discard_partial(metrics, stream);
            }
        }
        stream.next_chunk_id = Some(rec.chunk_id.wrapping_add(1));

        let payload = &rec.payload;
        let count = rec.packet_count as usize;
        let mut off = 0usize;
        for i in 0..count {
            let Some((len, used)) = varint::decode(&payload[off..]) else {
                abort_chunk(metrics, stream);
                return;
            };
            off += used;
            let len = len as usize;
            if len > payload.len() - off {
                // Length runs past the chunk end: malformed chunk.
                abort_chunk(metrics, stream);
                return;
            }
            let frag = payload.slice(off..off + len);
            off += len;

            let continues_prev =
                i == 0 && rec.flags & chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK != 0;
            let continues_next = i + 1 == count
                && rec.flags & chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK != 0;
            accept_fragment(metrics, max, stream, frag, continues_prev, continues_next, out);
        }
    }

    /// Drop the stitching state for a disconnected producer.
    pub fn forget_producer(&mut self, producer: ProducerId) {
        self.streams.retain(|(pid, _), _| *pid != producer);
    }
}

fn discard_partial(metrics: &Metrics, stream: &mut WriterStream) {
    if matches!(stream.pending, Pending::Building(_)) {
        metrics.inc_packets_discarded_on_gap();
    }
    stream.pending = Pending::None;
}

fn abort_chunk(metrics: &Metrics, stream: &mut WriterStream) {
    metrics.inc_chunk_parse_errors();
    // The chunk is untrustworthy; anything it was continuing is too.
    discard_partial(metrics, stream);
}

fn accept_fragment(
    metrics: &Metrics,
    max_packet_bytes: usize,
    stream: &mut WriterStream,
    frag: Bytes,
    continues_prev: bool,
    continues_next: bool,
    out: &mut Vec<Bytes>,
) {
    if continues_prev {
        match &mut stream.pending {
            Pending::Building(partial) => {
                partial.extend_from_slice(&frag);
                if partial.len() > max_packet_bytes {
                    metrics.inc_packets_dropped_oversize();
                    stream.pending = Pending::Oversize;
                }
            }
            Pending::Oversize => {}
            Pending::None => {
                // Tail of a packet whose head was lost (ring lap or
                // writer restart).
                metrics.inc_fragments_orphaned();
            }
        }
        if !continues_next {
            // Packet boundary: emit if it survived.
            if let Pending::Building(done) = std::mem::replace(&mut stream.pending, Pending::None)
            {
                out.push(done.freeze());
            }
        }
        return;
    }

    // A fresh packet starts here. A leftover partial means the previous
    // chunk promised a continuation that never came.
    discard_partial(metrics, stream);

    if continues_next {
        if frag.len() > max_packet_bytes {
            metrics.inc_packets_dropped_oversize();
            stream.pending = Pending::Oversize;
        } else {
            stream.pending = Pending::Building(BytesMut::from(frag.as_ref()));
        }
    } else if frag.len() > max_packet_bytes {
        metrics.inc_packets_dropped_oversize();
    } else {
        out.push(frag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(
        producer: ProducerId,
        writer_id: WriterId,
        chunk_id: u16,
        flags: u8,
        fragments: &[&[u8]],
    ) -> ChunkRecord {
        let mut payload = Vec::new();
        let mut prefix = [0u8; varint::MAX_VARINT_LEN];
        for frag in fragments {
            let n = varint::encode(frag.len() as u64, &mut prefix);
            payload.extend_from_slice(&prefix[..n]);
            payload.extend_from_slice(frag);
        }
        ChunkRecord {
            producer,
            writer_id,
            chunk_id,
            packet_count: fragments.len() as u16,
            flags,
            payload: Bytes::from(payload),
        }
    }

    fn assembler() -> PacketAssembler {
        PacketAssembler::new(256 * 1024, Arc::new(Metrics::new()))
    }

    #[test]
    fn whole_packets_come_out_in_write_order() {
        let mut asm = assembler();
        let mut out = Vec::new();
        let bodies: Vec<Vec<u8>> = (0..10).map(|i| format!("evt_{i}").into_bytes()).collect();
        let frags: Vec<&[u8]> = bodies.iter().map(|b| b.as_slice()).collect();
        asm.push_chunk(&chunk(1, 1, 0, 0, &frags), &mut out);
        assert_eq!(out.len(), 10);
        for (i, p) in out.iter().enumerate() {
            assert_eq!(p.as_ref(), format!("evt_{i}").as_bytes());
        }
    }

    #[test]
    fn spanning_packet_is_stitched_back_together() {
        let mut asm = assembler();
        let mut out = Vec::new();
        let body: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        let (head, tail) = body.split_at(4078);

        asm.push_chunk(
            &chunk(
                1,
                3,
                0,
                chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK,
                &[head],
            ),
            &mut out,
        );
        assert!(out.is_empty(), "no packet before the tail arrives");
        asm.push_chunk(
            &chunk(
                1,
                3,
                1,
                chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK,
                &[tail],
            ),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 6000);
        assert_eq!(out[0].as_ref(), body.as_slice());
    }

    #[test]
    fn middle_fragments_keep_the_packet_open() {
        let mut asm = assembler();
        let mut out = Vec::new();
        let both = chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK
            | chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK;
        asm.push_chunk(
            &chunk(
                1,
                1,
                0,
                chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK,
                &[b"aa"],
            ),
            &mut out,
        );
        asm.push_chunk(&chunk(1, 1, 1, both, &[b"bb"]), &mut out);
        asm.push_chunk(
            &chunk(
                1,
                1,
                2,
                chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK,
                &[b"cc"],
            ),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref(), b"aabbcc");
    }

    #[test]
    fn chunk_id_gap_discards_the_partial() {
        let metrics = Arc::new(Metrics::new());
        let mut asm = PacketAssembler::new(1 << 20, metrics.clone());
        let mut out = Vec::new();
        asm.push_chunk(
            &chunk(
                1,
                1,
                0,
                chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK,
                &[b"head"],
            ),
            &mut out,
        );
        // Chunk 1 was lost in a ring lap; chunk 2 carries an unrelated
        // complete packet.
        asm.push_chunk(&chunk(1, 1, 2, 0, &[b"fresh"]), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref(), b"fresh");
        assert_eq!(metrics.packets_discarded_on_gap(), 1);
    }

    #[test]
    fn chunk_ids_wrap_without_a_false_gap() {
        let mut asm = assembler();
        let mut out = Vec::new();
        asm.push_chunk(
            &chunk(
                1,
                1,
                u16::MAX,
                chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK,
                &[b"wrap_"],
            ),
            &mut out,
        );
        asm.push_chunk(
            &chunk(
                1,
                1,
                0,
                chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK,
                &[b"around"],
            ),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref(), b"wrap_around");
    }

    #[test]
    fn writers_stitch_independently() {
        let mut asm = assembler();
        let mut out = Vec::new();
        asm.push_chunk(
            &chunk(
                1,
                1,
                0,
                chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK,
                &[b"w1-"],
            ),
            &mut out,
        );
        asm.push_chunk(&chunk(1, 2, 0, 0, &[b"w2 whole"]), &mut out);
        asm.push_chunk(
            &chunk(
                1,
                1,
                1,
                chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK,
                &[b"tail"],
            ),
            &mut out,
        );
        // Same writer id on another producer is a different stream.
        asm.push_chunk(&chunk(9, 1, 0, 0, &[b"p9"]), &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref(), b"w2 whole");
        assert_eq!(out[1].as_ref(), b"w1-tail");
        assert_eq!(out[2].as_ref(), b"p9");
    }

    #[test]
    fn truncated_varint_aborts_the_chunk() {
        let metrics = Arc::new(Metrics::new());
        let mut asm = PacketAssembler::new(1 << 20, metrics.clone());
        let mut out = Vec::new();
        let rec = ChunkRecord {
            producer: 1,
            writer_id: 1,
            chunk_id: 0,
            packet_count: 2,
            flags: 0,
            // One good packet, then a length prefix pointing past the end.
            payload: Bytes::from_static(&[2, b'o', b'k', 0x7f, b'x']),
        };
        asm.push_chunk(&rec, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref(), b"ok");
        assert_eq!(metrics.chunk_parse_errors(), 1);
    }

    #[test]
    fn oversize_packets_are_dropped_not_delivered() {
        let metrics = Arc::new(Metrics::new());
        let mut asm = PacketAssembler::new(8, metrics.clone());
        let mut out = Vec::new();
        asm.push_chunk(
            &chunk(
                1,
                1,
                0,
                chunk_flags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK,
                &[b"123456"],
            ),
            &mut out,
        );
        asm.push_chunk(
            &chunk(
                1,
                1,
                1,
                chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK,
                &[b"7890ab"],
            ),
            &mut out,
        );
        // The next complete packet still makes it through.
        asm.push_chunk(&chunk(1, 1, 2, 0, &[b"small"]), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref(), b"small");
        assert_eq!(metrics.packets_dropped_oversize(), 1);
    }

    #[test]
    fn orphaned_continuation_is_counted_and_skipped() {
        let metrics = Arc::new(Metrics::new());
        let mut asm = PacketAssembler::new(1 << 20, metrics.clone());
        let mut out = Vec::new();
        // First chunk this stream ever sees claims to continue a packet.
        asm.push_chunk(
            &chunk(
                1,
                1,
                5,
                chunk_flags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK,
                &[b"tail", b"whole"],
            ),
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref(), b"whole");
        assert_eq!(metrics.fragments_orphaned(), 1);
    }
}
