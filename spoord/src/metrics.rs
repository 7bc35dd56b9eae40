use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::Serialize;

/// Global counters for the tracing service.
///
/// Counters are updated from the page-copy and reassembly paths so all
/// fields are atomic. Protocol violations, parse errors and data loss are
/// recovered locally and only show up here; no error class aborts the
/// service.
pub struct Metrics {
    pages_copied: AtomicU64,
    pages_overwritten: AtomicU64,
    pages_reaped: AtomicU64,
    chunks_demoted: AtomicU64,
    packets_emitted: AtomicU64,
    packets_dropped_oversize: AtomicU64,
    packets_discarded_on_gap: AtomicU64,
    fragments_orphaned: AtomicU64,
    chunk_parse_errors: AtomicU64,
    abi_violations: AtomicU64,
    unknown_target_buffers: AtomicU64,
    patches_applied: AtomicU64,
    patches_discarded: AtomicU64,
    flush_timeouts: AtomicU64,
    producers_evicted: AtomicU64,
    sessions_started: AtomicU64,
    sessions_freed: AtomicU64,
    pub start_time: SystemTime,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            pages_copied: AtomicU64::new(0),
            pages_overwritten: AtomicU64::new(0),
            pages_reaped: AtomicU64::new(0),
            chunks_demoted: AtomicU64::new(0),
            packets_emitted: AtomicU64::new(0),
            packets_dropped_oversize: AtomicU64::new(0),
            packets_discarded_on_gap: AtomicU64::new(0),
            fragments_orphaned: AtomicU64::new(0),
            chunk_parse_errors: AtomicU64::new(0),
            abi_violations: AtomicU64::new(0),
            unknown_target_buffers: AtomicU64::new(0),
            patches_applied: AtomicU64::new(0),
            patches_discarded: AtomicU64::new(0),
            flush_timeouts: AtomicU64::new(0),
            producers_evicted: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_freed: AtomicU64::new(0),
            start_time: SystemTime::now(),
        }
    }

    pub fn inc_pages_copied(&self) {
        self.pages_copied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pages_copied(&self) -> u64 {
        self.pages_copied.load(Ordering::Relaxed)
    }

    pub fn inc_pages_overwritten(&self) {
        self.pages_overwritten.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pages_overwritten(&self) -> u64 {
        self.pages_overwritten.load(Ordering::Relaxed)
    }

    pub fn inc_pages_reaped(&self) {
        self.pages_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pages_reaped(&self) -> u64 {
        self.pages_reaped.load(Ordering::Relaxed)
    }

    pub fn add_chunks_demoted(&self, count: u64) {
        self.chunks_demoted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn chunks_demoted(&self) -> u64 {
        self.chunks_demoted.load(Ordering::Relaxed)
    }

    pub fn add_packets_emitted(&self, count: u64) {
        self.packets_emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn packets_emitted(&self) -> u64 {
        self.packets_emitted.load(Ordering::Relaxed)
    }

    pub fn inc_packets_dropped_oversize(&self) {
        self.packets_dropped_oversize.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_dropped_oversize(&self) -> u64 {
        self.packets_dropped_oversize.load(Ordering::Relaxed)
    }

    pub fn inc_packets_discarded_on_gap(&self) {
        self.packets_discarded_on_gap.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_discarded_on_gap(&self) -> u64 {
        self.packets_discarded_on_gap.load(Ordering::Relaxed)
    }

    pub fn inc_fragments_orphaned(&self) {
        self.fragments_orphaned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragments_orphaned(&self) -> u64 {
        self.fragments_orphaned.load(Ordering::Relaxed)
    }

    pub fn inc_chunk_parse_errors(&self) {
        self.chunk_parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_parse_errors(&self) -> u64 {
        self.chunk_parse_errors.load(Ordering::Relaxed)
    }

    pub fn add_abi_violations(&self, count: u64) {
        self.abi_violations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn abi_violations(&self) -> u64 {
        self.abi_violations.load(Ordering::Relaxed)
    }

    pub fn inc_unknown_target_buffer(&self) {
        self.unknown_target_buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_target_buffers(&self) -> u64 {
        self.unknown_target_buffers.load(Ordering::Relaxed)
    }

    pub fn inc_patches_applied(&self) {
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn patches_applied(&self) -> u64 {
        self.patches_applied.load(Ordering::Relaxed)
    }

    pub fn inc_patches_discarded(&self) {
        self.patches_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn patches_discarded(&self) -> u64 {
        self.patches_discarded.load(Ordering::Relaxed)
    }

    pub fn inc_flush_timeouts(&self) {
        self.flush_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_timeouts(&self) -> u64 {
        self.flush_timeouts.load(Ordering::Relaxed)
    }

    pub fn inc_producers_evicted(&self) {
        self.producers_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn producers_evicted(&self) -> u64 {
        self.producers_evicted.load(Ordering::Relaxed)
    }

    pub fn inc_sessions_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn inc_sessions_freed(&self) {
        self.sessions_freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_freed(&self) -> u64 {
        self.sessions_freed.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    /// Counter part of the statistics read; the service fills in the
    /// registry gauges.
    pub fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            uptime_seconds: self.uptime_seconds(),
            pages_copied: self.pages_copied(),
            pages_overwritten: self.pages_overwritten(),
            pages_reaped: self.pages_reaped(),
            chunks_demoted: self.chunks_demoted(),
            packets_emitted: self.packets_emitted(),
            packets_dropped_oversize: self.packets_dropped_oversize(),
            packets_discarded_on_gap: self.packets_discarded_on_gap(),
            fragments_orphaned: self.fragments_orphaned(),
            chunk_parse_errors: self.chunk_parse_errors(),
            abi_violations: self.abi_violations(),
            unknown_target_buffers: self.unknown_target_buffers(),
            patches_applied: self.patches_applied(),
            patches_discarded: self.patches_discarded(),
            flush_timeouts: self.flush_timeouts(),
            producers_evicted: self.producers_evicted(),
            sessions_started: self.sessions_started(),
            sessions_freed: self.sessions_freed(),
            producers: 0,
            consumers: 0,
            sessions: 0,
            buffers_in_use: 0,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time statistics snapshot delivered to consumers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStats {
    pub uptime_seconds: u64,
    pub pages_copied: u64,
    pub pages_overwritten: u64,
    pub pages_reaped: u64,
    pub chunks_demoted: u64,
    pub packets_emitted: u64,
    pub packets_dropped_oversize: u64,
    pub packets_discarded_on_gap: u64,
    pub fragments_orphaned: u64,
    pub chunk_parse_errors: u64,
    pub abi_violations: u64,
    pub unknown_target_buffers: u64,
    pub patches_applied: u64,
    pub patches_discarded: u64,
    pub flush_timeouts: u64,
    pub producers_evicted: u64,
    pub sessions_started: u64,
    pub sessions_freed: u64,
    pub producers: usize,
    pub consumers: usize,
    pub sessions: usize,
    pub buffers_in_use: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_land_in_the_snapshot() {
        let m = Metrics::new();
        m.inc_pages_copied();
        m.inc_pages_copied();
        m.add_chunks_demoted(3);
        m.add_packets_emitted(10);
        m.inc_flush_timeouts();
        let snap = m.snapshot();
        assert_eq!(snap.pages_copied, 2);
        assert_eq!(snap.chunks_demoted, 3);
        assert_eq!(snap.packets_emitted, 10);
        assert_eq!(snap.flush_timeouts, 1);
        assert_eq!(snap.sessions_started, 0);
    }
}
