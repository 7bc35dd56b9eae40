//! The tracing service core.
//!
//! Owns every registry (producers, consumers, sessions, data sources by
//! name) plus the buffer-id pool, and orchestrates enable / disable /
//! read / free across them. All methods run on the single service task;
//! cross-component references are ids resolved through the registries at
//! use time, so cleanup can happen in any order.

mod session;

pub use session::{DataSourceInstance, SessionState, TracingSession};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};
use spoor_shm::ShmAbi;
use tokio::sync::mpsc;

use crate::buffer::TraceBuffer;
use crate::commit::{ChunkPatch, CommitDataRequest};
use crate::config::ServiceConfig;
use crate::endpoint::{ConsumerEntry, ConsumerEvent, ProducerEntry, ProducerEvent};
use crate::error::ServiceError;
use crate::ids::{
    BufferId, BufferIdAllocator, ChunkId, ConsumerId, DataSourceId, DataSourceInstanceId,
    FlushRequestId, ProducerId, TracingSessionId, WriterId,
};
use crate::metrics::{Metrics, ServiceStats};
use crate::reassembly::PacketAssembler;
use crate::shmem::SharedMemory;
use crate::trace_config::{DataSourceConfig, DataSourceDescriptor, TraceConfig, MAX_BUFFERS_PER_SESSION};

pub(crate) struct RegisteredDataSource {
    pub producer_id: ProducerId,
    pub data_source_id: DataSourceId,
    #[allow(dead_code)]
    pub descriptor: DataSourceDescriptor,
}

struct PendingFlush {
    session: TracingSessionId,
    outstanding: HashSet<ProducerId>,
}

#[derive(Default)]
struct PendingPatchList {
    patches: Vec<ChunkPatch>,
    sealed: bool,
}

pub struct TracingService {
    cfg: ServiceConfig,
    metrics: Arc<Metrics>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    sessions: HashMap<TracingSessionId, TracingSession>,
    data_sources: HashMap<String, Vec<RegisteredDataSource>>,
    buffer_ids: BufferIdAllocator,
    /// Global routing index: which session owns each live buffer id.
    buffers_by_id: HashMap<BufferId, TracingSessionId>,
    pending_flushes: HashMap<FlushRequestId, PendingFlush>,
    /// Out-of-band patches waiting for their chunk to be acquired.
    /// Applying removes the entry, enforcing at most one commit per
    /// `(producer, writer, chunk)`.
    pending_patches: HashMap<(ProducerId, WriterId, ChunkId), PendingPatchList>,
    last_producer_id: ProducerId,
    last_consumer_id: ConsumerId,
    last_session_id: TracingSessionId,
    last_instance_id: DataSourceInstanceId,
    last_flush_request_id: FlushRequestId,
}

impl TracingService {
    pub fn new(cfg: ServiceConfig, metrics: Arc<Metrics>) -> Self {
        TracingService {
            cfg,
            metrics,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            sessions: HashMap::new(),
            data_sources: HashMap::new(),
            buffer_ids: BufferIdAllocator::new(),
            buffers_by_id: HashMap::new(),
            pending_flushes: HashMap::new(),
            pending_patches: HashMap::new(),
            last_producer_id: 0,
            last_consumer_id: 0,
            last_session_id: 0,
            last_instance_id: 0,
            last_flush_request_id: 0,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.cfg
    }

    pub fn session(&self, id: TracingSessionId) -> Option<&TracingSession> {
        self.sessions.get(&id)
    }

    /// The statistics read: hot-path counters plus registry gauges.
    pub fn stats(&self) -> ServiceStats {
        let mut snap = self.metrics.snapshot();
        snap.producers = self.producers.len();
        snap.consumers = self.consumers.len();
        snap.sessions = self.sessions.len();
        snap.buffers_in_use = self.buffer_ids.in_use();
        snap
    }

    // ---- producer lifecycle -------------------------------------------

    /// Create the producer's shared-memory region and register it. A
    /// mapping failure rejects this producer and nothing else.
    pub fn connect_producer(
        &mut self,
        name: &str,
        shm_size_hint: usize,
    ) -> Result<
        (
            ProducerId,
            Arc<SharedMemory>,
            mpsc::UnboundedReceiver<ProducerEvent>,
        ),
        ServiceError,
    > {
        let shm = SharedMemory::allocate(shm_size_hint, &self.cfg)?;
        self.last_producer_id += 1;
        let id = self.last_producer_id;
        let (tx, rx) = mpsc::unbounded_channel();
        info!(
            "[service] producer {id} ({name}) connected, shm of {} pages",
            shm.num_pages()
        );
        self.producers
            .insert(id, ProducerEntry::new(id, name.to_string(), shm.clone(), tx));
        Ok((id, shm, rx))
    }

    /// Disconnect cascades: data sources unregister, instances are pruned
    /// from every session (the sessions keep running), outstanding
    /// flushes stop waiting on this producer.
    pub fn disconnect_producer(&mut self, producer_id: ProducerId) {
        let Some(entry) = self.producers.remove(&producer_id) else {
            return;
        };
        entry.post(ProducerEvent::Disconnected);
        self.data_sources.retain(|_, regs| {
            regs.retain(|r| r.producer_id != producer_id);
            !regs.is_empty()
        });
        for session in self.sessions.values_mut() {
            session.instances.remove(&producer_id);
            session.assembler.forget_producer(producer_id);
        }
        let mut completed = Vec::new();
        self.pending_flushes.retain(|rid, pf| {
            pf.outstanding.remove(&producer_id);
            if pf.outstanding.is_empty() {
                completed.push((*rid, pf.session));
                false
            } else {
                true
            }
        });
        for (rid, sid) in completed {
            self.post_flush_result(sid, rid, true);
        }
        self.pending_patches
            .retain(|(owner, _, _), _| *owner != producer_id);
        info!("[service] producer {producer_id} disconnected");
    }

    /// Returns the new data-source id, or 0 for a descriptor with an
    /// empty name (0 is the invalid id).
    pub fn register_data_source(
        &mut self,
        producer_id: ProducerId,
        descriptor: DataSourceDescriptor,
    ) -> Result<DataSourceId, ServiceError> {
        let entry = self
            .producers
            .get_mut(&producer_id)
            .ok_or(ServiceError::UnknownProducer(producer_id))?;
        if descriptor.name.is_empty() {
            warn!("[service] producer {producer_id} registered a data source with no name");
            return Ok(0);
        }
        entry.last_data_source_id += 1;
        let ds_id = entry.last_data_source_id;
        entry.data_sources.insert(ds_id, descriptor.clone());
        info!(
            "[service] producer {producer_id} registered data source {:?} (id {ds_id})",
            descriptor.name
        );
        self.data_sources
            .entry(descriptor.name.clone())
            .or_default()
            .push(RegisteredDataSource {
                producer_id,
                data_source_id: ds_id,
                descriptor: descriptor.clone(),
            });

        // Sessions that were already tracing this name pick the new
        // producer up immediately.
        let producer = self
            .producers
            .get(&producer_id)
            .expect("inserted on connect");
        for session in self.sessions.values_mut() {
            if session.state != SessionState::Tracing {
                continue;
            }
            let matching: Vec<DataSourceConfig> = session
                .config
                .data_sources
                .iter()
                .filter(|d| d.name == descriptor.name)
                .cloned()
                .collect();
            for cfg_ds in &matching {
                create_instance(&mut self.last_instance_id, session, producer, cfg_ds);
            }
        }
        Ok(ds_id)
    }

    pub fn unregister_data_source(&mut self, producer_id: ProducerId, ds_id: DataSourceId) {
        let Some(entry) = self.producers.get_mut(&producer_id) else {
            return;
        };
        let Some(descriptor) = entry.data_sources.remove(&ds_id) else {
            return;
        };
        if let Some(regs) = self.data_sources.get_mut(&descriptor.name) {
            regs.retain(|r| !(r.producer_id == producer_id && r.data_source_id == ds_id));
            if regs.is_empty() {
                self.data_sources.remove(&descriptor.name);
            }
        }
        let producer = self.producers.get(&producer_id).expect("fetched above");
        for session in self.sessions.values_mut() {
            let Some(instances) = session.instances.get_mut(&producer_id) else {
                continue;
            };
            instances.retain(|inst| {
                if inst.data_source == descriptor.name {
                    producer.post(ProducerEvent::TearDownDataSourceInstance {
                        instance_id: inst.id,
                    });
                    false
                } else {
                    true
                }
            });
            if instances.is_empty() {
                session.instances.remove(&producer_id);
            }
        }
        info!("[service] producer {producer_id} unregistered data source {:?}", descriptor.name);
    }

    // ---- consumer lifecycle -------------------------------------------

    pub fn connect_consumer(
        &mut self,
    ) -> (ConsumerId, mpsc::UnboundedReceiver<ConsumerEvent>) {
        self.last_consumer_id += 1;
        let id = self.last_consumer_id;
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.insert(id, ConsumerEntry::new(tx));
        info!("[service] consumer {id} connected");
        (id, rx)
    }

    /// A consumer that goes away implicitly frees its session.
    pub fn disconnect_consumer(&mut self, consumer_id: ConsumerId) {
        let Some(entry) = self.consumers.remove(&consumer_id) else {
            return;
        };
        entry.post(ConsumerEvent::Disconnected);
        if let Some(sid) = entry.session {
            let _ = self.free_session(sid);
        }
        info!("[service] consumer {consumer_id} disconnected");
    }

    // ---- session lifecycle --------------------------------------------

    pub fn enable_tracing(
        &mut self,
        consumer_id: ConsumerId,
        config: TraceConfig,
    ) -> Result<TracingSessionId, ServiceError> {
        let consumer = self
            .consumers
            .get(&consumer_id)
            .ok_or(ServiceError::UnknownConsumer(consumer_id))?;
        if consumer.session.is_some() {
            return Err(ServiceError::SessionAlreadyActive);
        }
        if config.buffers.len() > MAX_BUFFERS_PER_SESSION {
            return Err(ServiceError::TooManyBuffers {
                got: config.buffers.len(),
                max: MAX_BUFFERS_PER_SESSION,
            });
        }
        for ds in &config.data_sources {
            if ds.target_buffer as usize >= config.buffers.len() {
                return Err(ServiceError::TargetBufferOutOfRange {
                    name: ds.name.clone(),
                    index: ds.target_buffer,
                    buffers: config.buffers.len(),
                });
            }
            if !self.data_sources.contains_key(&ds.name) {
                return Err(ServiceError::UnknownDataSource(ds.name.clone()));
            }
        }

        // Allocate the log buffers. On any failure all ids and buffers
        // acquired so far are returned before reporting the error.
        let mut trace_buffers = Vec::with_capacity(config.buffers.len());
        let mut buffers_index = HashMap::new();
        let mut failure = None;
        for buffer_cfg in &config.buffers {
            let Some(global_id) = self.buffer_ids.allocate() else {
                failure = Some(ServiceError::BufferIdsExhausted);
                break;
            };
            match TraceBuffer::create(global_id, buffer_cfg.size_kb as usize * 1024) {
                Ok(buf) => {
                    buffers_index.insert(global_id, trace_buffers.len());
                    trace_buffers.push(buf);
                }
                Err(err) => {
                    self.buffer_ids.free(global_id);
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            for buf in &trace_buffers {
                self.buffer_ids.free(buf.id());
            }
            warn!("[service] enable failed for consumer {consumer_id}: {err}");
            return Err(err);
        }

        self.last_session_id += 1;
        let sid = self.last_session_id;
        for global_id in buffers_index.keys() {
            self.buffers_by_id.insert(*global_id, sid);
        }
        let mut session = TracingSession {
            id: sid,
            consumer: consumer_id,
            state: SessionState::Configured,
            trace_buffers,
            buffers_index,
            instances: HashMap::new(),
            assembler: PacketAssembler::new(self.cfg.max_packet_bytes, self.metrics.clone()),
            alive: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            config,
        };

        // Fan the data sources out to every producer offering them.
        let declared = session.config.data_sources.clone();
        for cfg_ds in &declared {
            let Some(regs) = self.data_sources.get(&cfg_ds.name) else {
                continue;
            };
            for reg in regs {
                let Some(producer) = self.producers.get(&reg.producer_id) else {
                    debug_assert!(false, "name index out of sync with producer registry");
                    continue;
                };
                create_instance(&mut self.last_instance_id, &mut session, producer, cfg_ds);
            }
        }
        session.state = SessionState::Tracing;
        info!(
            "[service] session {sid} tracing for consumer {consumer_id}: {} buffers, {} instances",
            session.trace_buffers.len(),
            session.instance_count()
        );
        self.sessions.insert(sid, session);
        self.consumers
            .get_mut(&consumer_id)
            .expect("checked above")
            .session = Some(sid);
        self.metrics.inc_sessions_started();
        Ok(sid)
    }

    pub fn disable_for_consumer(&mut self, consumer_id: ConsumerId) -> Result<(), ServiceError> {
        let sid = self.session_of(consumer_id)?;
        self.disable_session(sid)
    }

    /// Tear down every live instance and freeze the session. Buffers are
    /// kept so the consumer can still read.
    pub fn disable_session(&mut self, sid: TracingSessionId) -> Result<(), ServiceError> {
        let Some(session) = self.sessions.get_mut(&sid) else {
            debug!("[service] disable for unknown session {sid}");
            return Err(ServiceError::NoActiveSession);
        };
        for (producer_id, instances) in session.instances.drain() {
            // A missing producer legitimately happens if it disconnected.
            let Some(producer) = self.producers.get(&producer_id) else {
                continue;
            };
            for inst in instances {
                producer.post(ProducerEvent::TearDownDataSourceInstance {
                    instance_id: inst.id,
                });
            }
        }
        session.state = SessionState::Disabled;
        info!("[service] session {sid} disabled");
        Ok(())
    }

    /// Drain every buffer, reassemble, and post the packets to the
    /// consumer in batches; the final batch carries `has_more = false`.
    pub fn read_buffers(&mut self, consumer_id: ConsumerId) -> Result<(), ServiceError> {
        let sid = self.session_of(consumer_id)?;
        let session = self
            .sessions
            .get_mut(&sid)
            .ok_or(ServiceError::NoActiveSession)?;

        let mut packets: Vec<Bytes> = Vec::new();
        for buf in &mut session.trace_buffers {
            for rec in buf.drain() {
                session.assembler.push_chunk(&rec, &mut packets);
            }
        }
        self.metrics.add_packets_emitted(packets.len() as u64);

        let consumer = self
            .consumers
            .get(&consumer_id)
            .ok_or(ServiceError::UnknownConsumer(consumer_id))?;
        let batch_size = self.cfg.read_batch_packets.max(1);
        let mut batches: Vec<Vec<Bytes>> =
            packets.chunks(batch_size).map(|c| c.to_vec()).collect();
        if batches.is_empty() {
            batches.push(Vec::new());
        }
        let last = batches.len() - 1;
        for (i, batch) in batches.into_iter().enumerate() {
            consumer.post(ConsumerEvent::TraceData {
                packets: batch,
                has_more: i != last,
            });
        }
        Ok(())
    }

    pub fn free_for_consumer(&mut self, consumer_id: ConsumerId) -> Result<(), ServiceError> {
        let sid = self.session_of(consumer_id)?;
        self.free_session(sid)
    }

    /// Disable if still tracing, then release every buffer and id and
    /// drop the session. After this no callback references the session
    /// or its buffer ids again.
    pub fn free_session(&mut self, sid: TracingSessionId) -> Result<(), ServiceError> {
        if !self.sessions.contains_key(&sid) {
            debug!("[service] free for unknown session {sid}");
            return Err(ServiceError::NoActiveSession);
        }
        let _ = self.disable_session(sid);
        let session = self.sessions.remove(&sid).expect("checked above");
        for global_id in session.buffers_index.keys() {
            self.buffer_ids.free(*global_id);
            self.buffers_by_id.remove(global_id);
        }
        session.alive.store(false, Ordering::Relaxed);
        self.pending_flushes.retain(|_, pf| pf.session != sid);
        if let Some(consumer) = self.consumers.get_mut(&session.consumer) {
            consumer.session = None;
        }
        self.metrics.inc_sessions_freed();
        info!("[service] session {sid} freed");
        Ok(())
    }

    // ---- flush --------------------------------------------------------

    pub fn flush_for_consumer(
        &mut self,
        consumer_id: ConsumerId,
    ) -> Result<FlushRequestId, ServiceError> {
        let sid = self.session_of(consumer_id)?;
        self.flush_session(sid)
    }

    /// Ask every producer hosting an instance to flush. The request
    /// completes when all of them acknowledge or the timeout task fires.
    pub fn flush_session(&mut self, sid: TracingSessionId) -> Result<FlushRequestId, ServiceError> {
        let session = self.sessions.get(&sid).ok_or(ServiceError::NoActiveSession)?;
        self.last_flush_request_id += 1;
        let request_id = self.last_flush_request_id;
        let mut outstanding = HashSet::new();
        for (producer_id, instances) in &session.instances {
            let Some(producer) = self.producers.get(producer_id) else {
                continue;
            };
            producer.post(ProducerEvent::Flush {
                request_id,
                instance_ids: instances.iter().map(|inst| inst.id).collect(),
            });
            outstanding.insert(*producer_id);
        }
        if outstanding.is_empty() {
            self.post_flush_result(sid, request_id, true);
        } else {
            self.pending_flushes.insert(
                request_id,
                PendingFlush {
                    session: sid,
                    outstanding,
                },
            );
        }
        Ok(request_id)
    }

    pub fn notify_flush_complete(&mut self, producer_id: ProducerId, request_id: FlushRequestId) {
        let Some(pf) = self.pending_flushes.get_mut(&request_id) else {
            return;
        };
        pf.outstanding.remove(&producer_id);
        if pf.outstanding.is_empty() {
            let sid = pf.session;
            self.pending_flushes.remove(&request_id);
            self.post_flush_result(sid, request_id, true);
        }
    }

    pub fn flush_timed_out(&mut self, request_id: FlushRequestId) {
        if let Some(pf) = self.pending_flushes.remove(&request_id) {
            self.metrics.inc_flush_timeouts();
            warn!("[service] flush {request_id} timed out");
            self.post_flush_result(pf.session, request_id, false);
        }
    }

    fn post_flush_result(&self, sid: TracingSessionId, request_id: FlushRequestId, success: bool) {
        let Some(session) = self.sessions.get(&sid) else {
            return;
        };
        if let Some(consumer) = self.consumers.get(&session.consumer) {
            consumer.post(ConsumerEvent::FlushComplete {
                request_id,
                success,
            });
        }
    }

    // ---- the trace-record path ----------------------------------------

    /// Producer-notified page commits: for each changed page that is
    /// fully complete, acquire it, copy it into its target buffer, and
    /// hand it back free. Pages still accumulating chunks are left for a
    /// future notification.
    pub fn notify_shared_memory_update(&mut self, producer_id: ProducerId, changed_pages: Vec<u32>) {
        self.collect_pages(producer_id, changed_pages);
    }

    /// Out-of-band commit: patches are buffered until the target chunk
    /// is acquired; chunk moves are treated like an update notification
    /// for their pages.
    pub fn commit_data(&mut self, producer_id: ProducerId, request: CommitDataRequest) {
        if !self.producers.contains_key(&producer_id) {
            return;
        }
        let mut violations = 0u64;
        for ctp in &request.chunks_to_patch {
            let key = (producer_id, ctp.writer_id, ctp.chunk_id);
            let list = self.pending_patches.entry(key).or_default();
            if list.sealed {
                // The chunk was already committed once.
                debug!(
                    "[service] producer {producer_id} double-committed writer {} chunk {}",
                    ctp.writer_id, ctp.chunk_id
                );
                self.metrics.inc_patches_discarded();
                violations += 1;
            } else {
                list.patches.extend(ctp.patches.iter().cloned());
                list.sealed = !ctp.has_more_patches;
            }
        }
        let mut pages: Vec<u32> = Vec::new();
        for mv in &request.chunks_to_move {
            if !pages.contains(&mv.page) {
                pages.push(mv.page);
            }
        }
        self.collect_pages(producer_id, pages);
        self.record_violations(producer_id, violations);
    }

    fn collect_pages(&mut self, producer_id: ProducerId, pages: Vec<u32>) {
        let Some(entry) = self.producers.get(&producer_id) else {
            return;
        };
        let abi = entry.abi.clone();
        let num_pages = abi.num_pages();
        let mut violations = 0u64;
        for page in pages {
            let idx = page as usize;
            if idx >= num_pages {
                warn!("[service] producer {producer_id} notified out-of-range page {page}");
                violations += 1;
                continue;
            }
            if !abi.is_page_complete(idx) {
                continue;
            }
            if !abi.try_acquire_all_chunks_for_reading(idx) {
                continue;
            }
            violations += self.copy_acquired_page(producer_id, &abi, idx);
            if let Some(entry) = self.producers.get_mut(&producer_id) {
                entry.incomplete_since.remove(&page);
            }
        }
        self.record_violations(producer_id, violations);
    }

    /// Copy one acquired page into its target trace buffer, apply any
    /// pending patches to the copied chunks, and release the page. The
    /// page is dropped (but still released) when its target buffer is
    /// unknown or not one this producer was configured for.
    fn copy_acquired_page(&mut self, producer_id: ProducerId, abi: &ShmAbi, page: usize) -> u64 {
        let target = BufferId(abi.target_buffer(page));
        let mut violations = 0u64;
        match self.buffers_by_id.get(&target).copied() {
            None => {
                debug!(
                    "[service] producer {producer_id} wrote page {page} for unknown buffer {target}"
                );
                self.metrics.inc_unknown_target_buffer();
                violations += 1;
            }
            Some(sid) => {
                let session = self
                    .sessions
                    .get_mut(&sid)
                    .expect("buffers_by_id entries track live sessions");
                if !session.producer_may_write(producer_id, target) {
                    debug!(
                        "[service] producer {producer_id} is not configured for buffer {target}"
                    );
                    self.metrics.inc_unknown_target_buffer();
                    violations += 1;
                } else {
                    let local = session.buffers_index[&target];
                    let buf = &mut session.trace_buffers[local];
                    let outcome = buf.copy_page(producer_id, abi, page);
                    self.metrics.inc_pages_copied();
                    if outcome.overwrote {
                        self.metrics.inc_pages_overwritten();
                    }
                    for (writer_id, chunk_id, chunk_idx) in buf.chunk_keys(outcome.slot) {
                        let Some(list) =
                            self.pending_patches.remove(&(producer_id, writer_id, chunk_id))
                        else {
                            continue;
                        };
                        let Some(payload) = buf.chunk_payload_mut(outcome.slot, chunk_idx) else {
                            continue;
                        };
                        for patch in &list.patches {
                            let off = patch.offset as usize;
                            if off + patch.data.len() <= payload.len() {
                                payload[off..off + patch.data.len()].copy_from_slice(&patch.data);
                                self.metrics.inc_patches_applied();
                            } else {
                                self.metrics.inc_patches_discarded();
                                violations += 1;
                            }
                        }
                    }
                }
            }
        }
        abi.release_all_chunks_as_free(page);
        violations
    }

    /// Deadline sweep for producers that crashed or stalled mid-write.
    /// Pages incomplete for longer than the stall timeout get a forced
    /// acquisition: stuck chunks are dropped, finished ones salvaged.
    pub fn sweep_stalled_pages(&mut self, now: Instant) {
        let timeout = Duration::from_millis(self.cfg.stall_timeout_ms);
        let producer_ids: Vec<ProducerId> = self.producers.keys().copied().collect();
        for producer_id in producer_ids {
            let mut stalled: Vec<usize> = Vec::new();
            let mut violations = 0u64;
            let abi = {
                let Some(entry) = self.producers.get_mut(&producer_id) else {
                    continue;
                };
                let abi = entry.abi.clone();
                for page in 0..abi.num_pages() {
                    let key = page as u32;
                    if abi.is_page_free(page) {
                        entry.incomplete_since.remove(&key);
                        entry.bad_layout_pages.remove(&key);
                        continue;
                    }
                    if abi.page_layout(page).is_none() {
                        // Unknown layout byte: defensively treated as
                        // free, flagged once.
                        entry.incomplete_since.remove(&key);
                        if entry.bad_layout_pages.insert(key) {
                            warn!(
                                "[service] producer {producer_id} page {page} has an unknown layout"
                            );
                            violations += 1;
                        }
                        continue;
                    }
                    if abi.is_page_complete(page) {
                        // Readable, merely not notified yet; not stalled.
                        entry.incomplete_since.remove(&key);
                        continue;
                    }
                    let since = *entry.incomplete_since.entry(key).or_insert(now);
                    if now.saturating_duration_since(since) >= timeout {
                        stalled.push(page);
                    }
                }
                abi
            };
            for page in stalled {
                let Some(outcome) = abi.force_acquire_all_chunks_for_reading(page) else {
                    continue;
                };
                self.metrics.inc_pages_reaped();
                self.metrics.add_chunks_demoted(outcome.demoted as u64);
                warn!(
                    "[service] reclaimed stalled page {page} of producer {producer_id}: \
                     {} chunks dropped, {} salvaged",
                    outcome.demoted, outcome.salvaged
                );
                if outcome.salvaged > 0 {
                    violations += self.copy_acquired_page(producer_id, &abi, page);
                } else {
                    abi.release_all_chunks_as_free(page);
                }
                if let Some(entry) = self.producers.get_mut(&producer_id) {
                    entry.incomplete_since.remove(&(page as u32));
                }
            }
            self.record_violations(producer_id, violations);
        }
    }

    /// Count violations against the producer; past the limit it is
    /// disconnected (not on first offence).
    fn record_violations(&mut self, producer_id: ProducerId, count: u64) {
        if count == 0 {
            return;
        }
        self.metrics.add_abi_violations(count);
        let limit = self.cfg.producer_violation_limit;
        let Some(entry) = self.producers.get_mut(&producer_id) else {
            return;
        };
        entry.violations = entry.violations.saturating_add(count as u32);
        if entry.violations >= limit {
            warn!(
                "[service] producer {producer_id} hit the violation limit ({}), disconnecting",
                entry.violations
            );
            self.metrics.inc_producers_evicted();
            self.disconnect_producer(producer_id);
        }
    }

    fn session_of(&self, consumer_id: ConsumerId) -> Result<TracingSessionId, ServiceError> {
        self.consumers
            .get(&consumer_id)
            .ok_or(ServiceError::UnknownConsumer(consumer_id))?
            .session
            .ok_or(ServiceError::NoActiveSession)
    }
}

/// Create one data-source instance on one producer, rewriting the
/// session-local target-buffer index to the global buffer id before the
/// config leaves the service.
fn create_instance(
    last_instance_id: &mut DataSourceInstanceId,
    session: &mut TracingSession,
    producer: &ProducerEntry,
    cfg_ds: &DataSourceConfig,
) {
    if let Some(filter) = &cfg_ds.producer_name_filter {
        if *filter != producer.name {
            return;
        }
    }
    let local = cfg_ds.target_buffer as usize;
    let Some(buffer) = session.trace_buffers.get(local) else {
        warn!(
            "[service] data source {:?} names target buffer {local} out of bounds, skipping",
            cfg_ds.name
        );
        return;
    };
    let global_id = buffer.id();
    debug_assert!(global_id.is_valid());
    let mut config = cfg_ds.clone();
    config.target_buffer = u32::from(global_id.0);

    *last_instance_id += 1;
    let instance_id = *last_instance_id;
    session
        .instances
        .entry(producer.id)
        .or_default()
        .push(DataSourceInstance {
            id: instance_id,
            data_source: cfg_ds.name.clone(),
            buffer: global_id,
        });
    debug!(
        "[service] instance {instance_id} of {:?} on producer {} -> buffer {global_id}",
        cfg_ds.name, producer.id
    );
    producer.post(ProducerEvent::CreateDataSourceInstance {
        instance_id,
        config,
    });
}
