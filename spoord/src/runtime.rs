//! The single-threaded service loop.
//!
//! All mutable service state lives inside one task; producers and
//! consumers talk to it by posting commands on an mpsc channel and
//! receive callbacks on their per-connection channels. Timers (session
//! duration, periodic flush, flush timeout) are spawned tasks that
//! capture ids only and post a command back; if the target is gone by
//! the time the command runs, it is a no-op.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use spoor_shm::ShmAbi;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::commit::CommitDataRequest;
use crate::config::ServiceConfig;
use crate::endpoint::{ConsumerEvent, ProducerEvent};
use crate::error::ServiceError;
use crate::ids::{ConsumerId, DataSourceId, FlushRequestId, ProducerId, TracingSessionId};
use crate::metrics::{Metrics, ServiceStats};
use crate::service::TracingService;
use crate::shmem::SharedMemory;
use crate::trace_config::{DataSourceDescriptor, TraceConfig};

enum ServiceCmd {
    ConnectProducer {
        name: String,
        shm_size_hint: usize,
        reply: oneshot::Sender<
            Result<
                (
                    ProducerId,
                    Arc<SharedMemory>,
                    mpsc::UnboundedReceiver<ProducerEvent>,
                ),
                ServiceError,
            >,
        >,
    },
    DisconnectProducer {
        producer_id: ProducerId,
    },
    RegisterDataSource {
        producer_id: ProducerId,
        descriptor: DataSourceDescriptor,
        reply: oneshot::Sender<Result<DataSourceId, ServiceError>>,
    },
    UnregisterDataSource {
        producer_id: ProducerId,
        data_source_id: DataSourceId,
    },
    NotifySharedMemoryUpdate {
        producer_id: ProducerId,
        changed_pages: Vec<u32>,
    },
    CommitData {
        producer_id: ProducerId,
        request: CommitDataRequest,
    },
    NotifyFlushComplete {
        producer_id: ProducerId,
        request_id: FlushRequestId,
    },
    ConnectConsumer {
        reply: oneshot::Sender<(ConsumerId, mpsc::UnboundedReceiver<ConsumerEvent>)>,
    },
    DisconnectConsumer {
        consumer_id: ConsumerId,
    },
    EnableTracing {
        consumer_id: ConsumerId,
        config: TraceConfig,
        reply: oneshot::Sender<Result<TracingSessionId, ServiceError>>,
    },
    DisableTracing {
        consumer_id: ConsumerId,
    },
    ReadBuffers {
        consumer_id: ConsumerId,
    },
    FreeBuffers {
        consumer_id: ConsumerId,
    },
    Flush {
        consumer_id: ConsumerId,
        reply: oneshot::Sender<Result<FlushRequestId, ServiceError>>,
    },
    // Internal, posted by timer tasks. They carry ids only and no-op if
    // the target has been freed meanwhile.
    DisableSession {
        session_id: TracingSessionId,
    },
    FlushSession {
        session_id: TracingSessionId,
    },
    FlushTimeout {
        request_id: FlushRequestId,
    },
    QueryStats {
        reply: oneshot::Sender<ServiceStats>,
    },
}

/// Cheap cloneable handle posting commands onto the service task.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<ServiceCmd>,
}

/// Spawn the service loop on the current tokio runtime.
pub fn start(cfg: ServiceConfig, metrics: Arc<Metrics>) -> (ServiceHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ServiceHandle { tx };
    let svc = TracingService::new(cfg, metrics);
    let join = tokio::spawn(run(svc, rx, handle.clone()));
    (handle, join)
}

async fn run(
    mut svc: TracingService,
    mut rx: mpsc::UnboundedReceiver<ServiceCmd>,
    handle: ServiceHandle,
) {
    let mut sweep =
        tokio::time::interval(Duration::from_millis(svc.config().sweep_period_ms.max(1)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => dispatch(&mut svc, cmd, &handle),
                None => break,
            },
            _ = sweep.tick() => svc.sweep_stalled_pages(Instant::now()),
        }
    }
    debug!("[service] loop stopped");
}

fn dispatch(svc: &mut TracingService, cmd: ServiceCmd, handle: &ServiceHandle) {
    match cmd {
        ServiceCmd::ConnectProducer {
            name,
            shm_size_hint,
            reply,
        } => {
            let _ = reply.send(svc.connect_producer(&name, shm_size_hint));
        }
        ServiceCmd::DisconnectProducer { producer_id } => svc.disconnect_producer(producer_id),
        ServiceCmd::RegisterDataSource {
            producer_id,
            descriptor,
            reply,
        } => {
            let _ = reply.send(svc.register_data_source(producer_id, descriptor));
        }
        ServiceCmd::UnregisterDataSource {
            producer_id,
            data_source_id,
        } => svc.unregister_data_source(producer_id, data_source_id),
        ServiceCmd::NotifySharedMemoryUpdate {
            producer_id,
            changed_pages,
        } => svc.notify_shared_memory_update(producer_id, changed_pages),
        ServiceCmd::CommitData {
            producer_id,
            request,
        } => svc.commit_data(producer_id, request),
        ServiceCmd::NotifyFlushComplete {
            producer_id,
            request_id,
        } => svc.notify_flush_complete(producer_id, request_id),
        ServiceCmd::ConnectConsumer { reply } => {
            let _ = reply.send(svc.connect_consumer());
        }
        ServiceCmd::DisconnectConsumer { consumer_id } => svc.disconnect_consumer(consumer_id),
        ServiceCmd::EnableTracing {
            consumer_id,
            config,
            reply,
        } => {
            let result = svc.enable_tracing(consumer_id, config);
            if let Ok(session_id) = &result {
                schedule_session_timers(svc, *session_id, handle);
            }
            let _ = reply.send(result);
        }
        ServiceCmd::DisableTracing { consumer_id } => {
            let _ = svc.disable_for_consumer(consumer_id);
        }
        ServiceCmd::ReadBuffers { consumer_id } => {
            let _ = svc.read_buffers(consumer_id);
        }
        ServiceCmd::FreeBuffers { consumer_id } => {
            let _ = svc.free_for_consumer(consumer_id);
        }
        ServiceCmd::Flush { consumer_id, reply } => {
            let result = svc.flush_for_consumer(consumer_id);
            if let Ok(request_id) = &result {
                schedule_flush_timeout(svc, *request_id, handle);
            }
            let _ = reply.send(result);
        }
        ServiceCmd::DisableSession { session_id } => {
            // The session may have been freed before the timer fired.
            let _ = svc.disable_session(session_id);
        }
        ServiceCmd::FlushSession { session_id } => {
            if let Ok(request_id) = svc.flush_session(session_id) {
                schedule_flush_timeout(svc, request_id, handle);
            }
        }
        ServiceCmd::FlushTimeout { request_id } => svc.flush_timed_out(request_id),
        ServiceCmd::QueryStats { reply } => {
            let _ = reply.send(svc.stats());
        }
    }
}

fn schedule_session_timers(svc: &TracingService, session_id: TracingSessionId, handle: &ServiceHandle) {
    let Some(session) = svc.session(session_id) else {
        return;
    };
    let duration_ms = session.config.duration_ms;
    if duration_ms > 0 {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(duration_ms))).await;
            handle.post(ServiceCmd::DisableSession { session_id });
        });
    }
    let flush_period_ms = session.config.flush_period_ms;
    if flush_period_ms > 0 {
        let handle = handle.clone();
        let alive = session.alive.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(u64::from(flush_period_ms)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // the immediate first tick
            loop {
                tick.tick().await;
                if !alive.load(Ordering::Relaxed) {
                    break;
                }
                handle.post(ServiceCmd::FlushSession { session_id });
            }
        });
    }
}

fn schedule_flush_timeout(svc: &TracingService, request_id: FlushRequestId, handle: &ServiceHandle) {
    let timeout = Duration::from_millis(svc.config().flush_timeout_ms);
    let handle = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        handle.post(ServiceCmd::FlushTimeout { request_id });
    });
}

impl ServiceHandle {
    fn post(&self, cmd: ServiceCmd) {
        let _ = self.tx.send(cmd);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ServiceCmd,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .map_err(|_| ServiceError::ServiceGone)?;
        rx.await.map_err(|_| ServiceError::ServiceGone)
    }

    /// Connect a producer, creating its shared-memory region.
    pub async fn connect_producer(
        &self,
        name: &str,
        shm_size_hint: usize,
    ) -> Result<ProducerConnection, ServiceError> {
        let name = name.to_string();
        let (producer_id, shm, events) = self
            .request(|reply| ServiceCmd::ConnectProducer {
                name,
                shm_size_hint,
                reply,
            })
            .await??;
        Ok(ProducerConnection {
            producer_id,
            shm,
            events,
            handle: self.clone(),
        })
    }

    pub async fn connect_consumer(&self) -> Result<ConsumerConnection, ServiceError> {
        let (consumer_id, events) = self
            .request(|reply| ServiceCmd::ConnectConsumer { reply })
            .await?;
        Ok(ConsumerConnection {
            consumer_id,
            events,
            handle: self.clone(),
        })
    }

    pub async fn stats(&self) -> Result<ServiceStats, ServiceError> {
        self.request(|reply| ServiceCmd::QueryStats { reply }).await
    }
}

/// Client half of a producer connection: the shared-memory region plus
/// the operations of the producer port. In a full deployment this is
/// what the producer socket front end drives.
pub struct ProducerConnection {
    pub producer_id: ProducerId,
    pub shm: Arc<SharedMemory>,
    pub events: mpsc::UnboundedReceiver<ProducerEvent>,
    handle: ServiceHandle,
}

impl ProducerConnection {
    pub fn abi(&self) -> ShmAbi {
        self.shm.abi()
    }

    pub async fn register_data_source(
        &self,
        descriptor: DataSourceDescriptor,
    ) -> Result<DataSourceId, ServiceError> {
        let producer_id = self.producer_id;
        self.handle
            .request(|reply| ServiceCmd::RegisterDataSource {
                producer_id,
                descriptor,
                reply,
            })
            .await?
    }

    pub fn unregister_data_source(&self, data_source_id: DataSourceId) {
        self.handle.post(ServiceCmd::UnregisterDataSource {
            producer_id: self.producer_id,
            data_source_id,
        });
    }

    pub fn notify_shared_memory_update(&self, changed_pages: Vec<u32>) {
        self.handle.post(ServiceCmd::NotifySharedMemoryUpdate {
            producer_id: self.producer_id,
            changed_pages,
        });
    }

    pub fn commit_data(&self, request: CommitDataRequest) {
        self.handle.post(ServiceCmd::CommitData {
            producer_id: self.producer_id,
            request,
        });
    }

    pub fn notify_flush_complete(&self, request_id: FlushRequestId) {
        self.handle.post(ServiceCmd::NotifyFlushComplete {
            producer_id: self.producer_id,
            request_id,
        });
    }

    pub async fn next_event(&mut self) -> Option<ProducerEvent> {
        self.events.recv().await
    }

    pub fn disconnect(self) {
        self.handle.post(ServiceCmd::DisconnectProducer {
            producer_id: self.producer_id,
        });
    }
}

/// Client half of a consumer connection.
pub struct ConsumerConnection {
    pub consumer_id: ConsumerId,
    pub events: mpsc::UnboundedReceiver<ConsumerEvent>,
    handle: ServiceHandle,
}

impl ConsumerConnection {
    pub async fn enable_tracing(
        &self,
        config: TraceConfig,
    ) -> Result<TracingSessionId, ServiceError> {
        let consumer_id = self.consumer_id;
        self.handle
            .request(|reply| ServiceCmd::EnableTracing {
                consumer_id,
                config,
                reply,
            })
            .await?
    }

    pub fn disable_tracing(&self) {
        self.handle.post(ServiceCmd::DisableTracing {
            consumer_id: self.consumer_id,
        });
    }

    pub fn read_buffers(&self) {
        self.handle.post(ServiceCmd::ReadBuffers {
            consumer_id: self.consumer_id,
        });
    }

    pub fn free_buffers(&self) {
        self.handle.post(ServiceCmd::FreeBuffers {
            consumer_id: self.consumer_id,
        });
    }

    pub async fn flush(&self) -> Result<FlushRequestId, ServiceError> {
        let consumer_id = self.consumer_id;
        self.handle
            .request(|reply| ServiceCmd::Flush { consumer_id, reply })
            .await?
    }

    pub async fn next_event(&mut self) -> Option<ConsumerEvent> {
        self.events.recv().await
    }

    /// Read to completion: every batch until one with `has_more = false`.
    pub async fn read_to_end(&mut self) -> Vec<bytes::Bytes> {
        self.read_buffers();
        let mut packets = Vec::new();
        while let Some(event) = self.events.recv().await {
            if let ConsumerEvent::TraceData {
                packets: batch,
                has_more,
            } = event
            {
                packets.extend(batch);
                if !has_more {
                    break;
                }
            }
        }
        packets
    }

    pub fn disconnect(self) {
        self.handle.post(ServiceCmd::DisconnectConsumer {
            consumer_id: self.consumer_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_config::{BufferConfig, DataSourceConfig};
    use spoor_shm::{PacketStreamWriter, PageLayout};

    fn start_service(cfg: ServiceConfig) -> (ServiceHandle, JoinHandle<()>) {
        start(cfg, Arc::new(Metrics::new()))
    }

    fn one_buffer_config(name: &str) -> TraceConfig {
        TraceConfig {
            buffers: vec![BufferConfig {
                size_kb: 64,
                ..Default::default()
            }],
            data_sources: vec![DataSourceConfig {
                name: name.to_string(),
                target_buffer: 0,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn descriptor(name: &str) -> DataSourceDescriptor {
        DataSourceDescriptor {
            name: name.to_string(),
            ..Default::default()
        }
    }

    async fn instance_target(producer: &mut ProducerConnection) -> u16 {
        loop {
            match producer.next_event().await.expect("producer event") {
                ProducerEvent::CreateDataSourceInstance { config, .. } => {
                    return config.target_buffer as u16;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn ten_packets_end_to_end() {
        let (handle, _join) = start_service(ServiceConfig::default());
        let mut producer = handle.connect_producer("probe", 0).await.unwrap();
        producer
            .register_data_source(descriptor("spoor.test"))
            .await
            .unwrap();
        let mut consumer = handle.connect_consumer().await.unwrap();
        consumer
            .enable_tracing(one_buffer_config("spoor.test"))
            .await
            .unwrap();
        let target = instance_target(&mut producer).await;
        assert_ne!(target, 0);

        let mut writer = PacketStreamWriter::new(producer.abi(), PageLayout::Fourteen, 1, target);
        for i in 0..10 {
            writer.write_packet(format!("evt_{i}").as_bytes()).unwrap();
        }
        writer.flush();
        producer.notify_shared_memory_update(writer.take_changed_pages());

        let packets = consumer.read_to_end().await;
        assert_eq!(packets.len(), 10);
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.as_ref(), format!("evt_{i}").as_bytes());
        }

        // Reading again finds the buffers drained.
        assert!(consumer.read_to_end().await.is_empty());

        consumer.disable_tracing();
        loop {
            match producer.next_event().await.expect("teardown") {
                ProducerEvent::TearDownDataSourceInstance { .. } => break,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duration_auto_disables_exactly_once() {
        let (handle, _join) = start_service(ServiceConfig::default());
        let mut producer = handle.connect_producer("probe", 0).await.unwrap();
        producer
            .register_data_source(descriptor("spoor.test"))
            .await
            .unwrap();
        let mut consumer = handle.connect_consumer().await.unwrap();
        let mut cfg = one_buffer_config("spoor.test");
        cfg.duration_ms = 100;
        consumer.enable_tracing(cfg).await.unwrap();
        let target = instance_target(&mut producer).await;

        // Queue some data before the deadline.
        let mut writer = PacketStreamWriter::new(producer.abi(), PageLayout::Fourteen, 1, target);
        writer.write_packet(b"before_deadline").unwrap();
        writer.flush();
        producer.notify_shared_memory_update(writer.take_changed_pages());

        tokio::time::sleep(Duration::from_millis(150)).await;
        match producer.next_event().await.expect("event") {
            ProducerEvent::TearDownDataSourceInstance { .. } => {}
            other => panic!("expected teardown, got {other:?}"),
        }
        assert!(
            producer.events.try_recv().is_err(),
            "exactly one teardown expected"
        );

        // Queued data remains readable after the auto-disable.
        let packets = consumer.read_to_end().await;
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].as_ref(), b"before_deadline");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_never_auto_disables() {
        let (handle, _join) = start_service(ServiceConfig::default());
        let mut producer = handle.connect_producer("probe", 0).await.unwrap();
        producer
            .register_data_source(descriptor("spoor.test"))
            .await
            .unwrap();
        let consumer = handle.connect_consumer().await.unwrap();
        consumer
            .enable_tracing(one_buffer_config("spoor.test"))
            .await
            .unwrap();
        let _ = instance_target(&mut producer).await;

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(producer.events.try_recv().is_err(), "no teardown expected");
    }

    #[tokio::test]
    async fn consumer_disconnect_mid_read_frees_everything() {
        let (handle, _join) = start_service(ServiceConfig::default());
        let mut producer = handle.connect_producer("probe", 0).await.unwrap();
        producer
            .register_data_source(descriptor("spoor.test"))
            .await
            .unwrap();
        let consumer = handle.connect_consumer().await.unwrap();
        consumer
            .enable_tracing(one_buffer_config("spoor.test"))
            .await
            .unwrap();
        let target = instance_target(&mut producer).await;

        let mut writer = PacketStreamWriter::new(producer.abi(), PageLayout::Fourteen, 1, target);
        for i in 0..100 {
            writer.write_packet(format!("evt_{i}").as_bytes()).unwrap();
        }
        writer.flush();
        producer.notify_shared_memory_update(writer.take_changed_pages());

        // Request the read and vanish before the batches can land.
        consumer.read_buffers();
        consumer.disconnect();

        // The session is freed and all buffer ids returned to the pool.
        let mut stats = handle.stats().await.unwrap();
        for _ in 0..100 {
            if stats.sessions == 0 {
                break;
            }
            tokio::task::yield_now().await;
            stats = handle.stats().await.unwrap();
        }
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.buffers_in_use, 0);
        loop {
            match producer.next_event().await.expect("teardown") {
                ProducerEvent::TearDownDataSourceInstance { .. } => break,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flush_acks_and_timeouts_reach_the_consumer() {
        let mut cfg = ServiceConfig::default();
        cfg.flush_timeout_ms = 1000;
        let (handle, _join) = start_service(cfg);
        let mut producer = handle.connect_producer("probe", 0).await.unwrap();
        producer
            .register_data_source(descriptor("spoor.test"))
            .await
            .unwrap();
        let mut consumer = handle.connect_consumer().await.unwrap();
        consumer
            .enable_tracing(one_buffer_config("spoor.test"))
            .await
            .unwrap();
        let _ = instance_target(&mut producer).await;

        // Acked flush completes successfully.
        let rid = consumer.flush().await.unwrap();
        match producer.next_event().await.expect("flush request") {
            ProducerEvent::Flush { request_id, .. } => assert_eq!(request_id, rid),
            other => panic!("expected flush, got {other:?}"),
        }
        producer.notify_flush_complete(rid);
        match consumer.next_event().await.expect("flush result") {
            ConsumerEvent::FlushComplete {
                request_id,
                success,
            } => {
                assert_eq!(request_id, rid);
                assert!(success);
            }
            other => panic!("expected flush completion, got {other:?}"),
        }

        // An ignored flush times out with success = false.
        let rid2 = consumer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        match consumer.next_event().await.expect("flush result") {
            ConsumerEvent::FlushComplete {
                request_id,
                success,
            } => {
                assert_eq!(request_id, rid2);
                assert!(!success);
            }
            other => panic!("expected flush timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_flush_follows_the_configured_cadence() {
        let (handle, _join) = start_service(ServiceConfig::default());
        let mut producer = handle.connect_producer("probe", 0).await.unwrap();
        producer
            .register_data_source(descriptor("spoor.test"))
            .await
            .unwrap();
        let consumer = handle.connect_consumer().await.unwrap();
        let mut cfg = one_buffer_config("spoor.test");
        cfg.flush_period_ms = 200;
        consumer.enable_tracing(cfg).await.unwrap();
        let _ = instance_target(&mut producer).await;

        tokio::time::sleep(Duration::from_millis(450)).await;
        let flushes = {
            let mut count = 0;
            while let Ok(ev) = producer.events.try_recv() {
                if matches!(ev, ProducerEvent::Flush { .. }) {
                    count += 1;
                }
            }
            count
        };
        assert_eq!(flushes, 2);

        // Freeing the session stops the cadence.
        consumer.free_buffers();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut late_flushes = 0;
        while let Ok(ev) = producer.events.try_recv() {
            if matches!(ev, ProducerEvent::Flush { .. }) {
                late_flushes += 1;
            }
        }
        assert!(late_flushes <= 1, "cadence must stop after free");
    }
}
