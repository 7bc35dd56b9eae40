//! Per-connection state for producers and consumers, and the callback
//! events the service posts back to them.
//!
//! The IPC transport proper is out of scope here; callbacks travel over
//! per-connection channels and requests arrive as service commands (see
//! `runtime`). A socket front end would pump both ends of these channels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use spoor_shm::ShmAbi;
use tokio::sync::mpsc;

use crate::ids::{DataSourceId, DataSourceInstanceId, FlushRequestId, ProducerId, TracingSessionId};
use crate::shmem::SharedMemory;
use crate::trace_config::{DataSourceConfig, DataSourceDescriptor};

/// Callbacks from the service to one producer.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    CreateDataSourceInstance {
        instance_id: DataSourceInstanceId,
        config: DataSourceConfig,
    },
    TearDownDataSourceInstance {
        instance_id: DataSourceInstanceId,
    },
    Flush {
        request_id: FlushRequestId,
        instance_ids: Vec<DataSourceInstanceId>,
    },
    Disconnected,
}

/// Callbacks from the service to one consumer.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    TraceData {
        packets: Vec<Bytes>,
        has_more: bool,
    },
    FlushComplete {
        request_id: FlushRequestId,
        success: bool,
    },
    Disconnected,
}

pub(crate) struct ProducerEntry {
    pub id: ProducerId,
    pub name: String,
    /// Keeps the mapping alive for the service-side views even if the
    /// producer process drops its handle.
    _shm: Arc<SharedMemory>,
    pub abi: ShmAbi,
    pub tx: mpsc::UnboundedSender<ProducerEvent>,
    pub data_sources: HashMap<DataSourceId, DataSourceDescriptor>,
    pub last_data_source_id: DataSourceId,
    /// When each shared-memory page was first observed incomplete, for
    /// the stalled-chunk sweep.
    pub incomplete_since: HashMap<u32, Instant>,
    /// Pages flagged once for carrying an unknown layout byte.
    pub bad_layout_pages: HashSet<u32>,
    /// Accumulated protocol violations; past the configured limit the
    /// producer is disconnected.
    pub violations: u32,
}

impl ProducerEntry {
    pub fn new(
        id: ProducerId,
        name: String,
        shm: Arc<SharedMemory>,
        tx: mpsc::UnboundedSender<ProducerEvent>,
    ) -> Self {
        let abi = shm.abi();
        ProducerEntry {
            id,
            name,
            _shm: shm,
            abi,
            tx,
            data_sources: HashMap::new(),
            last_data_source_id: 0,
            incomplete_since: HashMap::new(),
            bad_layout_pages: HashSet::new(),
            violations: 0,
        }
    }

    /// Post a callback. A gone client (dropped receiver) is fine; its
    /// disconnect command is already in flight.
    pub fn post(&self, event: ProducerEvent) {
        let _ = self.tx.send(event);
    }
}

pub(crate) struct ConsumerEntry {
    pub tx: mpsc::UnboundedSender<ConsumerEvent>,
    pub session: Option<TracingSessionId>,
}

impl ConsumerEntry {
    pub fn new(tx: mpsc::UnboundedSender<ConsumerEvent>) -> Self {
        ConsumerEntry { tx, session: None }
    }

    pub fn post(&self, event: ConsumerEvent) {
        let _ = self.tx.send(event);
    }
}
