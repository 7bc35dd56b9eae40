//! Per-session state: config, buffers, live data-source instances.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::buffer::TraceBuffer;
use crate::ids::{BufferId, ConsumerId, DataSourceInstanceId, ProducerId, TracingSessionId};
use crate::reassembly::PacketAssembler;
use crate::trace_config::TraceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configured,
    Tracing,
    Disabled,
}

/// One data source enabled on one producer for this session.
pub struct DataSourceInstance {
    pub id: DataSourceInstanceId,
    pub data_source: String,
    pub buffer: BufferId,
}

pub struct TracingSession {
    pub id: TracingSessionId,
    pub consumer: ConsumerId,
    pub config: TraceConfig,
    pub state: SessionState,
    /// Indexed by the session-local buffer index of the config.
    pub trace_buffers: Vec<TraceBuffer>,
    /// Inverse map: global buffer id to session-local index.
    pub buffers_index: HashMap<BufferId, usize>,
    pub instances: HashMap<ProducerId, Vec<DataSourceInstance>>,
    /// Stitching state survives across reads so packets spanning a read
    /// boundary still come out whole.
    pub assembler: PacketAssembler,
    /// Cleared when the session is freed; periodic tasks holding the
    /// session id check it and stop.
    pub alive: Arc<AtomicBool>,
}

impl TracingSession {
    /// Whether this producer was handed `buffer` through one of its
    /// instances. Pages naming any other buffer are dropped.
    pub fn producer_may_write(&self, producer: ProducerId, buffer: BufferId) -> bool {
        self.instances
            .get(&producer)
            .is_some_and(|list| list.iter().any(|inst| inst.buffer == buffer))
    }

    pub fn instance_count(&self) -> usize {
        self.instances.values().map(Vec::len).sum()
    }
}
