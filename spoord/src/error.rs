use thiserror::Error;

use crate::ids::{ConsumerId, ProducerId};

/// Errors surfaced to clients. Configuration errors are rejected
/// synchronously at enable time; resource exhaustion rolls back cleanly;
/// a failed shared-memory mapping only affects the connecting producer.
/// None of these abort the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("consumer already owns an active tracing session")]
    SessionAlreadyActive,
    #[error("trace config declares {got} buffers, the limit is {max}")]
    TooManyBuffers { got: usize, max: usize },
    #[error("data source {name:?} names target buffer {index} but the config declares {buffers} buffers")]
    TargetBufferOutOfRange {
        name: String,
        index: u32,
        buffers: usize,
    },
    #[error("no producer has registered data source {0:?}")]
    UnknownDataSource(String),
    #[error("trace-buffer id pool exhausted")]
    BufferIdsExhausted,
    #[error("trace-buffer allocation of {size} bytes failed")]
    BufferAllocFailed {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("shared-memory mapping of {size} bytes failed")]
    ShmMapFailed {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("consumer owns no tracing session")]
    NoActiveSession,
    #[error("unknown producer {0}")]
    UnknownProducer(ProducerId),
    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),
    #[error("service loop has shut down")]
    ServiceGone,
}
