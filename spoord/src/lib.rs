pub mod buffer;
pub mod commit;
pub mod config;
pub mod demo;
pub mod endpoint;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod reassembly;
pub mod runtime;
pub mod service;
pub mod shmem;
pub mod trace_config;

pub use config::{Config, DemoConfig, ServiceConfig};
pub use error::ServiceError;
pub use metrics::{Metrics, ServiceStats};
pub use runtime::{ConsumerConnection, ProducerConnection, ServiceHandle};
