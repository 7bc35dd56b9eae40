//! Consumer-supplied trace configuration and producer data-source
//! descriptors.
//!
//! All types flatten unrecognised fields into a side map so a config can
//! round-trip through the service byte-for-byte even when produced by a
//! newer client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hard cap on buffers per tracing session.
pub const MAX_BUFFERS_PER_SESSION: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default)]
    pub buffers: Vec<BufferConfig>,
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
    /// Soft time limit; 0 means the session never auto-disables.
    #[serde(default)]
    pub duration_ms: u32,
    /// Periodic flush cadence; 0 disables periodic flushing.
    #[serde(default)]
    pub flush_period_ms: u32,
    #[serde(flatten)]
    pub unknown_fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Requested size; rounded up to a whole number of 4 KiB pages.
    #[serde(default)]
    pub size_kb: u32,
    #[serde(flatten)]
    pub unknown_fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    #[serde(default)]
    pub name: String,
    /// Index into `TraceConfig::buffers` as written by the consumer. The
    /// service rewrites it to the global buffer id before handing the
    /// config to a producer, so producers never see session-local
    /// indices.
    #[serde(default)]
    pub target_buffer: u32,
    /// Restricts the data source to producers with this exact name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_name_filter: Option<String>,
    /// Opaque source-specific configuration, passed through untouched.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    #[serde(flatten)]
    pub unknown_fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub unknown_fields: Map<String, Value>,
}
