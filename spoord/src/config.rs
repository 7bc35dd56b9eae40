use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/spoor/spoord.toml";
const ENV_CONFIG_PATH: &str = "SPOORD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `SPOORD_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Pages granted to a producer whose size hint is absent or bogus.
    #[serde(default = "default_shm_pages")]
    pub default_shm_pages: usize,
    /// Smallest hint honoured as-is; anything below falls back to the
    /// default region size.
    #[serde(default = "default_min_shm_pages")]
    pub min_shm_pages: usize,
    #[serde(default = "default_max_shm_pages")]
    pub max_shm_pages: usize,
    /// How long a shared-memory page may sit incomplete before the sweep
    /// forcibly reclaims its stuck chunks.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    #[serde(default = "default_sweep_period_ms")]
    pub sweep_period_ms: u64,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// Reassembled packets above this size are dropped and counted.
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,
    /// Packets per delivery batch on the consumer read path.
    #[serde(default = "default_read_batch_packets")]
    pub read_batch_packets: usize,
    /// Protocol violations a producer may accumulate before it is
    /// disconnected.
    #[serde(default = "default_producer_violation_limit")]
    pub producer_violation_limit: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_shm_pages: default_shm_pages(),
            min_shm_pages: default_min_shm_pages(),
            max_shm_pages: default_max_shm_pages(),
            stall_timeout_ms: default_stall_timeout_ms(),
            sweep_period_ms: default_sweep_period_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            max_packet_bytes: default_max_packet_bytes(),
            read_batch_packets: default_read_batch_packets(),
            producer_violation_limit: default_producer_violation_limit(),
        }
    }
}

fn default_shm_pages() -> usize {
    16
}
fn default_min_shm_pages() -> usize {
    4
}
fn default_max_shm_pages() -> usize {
    1024
}
fn default_stall_timeout_ms() -> u64 {
    2000
}
fn default_sweep_period_ms() -> u64 {
    250
}
fn default_flush_timeout_ms() -> u64 {
    5000
}
fn default_max_packet_bytes() -> usize {
    256 * 1024
}
fn default_read_batch_packets() -> usize {
    64
}
fn default_producer_violation_limit() -> u32 {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct DemoConfig {
    #[serde(default = "default_demo_writers")]
    pub writers: u16,
    #[serde(default = "default_demo_packets_per_burst")]
    pub packets_per_burst: u32,
    #[serde(default = "default_demo_packet_bytes")]
    pub packet_bytes: usize,
    #[serde(default = "default_demo_burst_period_ms")]
    pub burst_period_ms: u64,
    #[serde(default = "default_demo_buffer_size_kb")]
    pub buffer_size_kb: u32,
    #[serde(default = "default_demo_read_period_ms")]
    pub read_period_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            writers: default_demo_writers(),
            packets_per_burst: default_demo_packets_per_burst(),
            packet_bytes: default_demo_packet_bytes(),
            burst_period_ms: default_demo_burst_period_ms(),
            buffer_size_kb: default_demo_buffer_size_kb(),
            read_period_ms: default_demo_read_period_ms(),
        }
    }
}

fn default_demo_writers() -> u16 {
    2
}
fn default_demo_packets_per_burst() -> u32 {
    16
}
fn default_demo_packet_bytes() -> usize {
    48
}
fn default_demo_burst_period_ms() -> u64 {
    250
}
fn default_demo_buffer_size_kb() -> u32 {
    256
}
fn default_demo_read_period_ms() -> u64 {
    1000
}
