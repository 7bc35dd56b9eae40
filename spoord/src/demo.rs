//! Synthetic in-process workload for exercising the service end to end
//! without real producers attached. Driven by `spoord --demo`.

use anyhow::Context;
use log::{info, warn};
use spoor_shm::{PacketStreamWriter, PageLayout, ShmError};
use tokio::time::{interval, Duration};

use crate::config::DemoConfig;
use crate::endpoint::ProducerEvent;
use crate::runtime::ServiceHandle;
use crate::trace_config::{BufferConfig, DataSourceConfig, DataSourceDescriptor, TraceConfig};

const DEMO_SOURCE: &str = "spoor.demo";

/// Run one synthetic producer and one consumer against the service until
/// the task is aborted. Packets are `demo_<writer>_<seq>` strings, so a
/// reader can eyeball ordering.
pub async fn run(handle: ServiceHandle, cfg: DemoConfig) -> anyhow::Result<()> {
    let mut producer = handle
        .connect_producer("spoord-demo", 0)
        .await
        .context("demo producer connect")?;
    producer
        .register_data_source(DataSourceDescriptor {
            name: DEMO_SOURCE.to_string(),
            ..Default::default()
        })
        .await
        .context("demo data source registration")?;

    let mut consumer = handle
        .connect_consumer()
        .await
        .context("demo consumer connect")?;
    consumer
        .enable_tracing(TraceConfig {
            buffers: vec![BufferConfig {
                size_kb: cfg.buffer_size_kb,
                ..Default::default()
            }],
            data_sources: vec![DataSourceConfig {
                name: DEMO_SOURCE.to_string(),
                target_buffer: 0,
                ..Default::default()
            }],
            ..Default::default()
        })
        .await
        .context("demo enable tracing")?;

    // Wait for the instance so we learn the global buffer id.
    let target = loop {
        match producer.next_event().await {
            Some(ProducerEvent::CreateDataSourceInstance { config, .. }) => {
                break config.target_buffer as u16;
            }
            Some(_) => continue,
            None => anyhow::bail!("service went away before the demo instance came up"),
        }
    };
    info!("[demo] instance up, writing to buffer {target}");

    let mut writers: Vec<PacketStreamWriter> = (0..cfg.writers.max(1))
        .map(|w| PacketStreamWriter::new(producer.abi(), PageLayout::Fourteen, w + 1, target))
        .collect();
    let mut seq = 0u64;
    let mut write_tick = interval(Duration::from_millis(cfg.burst_period_ms.max(1)));
    let mut read_tick = interval(Duration::from_millis(cfg.read_period_ms.max(1)));
    let mut received = 0u64;

    loop {
        tokio::select! {
            _ = write_tick.tick() => {
                for writer in &mut writers {
                    for _ in 0..cfg.packets_per_burst {
                        let mut body = format!("demo_{}_{seq}", writer.writer_id()).into_bytes();
                        body.resize(cfg.packet_bytes.max(body.len()), b'.');
                        match writer.write_packet(&body) {
                            Ok(()) => seq += 1,
                            Err(ShmError::NoFreeChunk) => {
                                // Region saturated; the next read drains it.
                                warn!("[demo] shared memory saturated, dropping burst");
                                break;
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                    writer.flush();
                    let pages = writer.take_changed_pages();
                    if !pages.is_empty() {
                        producer.notify_shared_memory_update(pages);
                    }
                }
            }
            _ = read_tick.tick() => {
                let packets = consumer.read_to_end().await;
                received += packets.len() as u64;
                info!("[demo] read {} packets ({received} total)", packets.len());
            }
        }
    }
}
