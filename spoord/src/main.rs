use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use spoord::{demo, runtime, Config, Metrics};

#[derive(Parser, Debug)]
#[command(name = "spoord")]
#[command(about = "Spoor tracing service daemon")]
struct Args {
    /// Path to config file (overrides SPOORD_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Run a synthetic in-process producer/consumer workload
    #[arg(long)]
    demo: bool,
    /// Seconds between statistics log lines (0 disables)
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Some(path) = &args.config {
        unsafe {
            std::env::set_var("SPOORD_CONFIG", path);
        }
    }
    let cfg = Config::load();

    let metrics = Arc::new(Metrics::new());
    let (handle, service) = runtime::start(cfg.service.clone(), metrics);
    info!("[spoord] service up");

    let demo_task = args.demo.then(|| {
        let handle = handle.clone();
        let demo_cfg = cfg.demo.clone();
        tokio::spawn(async move {
            if let Err(err) = demo::run(handle, demo_cfg).await {
                error!("[spoord] demo workload failed: {err:#}");
            }
        })
    });

    let stats_task = (args.stats_interval > 0).then(|| {
        let handle = handle.clone();
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                match handle.stats().await {
                    Ok(stats) => info!(
                        "[spoord] producers={} sessions={} pages_copied={} \
                         packets_emitted={} abi_violations={}",
                        stats.producers,
                        stats.sessions,
                        stats.pages_copied,
                        stats.packets_emitted,
                        stats.abi_violations
                    ),
                    Err(_) => break,
                }
            }
        })
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("[spoord] shutting down");
    if let Some(task) = demo_task {
        task.abort();
    }
    if let Some(task) = stats_task {
        task.abort();
    }
    drop(handle);
    let _ = service.await;
    Ok(())
}
