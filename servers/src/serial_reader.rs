//! # Serial Reader
//!
//! Reads newline-delimited sensor readings from USB serial gateways and
//! forwards every line to the ingest server.
//!
//! One device task runs per explicit port (`--ports`), or per USB port found
//! at startup. All devices feed one bounded queue drained by a single
//! forwarder. On CTRL+C / SIGTERM the devices stop first; the forwarder then
//! gets a grace period to deliver what is queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lib_common::configs::ReaderConfig;
use lib_common::core::{shutdown_signal, PortRegistry};
use lib_common::ingestors::{
    partition_ports, run_forwarder, HttpForwarder, LineSink, LinkState, SerialBackend, SerialDevice,
    TokioSerialBackend,
};
use lib_common::loggers::setup_logging;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const FORWARDER_GRACE: Duration = Duration::from_secs(10);
const FIRST_LINK_WAIT: Duration = Duration::from_secs(30);

/// Warns once if no device has opened a port within [`FIRST_LINK_WAIT`].
async fn watch_first_link(links: Vec<watch::Receiver<LinkState>>) {
    let mut waiting = JoinSet::new();
    for mut link in links {
        waiting.spawn(async move {
            link.wait_for(|state| matches!(state, LinkState::Connected { .. }))
                .await
                .is_ok()
        });
    }

    let connected = tokio::time::timeout(FIRST_LINK_WAIT, async {
        while let Some(joined) = waiting.join_next().await {
            if matches!(joined, Ok(true)) {
                return true;
            }
        }
        false
    })
    .await;

    if !matches!(connected, Ok(true)) {
        log::warn!(
            "No serial device connected within {:?}; still retrying in the background",
            FIRST_LINK_WAIT
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = ReaderConfig::load(ReaderConfig::parse())?;
    let log_path = setup_logging(&settings.log_dir, &settings.log_level, "serial_reader")?;
    log::info!("Logging to {}", log_path.display());
    log::info!("Forwarding to {}", settings.url);

    let backend: Arc<dyn SerialBackend> = Arc::new(TokioSerialBackend);

    let discovered = if settings.ports.is_empty() {
        match backend.available_ports() {
            Ok(ports) => partition_ports(ports).0.len(),
            Err(e) => {
                log::warn!("Could not list serial ports: {}", e);
                0
            }
        }
    } else {
        0
    };

    let registry = PortRegistry::new(settings.port_linger);
    let (tx, rx) = mpsc::channel(settings.queue_capacity);

    let device_cancel = CancellationToken::new();
    let mut devices = JoinSet::new();
    let mut links = Vec::new();
    let mut queue_drops: Vec<Arc<AtomicU64>> = Vec::new();
    for config in settings.device_configs(discovered) {
        log::info!(
            "Starting {} on {}",
            config.name,
            config.port.as_deref().unwrap_or("the first free USB port")
        );
        let device = SerialDevice::new(config, Arc::clone(&backend), registry.clone(), tx.clone());
        links.push(device.subscribe());
        queue_drops.push(device.dropped_lines());
        devices.spawn(device.run(device_cancel.clone()));
    }
    let link_watch = tokio::spawn(watch_first_link(links));
    // The queue closes once every device has stopped.
    drop(tx);

    let sink: Arc<dyn LineSink> = Arc::new(HttpForwarder::new(
        &settings.url,
        settings.user.as_deref(),
        settings.request_timeout,
        settings.transport_retries,
    )?);
    let forward_cancel = CancellationToken::new();
    let mut forwarder = tokio::spawn(run_forwarder(
        rx,
        sink,
        settings.forward_policy,
        forward_cancel.clone(),
    ));

    shutdown_signal().await;

    link_watch.abort();
    device_cancel.cancel();
    while let Some(result) = devices.join_next().await {
        if let Err(e) = result {
            log::error!("Device task failed: {}", e);
        }
    }

    let stats = match tokio::time::timeout(FORWARDER_GRACE, &mut forwarder).await {
        Ok(joined) => joined?,
        Err(_) => {
            log::warn!("Forwarder still busy after {:?}, cutting it short", FORWARDER_GRACE);
            forward_cancel.cancel();
            forwarder.await?
        }
    };

    let lost_to_full_queue: u64 = queue_drops.iter().map(|d| d.load(Ordering::Relaxed)).sum();
    log::info!(
        "Serial reader stopped: {} lines delivered, {} dropped, {} lost to a full queue",
        stats.delivered,
        stats.dropped,
        lost_to_full_queue
    );
    Ok(())
}
