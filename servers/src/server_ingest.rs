//! # Sensor Ingest Server
//!
//! Receives reading lines from the serial readers, buffers them into the
//! time-series store and answers the dashboard's queries.
//!
//! ## Key Features:
//! - **Backpressure**: `POST /write` waits a bounded time for room in the write
//!   queue and answers 503 when the store cannot keep up, so readers retry.
//! - **At-least-once writes**: failed batches are retried; resent lines are
//!   recognised by their idempotency key and written once.
//! - **Configurable**: defaults, a JSON file (`server_ingest.conf`), then
//!   environment variables (`SENSORHUB_*`) and CLI flags.
//! - **Graceful shutdown**: on CTRL+C / SIGTERM the HTTP server stops taking
//!   requests, then the write buffer flushes what it holds.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use lib_common::api::{router, AppState, StaticUserDirectory};
use lib_common::configs::{ServerConfig, StoreBackend};
use lib_common::core::cancel_on_shutdown;
use lib_common::loggers::setup_logging;
use lib_common::pipeline::WriteBuffer;
use lib_common::storage::{InfluxStore, MemoryStore, TimeSeriesStore};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = ServerConfig::load(ServerConfig::parse())?;
    let log_path = setup_logging(&settings.log_dir, &settings.log_level, "server_ingest")?;
    log::info!("Logging to {}", log_path.display());

    let store: Arc<dyn TimeSeriesStore> = match &settings.store {
        StoreBackend::Influx(influx) => {
            log::info!("Writing to InfluxDB at {} (bucket {})", influx.host, influx.bucket);
            Arc::new(InfluxStore::new(influx.clone())?)
        }
        StoreBackend::Memory => {
            log::warn!("Using the in-memory store, readings are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    // The writer outlives the HTTP server so in-flight requests can still submit.
    let writer_cancel = CancellationToken::new();
    let (writer, writer_task) = WriteBuffer::spawn(
        Arc::clone(&store),
        settings.write_buffer.clone(),
        writer_cancel.clone(),
    );
    let writer_stats = writer.clone();

    let users = StaticUserDirectory::new(settings.default_user.clone(), settings.known_users.clone());
    let state = AppState {
        writer,
        store,
        users: Arc::new(users),
        default_device: settings.default_device.clone(),
        default_window: settings.query_window,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr).await?;
    log::info!("Starting HTTP server on http://{}", addr);

    let server_cancel = CancellationToken::new();
    let signal_task = cancel_on_shutdown(server_cancel.clone());
    let stop = server_cancel.clone();

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;

    log::info!("HTTP server stopped, flushing the write buffer");
    writer_cancel.cancel();
    if let Err(e) = writer_task.await {
        log::error!("Write buffer task failed: {}", e);
    }
    signal_task.abort();

    let totals = writer_stats.stats();
    log::info!(
        "Shutdown complete: {} accepted, {} written, {} duplicates, {} dropped",
        totals.accepted,
        totals.written,
        totals.duplicates,
        totals.dropped
    );
    Ok(())
}
