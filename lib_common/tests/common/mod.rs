#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lib_common::api::{router, AppState, StaticUserDirectory};
use lib_common::core::RetryPolicy;
use lib_common::pipeline::{WriteBuffer, WriteBufferConfig, WriteBufferHandle};
use lib_common::storage::TimeSeriesStore;
use tokio_util::sync::CancellationToken;

/// Small batches and a short interval so writes land quickly.
pub fn fast_writer() -> WriteBufferConfig {
    WriteBufferConfig {
        batch_size: 1,
        flush_interval: Duration::from_millis(20),
        queue_capacity: 64,
        enqueue_timeout: Duration::from_millis(200),
        retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50)).with_max_attempts(3),
        max_pending: 1000,
        dedupe_capacity: 64,
    }
}

pub struct TestServer {
    pub base: String,
    pub writer: WriteBufferHandle,
    pub cancel: CancellationToken,
}

/// Serves the router over `store` on an ephemeral local port.
pub async fn spawn_server(store: Arc<dyn TimeSeriesStore>, config: WriteBufferConfig) -> TestServer {
    let cancel = CancellationToken::new();
    let (writer, _task) = WriteBuffer::spawn(Arc::clone(&store), config, cancel.clone());

    let state = AppState {
        writer: writer.clone(),
        store,
        users: Arc::new(StaticUserDirectory::new("farm", ["alice"])),
        default_device: "01".to_string(),
        default_window: Duration::from_secs(3600),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        writer,
        cancel,
    }
}

/// Polls `check` every 20 ms for up to 2 seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Waits up to 2 seconds for `store` to hold `n` points.
pub async fn wait_for_points(store: &lib_common::storage::MemoryStore, n: usize) -> bool {
    for _ in 0..100 {
        if store.len().await == n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
