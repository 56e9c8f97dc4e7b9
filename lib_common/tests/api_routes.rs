mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use common::{eventually, fast_writer, spawn_server, wait_for_points};
use lib_common::pipeline::WriteBufferConfig;
use lib_common::readings::{SensorKind, SensorReading};
use lib_common::storage::{MemoryStore, Series, StoreError, TimeSeriesStore};
use serde_json::Value;

fn recent() -> String {
    (Utc::now() - chrono::TimeDelta::seconds(30)).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

async fn post_write(base: &str, body: &str, key: Option<&str>) -> reqwest::Response {
    let mut req = reqwest::Client::new()
        .post(format!("{}/write", base))
        .header("content-type", "text/plain")
        .header("x-reading-time", recent())
        .header("x-sensor-user", "alice")
        .body(body.to_string());
    if let Some(k) = key {
        req = req.header("idempotency-key", k);
    }
    req.send().await.unwrap()
}

async fn get_json(url: String) -> (u16, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn written_lines_show_up_in_series_queries() {
    let store = Arc::new(MemoryStore::new());
    let server = spawn_server(store.clone(), fast_writer()).await;

    let resp = post_write(&server.base, "01LI42.5\n", Some("s-1")).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"], "OK");
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["duplicates"], 0);

    let url = format!("{}/api/series/01/light?minutes=10", server.base);
    assert!(
        eventually(|| {
            let url = url.clone();
            async move { get_json(url).await.1["points"].as_array().map(|p| p.len()) == Some(1) }
        })
        .await
    );

    let (status, series) = get_json(url).await;
    assert_eq!(status, 200);
    assert_eq!(series["sensor"], "light");
    assert_eq!(series["device_id"], "01");
    assert_eq!(series["points"][0]["value"], 42.5);
}

#[tokio::test]
async fn resent_lines_are_acknowledged_as_duplicates() {
    let store = Arc::new(MemoryStore::new());
    let server = spawn_server(store.clone(), fast_writer()).await;

    post_write(&server.base, "01HU55", Some("s-9")).await;
    let resp = post_write(&server.base, "01HU55", Some("s-9")).await;

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], 0);
    assert_eq!(body["duplicates"], 1);
    assert!(wait_for_points(&store, 1).await);
}

#[tokio::test]
async fn multi_line_bodies_store_every_line() {
    let store = Arc::new(MemoryStore::new());
    let server = spawn_server(store.clone(), fast_writer()).await;

    let resp = post_write(&server.base, "01LI1\r\n01LI2\n\n01HU3\n", Some("s-2")).await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], 3);

    // Two light readings in one body must not collapse into one point.
    assert!(wait_for_points(&store, 3).await);

    let resp = post_write(&server.base, "01LI1\r\n01LI2\n\n01HU3\n", Some("s-2")).await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["duplicates"], 3);
}

#[tokio::test]
async fn malformed_requests_are_rejected_with_json_errors() {
    let server = spawn_server(Arc::new(MemoryStore::new()), fast_writer()).await;
    let client = reqwest::Client::new();

    let resp = post_write(&server.base, "01LIabc", None).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error_type"], "InvalidLine");
    assert!(body["detail"].as_str().unwrap().contains("abc"));

    let resp = client
        .post(format!("{}/write", server.base))
        .body(vec![0x30u8, 0x31, 0xff, 0xfe, 0x31])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error_type"], "BodyUtf8Error");

    let resp = client
        .post(format!("{}/write", server.base))
        .header("x-reading-time", "last tuesday")
        .body("01LI1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error_type"], "InvalidReadingTime");

    let resp = post_write(&server.base, "\n\n", None).await;
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/write", server.base))
        .header("x-reading-time", "2300-01-01T00:00:00Z")
        .body("01LI1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error_type"], "InvalidReadingTime");

    let (status, body) = get_json(format!("{}/api/series/01/temperature", server.base)).await;
    assert_eq!(status, 400);
    assert_eq!(body["error_type"], "UnknownSensor");
}

#[tokio::test]
async fn oversized_windows_are_rejected_without_killing_the_server() {
    let server = spawn_server(Arc::new(MemoryStore::new()), fast_writer()).await;

    for minutes in ["1000000000000", "18446744073709551615"] {
        let (status, body) =
            get_json(format!("{}/api/series/01/light?minutes={}", server.base, minutes)).await;
        assert_eq!(status, 400);
        assert_eq!(body["error_type"], "InvalidWindow");

        let (status, _) = get_json(format!("{}/api/dashboard?minutes={}", server.base, minutes)).await;
        assert_eq!(status, 400);
    }

    let (status, _) = get_json(format!("{}/api/series/01/light?minutes=60", server.base)).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn dashboard_groups_sensors_into_tabs() {
    let store = Arc::new(MemoryStore::new());
    let server = spawn_server(store.clone(), fast_writer()).await;

    post_write(&server.base, "01ST18.5", Some("a")).await;
    post_write(&server.base, "01AT21.0", Some("b")).await;
    assert!(wait_for_points(&store, 2).await);

    let (status, dash) = get_json(format!("{}/api/dashboard", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(dash["device_id"], "01");
    assert_eq!(dash["window_minutes"], 60);
    assert_eq!(dash["light"].as_array().unwrap().len(), 1);
    assert_eq!(dash["temperature"][0]["sensor"], "soil_temperature");
    assert_eq!(dash["temperature"][0]["points"][0]["value"], 18.5);
    assert_eq!(dash["temperature"][1]["sensor"], "air_temperature");
    assert_eq!(dash["hum_and_moisture"][0]["sensor"], "humidity");
    assert_eq!(dash["hum_and_moisture"][1]["sensor"], "soil_moisture");

    let (_, other) = get_json(format!("{}/api/dashboard/02?minutes=5", server.base)).await;
    assert_eq!(other["device_id"], "02");
    assert_eq!(other["window_minutes"], 5);
    assert_eq!(other["temperature"][0]["points"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn health_reports_writer_counters() {
    let store = Arc::new(MemoryStore::new());
    let server = spawn_server(store.clone(), fast_writer()).await;
    post_write(&server.base, "01SM40", Some("h-1")).await;
    let writer = server.writer.clone();
    assert!(eventually(|| std::future::ready(writer.stats().written == 1)).await);

    let (status, health) = get_json(format!("{}/health", server.base)).await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["writer"]["accepted"], 1);
    assert_eq!(health["writer"]["written"], 1);
}

#[tokio::test]
async fn notify_is_acknowledged() {
    let server = spawn_server(Arc::new(MemoryStore::new()), fast_writer()).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/notify", server.base))
        .body("gateway rebooted")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"], "OK");
}

/// Never finishes a write; queries fail.
struct StuckStore;

#[async_trait]
impl TimeSeriesStore for StuckStore {
    async fn write_points(&self, _readings: &[SensorReading]) -> Result<usize, StoreError> {
        std::future::pending().await
    }

    async fn query_series(
        &self,
        _sensor: SensorKind,
        _device_id: &str,
        _window: Duration,
    ) -> Result<Series, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn full_write_queue_answers_503() {
    let config = WriteBufferConfig {
        queue_capacity: 1,
        enqueue_timeout: Duration::from_millis(50),
        ..fast_writer()
    };
    let server = spawn_server(Arc::new(StuckStore), config).await;

    // Picked up by the worker, which then hangs.
    assert_eq!(post_write(&server.base, "01LI1", None).await.status(), 200);
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Fills the queue.
    assert_eq!(post_write(&server.base, "01LI2", None).await.status(), 200);

    let resp = post_write(&server.base, "01LI3", Some("k-3")).await;
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.headers()["retry-after"], "1");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error_type"], "Overloaded");
    assert_eq!(server.writer.stats().rejected_overload, 1);
}

#[tokio::test]
async fn store_failures_on_queries_answer_502() {
    let server = spawn_server(Arc::new(StuckStore), fast_writer()).await;

    let (status, body) = get_json(format!("{}/api/series/01/humidity", server.base)).await;
    assert_eq!(status, 502);
    assert_eq!(body["error_type"], "StoreError");

    let (status, _) = get_json(format!("{}/api/dashboard", server.base)).await;
    assert_eq!(status, 502);
}
