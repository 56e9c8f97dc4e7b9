//! # InfluxDB Store
//!
//! Writes go through the v2 write API as line protocol; queries go through the
//! SQL endpoint and come back as JSON rows. Both use one pooled
//! `reqwest::Client` with the 30 second timeout the cloud service expects.
//!
//! Retrying is not done here. The write buffer decides whether and when to
//! try a batch again, based on [`StoreError::is_transient`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use url::Url;

use super::line_protocol::encode_batch;
use super::{Series, SeriesPoint, StoreError, TimeSeriesStore, MEASUREMENT};
use crate::readings::{SensorKind, SensorReading};

/// Connection settings for an InfluxDB instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Base URL, e.g. `https://us-east-1-1.aws.cloud2.influxdata.com`.
    pub host: String,
    /// Organisation name.
    pub org: String,
    /// Bucket (database) name.
    pub bucket: String,
    /// API token.
    pub token: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl InfluxConfig {
    /// Settings with the default 30 second timeout.
    pub fn new(host: &str, org: &str, bucket: &str, token: &str) -> Self {
        Self {
            host: host.to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            token: token.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// # InfluxDB Store
pub struct InfluxStore {
    client: reqwest::Client,
    write_url: Url,
    query_url: Url,
    bucket: String,
    token: String,
}

impl InfluxStore {
    /// Builds the client and the endpoint URLs.
    ///
    /// # Errors
    /// `StoreError::Unavailable` if the HTTP client cannot be built,
    /// `StoreError::Rejected` if the host is not a valid URL.
    pub fn new(config: InfluxConfig) -> Result<Self, StoreError> {
        let base = Url::parse(&config.host).map_err(|e| StoreError::Rejected {
            status: 0,
            body: format!("invalid InfluxDB host {:?}: {}", config.host, e),
        })?;

        let mut write_url = base.clone();
        write_url.set_path("/api/v2/write");
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");

        let mut query_url = base;
        query_url.set_path("/api/v3/query_sql");

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            write_url,
            query_url,
            bucket: config.bucket,
            token: config.token,
        })
    }

    /// The write endpoint, including org/bucket/precision parameters.
    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

/// Builds the SQL for one sensor of one device over the trailing window.
///
/// The field name comes from the sensor catalogue, never from user input; the
/// device id is quoted as an SQL string literal.
pub fn build_series_query(sensor: SensorKind, device_id: &str, window: Duration) -> String {
    let minutes = window.as_secs().div_ceil(60).max(1);
    format!(
        "SELECT \"{field}\", time FROM {measurement} \
         WHERE time > (NOW() - INTERVAL '{minutes} MINUTES') \
         AND device_id = '{device}' ORDER BY time ASC",
        field = sensor.field_name(),
        measurement = MEASUREMENT,
        minutes = minutes,
        device = device_id.replace('\'', "''"),
    )
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    // The SQL endpoint renders timestamps without an offset; they are UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|n| n.and_utc())
}

/// Turns the JSON rows of a series query into points. Rows with a null value
/// are skipped; a row without a readable time is an error.
pub fn rows_to_points(sensor: SensorKind, rows: &[Map<String, Value>]) -> Result<Vec<SeriesPoint>, StoreError> {
    let field = sensor.field_name();
    let mut points = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(value) = row.get(field).and_then(Value::as_f64) else {
            continue;
        };
        let time = row
            .get("time")
            .and_then(Value::as_str)
            .and_then(parse_time)
            .ok_or_else(|| StoreError::Decode(format!("row without a valid time: {:?}", row)))?;
        points.push(SeriesPoint { time, value });
    }
    Ok(points)
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write_points(&self, readings: &[SensorReading]) -> Result<usize, StoreError> {
        let batch = encode_batch(readings);
        for e in &batch.skipped {
            log::warn!("Leaving a reading out of the batch: {}", e);
        }
        if batch.points == 0 {
            return Ok(0);
        }
        let body = batch.body;

        let response = self
            .client
            .post(self.write_url.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            log::debug!("Wrote {} points to bucket {}", batch.points, self.bucket);
            return Ok(batch.points);
        }
        let text = response.text().await.unwrap_or_default();
        Err(StoreError::from_status(status.as_u16(), text))
    }

    async fn query_series(
        &self,
        sensor: SensorKind,
        device_id: &str,
        window: Duration,
    ) -> Result<Series, StoreError> {
        let sql = build_series_query(sensor, device_id, window);
        log::debug!("Influx query: {}", sql);

        let response = self
            .client
            .post(self.query_url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&json!({ "db": self.bucket, "q": sql, "format": "json" }))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::from_status(status.as_u16(), text));
        }

        let rows: Vec<Map<String, Value>> = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let points = rows_to_points(sensor, &rows)?;
        log::debug!("Query for {} on {} returned {} points", sensor, device_id, points.len());
        Ok(Series::new(sensor, device_id, points))
    }
}
