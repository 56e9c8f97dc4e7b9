use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::error::ApiError;
use super::state::AppState;
use crate::pipeline::SubmitOutcome;
use crate::readings::{
    parse_lines, SensorKind, IDEMPOTENCY_KEY_HEADER, READING_TIME_HEADER, SENSOR_USER_HEADER,
};
use crate::storage::Series;

/// Builds the ingest and query router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/write", post(write))
        .route("/notify", post(notify))
        .route("/health", get(health))
        .route("/api/series/{device_id}/{sensor}", get(series))
        .route("/api/dashboard", get(dashboard_default))
        .route("/api/dashboard/{device_id}", get(dashboard))
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Longest window the query routes accept, ten years.
pub const MAX_WINDOW_MINUTES: u64 = 10 * 366 * 24 * 60;

/// The capture time header, or now. Points carry nanosecond timestamps, so
/// times outside 1677-09-21..2262-04-11 are refused here rather than failing
/// the batch they would land in.
fn reading_time(headers: &HeaderMap) -> Result<DateTime<Utc>, ApiError> {
    let Some(raw) = header_str(headers, READING_TIME_HEADER) else {
        return Ok(Utc::now());
    };
    let time = DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::InvalidReadingTime(format!("{}: {}", raw, e)))?;
    if time.timestamp_nanos_opt().is_none() {
        return Err(ApiError::InvalidReadingTime(format!(
            "{}: outside the nanosecond timestamp range",
            raw
        )));
    }
    Ok(time)
}

/// `POST /write`: one reading per line.
///
/// Every line is validated before any is queued, so a bad line rejects the
/// whole body. Line `i` of a multi-line body is stamped `i` nanoseconds after
/// the capture time and keyed `<key>#<i>`, so a resent body maps onto the same
/// points and the same keys.
async fn write(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = String::from_utf8(body.to_vec())?;
    let user = state.users.resolve(header_str(&headers, SENSOR_USER_HEADER));
    let captured_at = reading_time(&headers)?;

    let readings = parse_lines(&body, &user, captured_at)?;
    if readings.is_empty() {
        return Err(ApiError::EmptyBody);
    }

    let key = header_str(&headers, IDEMPOTENCY_KEY_HEADER);
    let multi = readings.len() > 1;
    let mut accepted = 0usize;
    let mut duplicates = 0usize;

    for (i, mut reading) in readings.into_iter().enumerate() {
        let line_key = key.map(|k| if multi { format!("{}#{}", k, i) } else { k.to_string() });
        if i > 0 {
            reading.timestamp += TimeDelta::nanoseconds(i as i64);
        }
        match state.writer.submit(reading, line_key.as_deref()).await? {
            SubmitOutcome::Accepted => accepted += 1,
            SubmitOutcome::Duplicate => duplicates += 1,
        }
    }

    log::debug!("Accepted {} readings for {} ({} duplicates)", accepted, user, duplicates);
    Ok(Json(json!({
        "result": "OK",
        "accepted": accepted,
        "duplicates": duplicates,
    })))
}

/// `POST /notify`: free-form notifications from the gateways, logged only.
async fn notify(body: String) -> Json<Value> {
    log::info!("Notification: {}", body.trim());
    Json(json!({ "result": "OK" }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "writer": state.writer.stats(),
    }))
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    minutes: Option<u64>,
}

impl WindowQuery {
    /// `minutes` as a window; zero counts as one minute.
    fn window(&self, default: Duration) -> Result<Duration, ApiError> {
        match self.minutes {
            None => Ok(default),
            Some(m) if m > MAX_WINDOW_MINUTES => Err(ApiError::InvalidWindow(format!(
                "minutes={} exceeds {}",
                m, MAX_WINDOW_MINUTES
            ))),
            Some(m) => Ok(Duration::from_secs(m.max(1) * 60)),
        }
    }
}

/// `GET /api/series/{device_id}/{sensor}?minutes=N`
async fn series(
    State(state): State<AppState>,
    Path((device_id, sensor)): Path<(String, String)>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Series>, ApiError> {
    let sensor: SensorKind = sensor.parse()?;
    let window = query.window(state.default_window)?;
    let series = state.store.query_series(sensor, &device_id, window).await?;
    Ok(Json(series))
}

/// The dashboard's three tabs.
#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub device_id: String,
    pub window_minutes: u64,
    /// Light.
    pub light: Vec<Series>,
    /// Soil then air temperature.
    pub temperature: Vec<Series>,
    /// Humidity then soil moisture.
    pub hum_and_moisture: Vec<Series>,
}

async fn build_dashboard(state: &AppState, device_id: String, window: Duration) -> Result<Dashboard, ApiError> {
    let queries = SensorKind::KNOWN.map(|sensor| state.store.query_series(sensor, &device_id, window));
    let mut by_sensor: HashMap<SensorKind, Series> = try_join_all(queries)
        .await?
        .into_iter()
        .map(|s| (s.sensor, s))
        .collect();

    let mut take = |sensor: SensorKind| {
        by_sensor
            .remove(&sensor)
            .unwrap_or_else(|| Series::new(sensor, device_id.as_str(), Vec::new()))
    };

    Ok(Dashboard {
        light: vec![take(SensorKind::Light)],
        temperature: vec![take(SensorKind::SoilTemperature), take(SensorKind::AirTemperature)],
        hum_and_moisture: vec![take(SensorKind::Humidity), take(SensorKind::SoilMoisture)],
        window_minutes: window.as_secs() / 60,
        device_id,
    })
}

/// `GET /api/dashboard`: the configured default device.
async fn dashboard_default(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Dashboard>, ApiError> {
    let window = query.window(state.default_window)?;
    let device_id = state.default_device.clone();
    Ok(Json(build_dashboard(&state, device_id, window).await?))
}

/// `GET /api/dashboard/{device_id}`
async fn dashboard(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Dashboard>, ApiError> {
    let window = query.window(state.default_window)?;
    Ok(Json(build_dashboard(&state, device_id, window).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_time(raw: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(READING_TIME_HEADER, HeaderValue::from_static(raw));
        headers
    }

    #[test]
    fn reading_time_must_fit_a_nanosecond_timestamp() {
        let t = reading_time(&with_time("2024-05-01T12:00:00.5+02:00")).unwrap();
        assert_eq!(t.to_rfc3339(), "2024-05-01T10:00:00.500+00:00");

        for raw in ["2300-01-01T00:00:00Z", "1600-01-01T00:00:00Z"] {
            assert!(matches!(
                reading_time(&with_time(raw)),
                Err(ApiError::InvalidReadingTime(_))
            ));
        }
    }

    #[test]
    fn window_is_clamped_below_and_bounded_above() {
        let default = Duration::from_secs(3600);
        let q = |minutes| WindowQuery { minutes };

        assert_eq!(q(None).window(default).unwrap(), default);
        assert_eq!(q(Some(0)).window(default).unwrap(), Duration::from_secs(60));
        assert_eq!(
            q(Some(MAX_WINDOW_MINUTES)).window(default).unwrap(),
            Duration::from_secs(MAX_WINDOW_MINUTES * 60)
        );
        for huge in [MAX_WINDOW_MINUTES + 1, 1_000_000_000_000, u64::MAX] {
            assert!(matches!(q(Some(huge)).window(default), Err(ApiError::InvalidWindow(_))));
        }
    }
}
