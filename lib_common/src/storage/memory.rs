use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{Series, SeriesPoint, StoreError, TimeSeriesStore};
use crate::readings::{SensorKind, SensorReading};

/// Series identity plus timestamp; writing the same key again replaces the value.
type PointKey = (String, String, SensorKind, DateTime<Utc>);

/// # Memory Store
///
/// Keeps every point in a map keyed like an InfluxDB point, so a rewritten
/// point replaces the old one. Nothing is persisted.
#[derive(Default)]
pub struct MemoryStore {
    points: RwLock<BTreeMap<PointKey, f64>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct points held.
    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    /// `true` when no point is held.
    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write_points(&self, readings: &[SensorReading]) -> Result<usize, StoreError> {
        let mut points = self.points.write().await;
        let mut stored = 0;
        for r in readings {
            if !r.value.is_finite() {
                log::warn!("Skipping non-finite {} value of {}", r.sensor, r.device_id);
                continue;
            }
            points.insert(
                (r.device_id.clone(), r.user.clone(), r.sensor, r.timestamp),
                r.value,
            );
            stored += 1;
        }
        Ok(stored)
    }

    async fn query_series(
        &self,
        sensor: SensorKind,
        device_id: &str,
        window: Duration,
    ) -> Result<Series, StoreError> {
        // A window reaching past the representable range covers everything.
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let points = self
            .points
            .read()
            .await
            .iter()
            .filter(|((device, _, kind, time), _)| device == device_id && *kind == sensor && *time > since)
            .map(|((_, _, _, time), value)| SeriesPoint { time: *time, value: *value })
            .collect();

        Ok(Series::new(sensor, device_id, points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(sensor: SensorKind, value: f64, age_secs: i64) -> SensorReading {
        SensorReading {
            device_id: "01".into(),
            sensor,
            value,
            user: "alice".into(),
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn rewriting_a_point_replaces_it() {
        let store = MemoryStore::new();
        let r = reading(SensorKind::Light, 1.0, 10);
        store.write_points(&[r.clone()]).await.unwrap();
        store.write_points(&[SensorReading { value: 2.0, ..r }]).await.unwrap();
        assert_eq!(store.len().await, 1);

        let series = store
            .query_series(SensorKind::Light, "01", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(series.points.len(), 1);
        assert_eq!(series.points[0].value, 2.0);
    }

    #[tokio::test]
    async fn query_filters_sensor_device_and_window() {
        let store = MemoryStore::new();
        store
            .write_points(&[
                reading(SensorKind::Light, 1.0, 30),
                reading(SensorKind::Light, 2.0, 10),
                reading(SensorKind::Light, 3.0, 7200),
                reading(SensorKind::Humidity, 50.0, 10),
                SensorReading { device_id: "02".into(), ..reading(SensorKind::Light, 9.0, 10) },
            ])
            .await
            .unwrap();

        let series = store
            .query_series(SensorKind::Light, "01", Duration::from_secs(3600))
            .await
            .unwrap();
        let values: Vec<f64> = series.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn non_finite_values_are_skipped_alone() {
        let store = MemoryStore::new();
        let stored = store
            .write_points(&[
                reading(SensorKind::Light, 1.0, 30),
                reading(SensorKind::Light, f64::NAN, 20),
                reading(SensorKind::Light, 3.0, 10),
            ])
            .await
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn huge_windows_return_everything() {
        let store = MemoryStore::new();
        store.write_points(&[reading(SensorKind::Light, 1.0, 7200)]).await.unwrap();

        for window in [Duration::from_secs(60_000_000_000_000), Duration::MAX] {
            let series = store.query_series(SensorKind::Light, "01", window).await.unwrap();
            assert_eq!(series.points.len(), 1);
        }
    }
}
