use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::readings::SensorKind;

/// One sample in a queried series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Sample time.
    pub time: DateTime<Utc>,
    /// Sample value.
    pub value: f64,
}

/// # Series
///
/// One sensor of one device over a time window; what a single dashboard chart
/// plots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// The sensor plotted.
    pub sensor: SensorKind,
    /// The device the samples came from.
    pub device_id: String,
    /// Samples, oldest first.
    pub points: Vec<SeriesPoint>,
}

impl Series {
    /// Builds a series and sorts its points by time. The sort is stable so
    /// samples sharing a timestamp keep the store's order.
    pub fn new(sensor: SensorKind, device_id: impl Into<String>, mut points: Vec<SeriesPoint>) -> Self {
        points.sort_by_key(|p| p.time);
        Self {
            sensor,
            device_id: device_id.into(),
            points,
        }
    }
}
