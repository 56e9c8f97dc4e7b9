//! # Storage Module
//!
//! The time-series side of the system. Readings are written as points of the
//! `sensor_data` measurement, tagged with `device_id` and `user`, one float
//! field per sensor. Queries return one sensor of one device over a trailing
//! time window, sorted by time, ready for charting.
//!
//! ## Contained Modules:
//! - **`influx`**: the InfluxDB client (v2 line-protocol write, SQL query).
//! - **`memory`**: an in-process store with the same overwrite semantics,
//!   for development runs and tests.
//! - **`line_protocol`**: the line-protocol encoder.
//! - **`series`**: query result types.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::readings::{SensorKind, SensorReading};

/// InfluxDB HTTP client.
pub mod influx;
/// Line-protocol encoding.
pub mod line_protocol;
/// In-process store.
pub mod memory;
/// Query result types.
pub mod series;

pub use influx::{InfluxConfig, InfluxStore};
pub use memory::MemoryStore;
pub use series::{Series, SeriesPoint};

/// The measurement every reading is written to.
pub const MEASUREMENT: &str = "sensor_data";

/// Failures talking to a store.
///
/// The split between `Unavailable` and `Rejected` drives retry decisions:
/// the former is worth retrying, the latter never succeeds as-is.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network failure, timeout, 5xx, 408 or 429.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request (4xx): bad data, bad credentials.
    #[error("store rejected the request (status {status}): {body}")]
    Rejected {
        /// HTTP status returned by the store.
        status: u16,
        /// Response body, for the log.
        body: String,
    },

    /// A reading cannot be represented as a point.
    #[error("cannot encode point: {0}")]
    Encode(String),

    /// The store answered with something we could not read.
    #[error("cannot decode store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Maps an HTTP status and body to the matching error.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            408 | 429 => StoreError::Unavailable(format!("status {}: {}", status, body)),
            s if s >= 500 => StoreError::Unavailable(format!("status {}: {}", status, body)),
            _ => StoreError::Rejected { status, body },
        }
    }
}

/// # Time-Series Store
///
/// The write/query contract the pipeline and the API depend on.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Writes a batch of readings and returns how many were stored. A
    /// reading the store cannot represent is skipped with a warning rather
    /// than failing its batch. Writing the same reading (same device, user,
    /// sensor and timestamp) twice leaves a single point.
    async fn write_points(&self, readings: &[SensorReading]) -> Result<usize, StoreError>;

    /// All samples of `sensor` for `device_id` newer than `now - window`,
    /// sorted ascending by time.
    async fn query_series(
        &self,
        sensor: SensorKind,
        device_id: &str,
        window: Duration,
    ) -> Result<Series, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_splits_transient_from_permanent() {
        assert!(StoreError::from_status(503, String::new()).is_transient());
        assert!(StoreError::from_status(429, String::new()).is_transient());
        assert!(StoreError::from_status(408, String::new()).is_transient());
        assert!(!StoreError::from_status(400, String::new()).is_transient());
        assert!(!StoreError::from_status(401, String::new()).is_transient());
    }
}
