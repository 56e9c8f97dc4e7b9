//! # Readings Module
//!
//! Sensor nodes emit one reading per line: a two character device id, a two
//! character sensor code and the numeric value, e.g. `01LI512.0`. This module
//! owns the sensor catalogue and turns such lines into [`SensorReading`]s.

/// Reading-line parser.
pub mod line;
/// The catalogue of sensor codes and their field names.
pub mod sensor;

pub use line::{parse_line, parse_lines, ParseError, SensorReading};
pub use sensor::{SensorKind, UnknownSensorField};

/// Request header carrying a line's idempotency key, `<session>-<seq>`.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
/// Request header carrying the RFC 3339 time the line was read.
pub const READING_TIME_HEADER: &str = "x-reading-time";
/// Request header naming the user the readings belong to.
pub const SENSOR_USER_HEADER: &str = "x-sensor-user";
