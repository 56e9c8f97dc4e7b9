//! InfluxDB line protocol:
//! `measurement,tag=v,tag=v field=value timestamp_ns`
use std::fmt::Write as _;

use super::{StoreError, MEASUREMENT};
use crate::readings::SensorReading;

fn escape_measurement(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Tag keys, tag values and field keys share one escaping rule.
fn escape_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            ',' | '=' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            // Line protocol has no escape for newlines; they would split the point.
            '\n' | '\r' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}

/// Encodes one reading as a line-protocol point with nanosecond precision.
pub fn encode_point(reading: &SensorReading) -> Result<String, StoreError> {
    if !reading.value.is_finite() {
        return Err(StoreError::Encode(format!(
            "non-finite value {} for device {}",
            reading.value, reading.device_id
        )));
    }
    let ts = reading.timestamp.timestamp_nanos_opt().ok_or_else(|| {
        StoreError::Encode(format!("timestamp {} out of range", reading.timestamp))
    })?;

    let mut line = escape_measurement(MEASUREMENT);
    // Tags in key order; empty tag values are not allowed by the protocol.
    for (key, value) in [("device_id", &reading.device_id), ("user", &reading.user)] {
        if value.is_empty() {
            continue;
        }
        let _ = write!(line, ",{}={}", key, escape_key(value));
    }
    // `{:?}` keeps a decimal point on whole numbers (1.0, not 1) so the field
    // is never mistaken for an integer.
    let _ = write!(
        line,
        " {}={:?} {}",
        escape_key(reading.sensor.field_name()),
        reading.value,
        ts
    );
    Ok(line)
}

/// A batch body and the readings left out of it.
#[derive(Debug, Default)]
pub struct EncodedBatch {
    /// Points, one per line.
    pub body: String,
    /// Number of points in `body`.
    pub points: usize,
    /// Why each left-out reading could not be encoded.
    pub skipped: Vec<StoreError>,
}

/// Encodes a batch, one point per line. A reading that cannot be encoded is
/// left out and reported in [`EncodedBatch::skipped`].
pub fn encode_batch(readings: &[SensorReading]) -> EncodedBatch {
    let mut batch = EncodedBatch::default();
    for reading in readings {
        match encode_point(reading) {
            Ok(line) => {
                if !batch.body.is_empty() {
                    batch.body.push('\n');
                }
                batch.body.push_str(&line);
                batch.points += 1;
            }
            Err(e) => batch.skipped.push(e),
        }
    }
    batch
}
