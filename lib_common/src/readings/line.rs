use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::sensor::SensorKind;

/// Reasons a reading line is refused.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("reading line is too short ({0} bytes, need at least 4)")]
    TooShort(usize),

    #[error("device id and sensor code must be ASCII: {0:?}")]
    NotAscii(String),

    #[error("invalid reading value {value:?} in line {line:?}")]
    InvalidValue { line: String, value: String },
}

/// # Sensor Reading
///
/// One sample taken from one sensor of one device, tagged with the user it
/// belongs to and the time it was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub sensor: SensorKind,
    pub value: f64,
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

/// Parses a single reading line such as `01ST21.5`.
///
/// Layout: bytes `0..2` device id, `2..4` sensor code, the remainder is the
/// value. Surrounding whitespace (including the trailing `\r\n` most boards
/// send) is ignored. An unrecognised sensor code is kept as
/// [`SensorKind::Unknown`]; a value that is not a finite number is an error.
pub fn parse_line(
    line: &str,
    user: &str,
    timestamp: DateTime<Utc>,
) -> Result<SensorReading, ParseError> {
    let line = line.trim();
    if line.len() < 4 {
        return Err(ParseError::TooShort(line.len()));
    }

    let head = line.as_bytes();
    if !head[..4].is_ascii() {
        return Err(ParseError::NotAscii(line.to_string()));
    }

    // The first four bytes are ASCII, so these slices sit on char boundaries.
    let device_id = &line[0..2];
    let code = &line[2..4];
    let raw_value = line[4..].trim();

    let value = raw_value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::InvalidValue {
            line: line.to_string(),
            value: raw_value.to_string(),
        })?;

    Ok(SensorReading {
        device_id: device_id.to_string(),
        sensor: SensorKind::from_code(code),
        value,
        user: user.to_string(),
        timestamp,
    })
}

/// Parses every non-blank line of `body`. Stops at the first bad line.
pub fn parse_lines(
    body: &str,
    user: &str,
    timestamp: DateTime<Utc>,
) -> Result<Vec<SensorReading>, ParseError> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| parse_line(l, user, timestamp))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_a_well_formed_line() {
        let r = parse_line("01ST21.5\r\n", "alice", ts()).unwrap();
        assert_eq!(r.device_id, "01");
        assert_eq!(r.sensor, SensorKind::SoilTemperature);
        assert_eq!(r.value, 21.5);
        assert_eq!(r.user, "alice");
        assert_eq!(r.timestamp, ts());
    }

    #[test]
    fn value_may_carry_inner_whitespace_and_sign() {
        let r = parse_line("A7AT -3.25 ", "bob", ts()).unwrap();
        assert_eq!(r.sensor, SensorKind::AirTemperature);
        assert_eq!(r.value, -3.25);
    }

    #[test]
    fn unknown_code_is_kept() {
        let r = parse_line("02ZZ7", "bob", ts()).unwrap();
        assert_eq!(r.sensor, SensorKind::Unknown);
        assert_eq!(r.value, 7.0);
    }

    #[test]
    fn short_lines_are_rejected() {
        assert_eq!(parse_line("01L", "u", ts()), Err(ParseError::TooShort(3)));
        assert_eq!(parse_line("  \r\n", "u", ts()), Err(ParseError::TooShort(0)));
    }

    #[test]
    fn missing_or_garbage_values_are_rejected() {
        assert!(matches!(
            parse_line("01LI", "u", ts()),
            Err(ParseError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_line("01LIabc", "u", ts()),
            Err(ParseError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_line("01LINaN", "u", ts()),
            Err(ParseError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_line("01LIinf", "u", ts()),
            Err(ParseError::InvalidValue { .. })
        ));
    }

    #[test]
    fn non_ascii_header_is_rejected_without_panicking() {
        assert!(matches!(
            parse_line("é1LI5", "u", ts()),
            Err(ParseError::NotAscii(_))
        ));
    }

    #[test]
    fn multi_line_bodies_skip_blank_lines() {
        let body = "01LI100\n\n01HU40.5\r\n";
        let readings = parse_lines(body, "u", ts()).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].sensor, SensorKind::Humidity);
    }
}
