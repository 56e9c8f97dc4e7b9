use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// # Sensor Kind
///
/// The sensors a node can report. The two character code is what travels on
/// the serial line; the field name is what the store and the dashboard see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// `LI`
    Light,
    /// `HU`
    Humidity,
    /// `ST`
    SoilTemperature,
    /// `AT`
    AirTemperature,
    /// `SM`
    SoilMoisture,
    /// Any code not in the catalogue. Still stored, under the `unknown` field.
    Unknown,
}

/// Field name was not one of the catalogue's field names.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown sensor field: {0}")]
pub struct UnknownSensorField(pub String);

impl SensorKind {
    /// Every sensor the dashboard charts, in display order.
    pub const KNOWN: [SensorKind; 5] = [
        SensorKind::Light,
        SensorKind::Humidity,
        SensorKind::SoilTemperature,
        SensorKind::AirTemperature,
        SensorKind::SoilMoisture,
    ];

    /// Maps a serial code to a sensor. Codes are case sensitive.
    pub fn from_code(code: &str) -> Self {
        match code {
            "LI" => SensorKind::Light,
            "HU" => SensorKind::Humidity,
            "ST" => SensorKind::SoilTemperature,
            "AT" => SensorKind::AirTemperature,
            "SM" => SensorKind::SoilMoisture,
            _ => SensorKind::Unknown,
        }
    }

    /// The serial code, `None` for [`SensorKind::Unknown`].
    pub fn code(self) -> Option<&'static str> {
        match self {
            SensorKind::Light => Some("LI"),
            SensorKind::Humidity => Some("HU"),
            SensorKind::SoilTemperature => Some("ST"),
            SensorKind::AirTemperature => Some("AT"),
            SensorKind::SoilMoisture => Some("SM"),
            SensorKind::Unknown => None,
        }
    }

    /// The field name used in the store.
    pub fn field_name(self) -> &'static str {
        match self {
            SensorKind::Light => "light",
            SensorKind::Humidity => "humidity",
            SensorKind::SoilTemperature => "soil_temperature",
            SensorKind::AirTemperature => "air_temperature",
            SensorKind::SoilMoisture => "soil_moisture",
            SensorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

impl FromStr for SensorKind {
    type Err = UnknownSensorField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(SensorKind::Light),
            "humidity" => Ok(SensorKind::Humidity),
            "soil_temperature" => Ok(SensorKind::SoilTemperature),
            "air_temperature" => Ok(SensorKind::AirTemperature),
            "soil_moisture" => Ok(SensorKind::SoilMoisture),
            "unknown" => Ok(SensorKind::Unknown),
            other => Err(UnknownSensorField(other.to_string())),
        }
    }
}
