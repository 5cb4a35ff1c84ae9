use serde::{Deserialize, Serialize};
use std::fmt;

/// One line of `rtl_433 -F json` output. Every measurement is optional and
/// a zero reading counts as absent.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct SensorReading {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "temperature_C")]
    pub temperature_c: Option<f32>,
    #[serde(rename = "temperature_F")]
    pub temperature_f: Option<f32>,
    pub humidity: Option<f32>,
    #[serde(rename = "wind_avg_km_h")]
    pub wind_speed: Option<f32>,
    #[serde(rename = "wind_dir_deg")]
    pub wind_dir: Option<f32>,
    #[serde(rename = "rain_mm")]
    pub rain: Option<f32>,
}

impl SensorReading {
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            model: self.model.clone(),
            id: self.id,
        }
    }
}

/// Coalesced sensor state as published to MQTT. Temperature is Celsius.
/// Also what the temperature aggregation reads back off the broker.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SensorReport {
    pub temperature: f32,
    #[serde(skip_serializing_if = "is_zero")]
    pub humidity: f32,
    #[serde(skip_serializing_if = "is_zero")]
    pub wind_speed: f32,
    #[serde(skip_serializing_if = "is_zero")]
    pub wind_dir: f32,
    #[serde(skip_serializing_if = "is_zero")]
    pub rain: f32,
}

fn is_zero(value: &f32) -> bool {
    *value == 0.0
}

/// Identity of a physical sensor. Model plus id is unique enough for the
/// handful of devices in range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub model: String,
    pub id: i64,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.id)
    }
}
