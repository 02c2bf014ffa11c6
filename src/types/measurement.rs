//! Measurement record types
//!
//! One closed enum over the sensor kinds the gateway reads. Records serialize
//! as a flat JSON object with the type tag inline, which is the shape used both
//! on the wire and in the disk spool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from unit standardization
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeasurementError {
    #[error("unknown measurement field: {0}")]
    UnknownField(String),
}

/// A single decoded measurement, tagged by sensor kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MeasurementRecord {
    /// RFM power node (node 10)
    #[serde(rename = "power_measurement")]
    Power(PowerMeasurement),
    /// RFM temperature / humidity node (nodes 19, 22, 23, 24)
    #[serde(rename = "temp_hum_measurement")]
    TempHumidity(TempHumidityMeasurement),
    /// Mesh-network plug meter
    #[serde(rename = "plug_measurement")]
    Plug(PlugMeasurement),
}

impl MeasurementRecord {
    /// Unique record id
    pub fn id(&self) -> Uuid {
        match self {
            Self::Power(m) => m.id,
            Self::TempHumidity(m) => m.id,
            Self::Plug(m) => m.id,
        }
    }

    /// Device identifier (UUID string for radio nodes, MAC for plug meters)
    pub fn device_id(&self) -> &str {
        match self {
            Self::Power(m) => &m.device_id,
            Self::TempHumidity(m) => &m.device_id,
            Self::Plug(m) => &m.device_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Power(m) => m.ts,
            Self::TempHumidity(m) => m.ts,
            Self::Plug(m) => m.ts,
        }
    }

    /// Wire type tag
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Power(_) => "power_measurement",
            Self::TempHumidity(_) => "temp_hum_measurement",
            Self::Plug(_) => "plug_measurement",
        }
    }
}

// ============================================================================
// Power (RFM node 10)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerMeasurement {
    pub id: Uuid,
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub power1: f64,
    pub power2: f64,
    pub power3: f64,
    pub power4: f64,
    pub vrms: f64,
    pub temperature: f64,
}

impl PowerMeasurement {
    /// Build from the six raw node values in frame order.
    pub fn from_raw(device_id: &str, ts: DateTime<Utc>, raw: [i16; 6]) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            ts,
            power1: f64::from(raw[0]),
            power2: f64::from(raw[1]),
            power3: f64::from(raw[2]),
            power4: f64::from(raw[3]),
            vrms: f64::from(raw[4]),
            temperature: f64::from(raw[5]),
        }
    }

    /// Scale a named field by `rate`.
    pub fn standardize(&mut self, name: &str, rate: f64) -> Result<(), MeasurementError> {
        let field = match name {
            "power1" => &mut self.power1,
            "power2" => &mut self.power2,
            "power3" => &mut self.power3,
            "power4" => &mut self.power4,
            "vrms" => &mut self.vrms,
            "temperature" => &mut self.temperature,
            other => return Err(MeasurementError::UnknownField(other.to_string())),
        };
        *field *= rate;
        Ok(())
    }
}

// ============================================================================
// Temperature / humidity (RFM nodes 19, 22, 23, 24)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempHumidityMeasurement {
    pub id: Uuid,
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub temperature: f64,
    pub temperature_external: f64,
    pub humidity: f64,
    pub battery: f64,
}

impl TempHumidityMeasurement {
    pub fn from_raw(device_id: &str, ts: DateTime<Utc>, raw: [i16; 4]) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            ts,
            temperature: f64::from(raw[0]),
            temperature_external: f64::from(raw[1]),
            humidity: f64::from(raw[2]),
            battery: f64::from(raw[3]),
        }
    }

    /// Scale a named field by `rate`; `"all"` scales every numeric field.
    pub fn standardize(&mut self, name: &str, rate: f64) -> Result<(), MeasurementError> {
        match name {
            "temperature" => self.temperature *= rate,
            "temperature_external" => self.temperature_external *= rate,
            "humidity" => self.humidity *= rate,
            "battery" => self.battery *= rate,
            "all" => {
                self.temperature *= rate;
                self.temperature_external *= rate;
                self.humidity *= rate;
                self.battery *= rate;
            }
            other => return Err(MeasurementError::UnknownField(other.to_string())),
        }
        Ok(())
    }
}

// ============================================================================
// Plug meter (mesh network)
// ============================================================================

/// Plug meter reading. Payloads may omit any field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlugMeasurement {
    pub id: Uuid,
    /// MAC address of the meter, colon separated upper-case hex
    pub device_id: String,
    pub ts: DateTime<Utc>,
    /// Relay state as reported ("ON" / "OFF")
    pub power_state: Option<String>,
    /// Load (W)
    pub load: Option<f64>,
    /// Current (mA)
    pub irms: Option<f64>,
    /// Voltage (V)
    pub vrms: Option<f64>,
    /// Line frequency (Hz)
    pub frequency: Option<f64>,
    /// Accumulated energy (kWh)
    pub work: Option<f64>,
}

impl PlugMeasurement {
    pub fn new(device_id: &str, ts: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            ts,
            power_state: None,
            load: None,
            irms: None,
            vrms: None,
            frequency: None,
            work: None,
        }
    }
}
