//! Mesh plug-meter payload decoder
//!
//! One frame per line: the meter's 64-bit MAC, then `KEY=value` fields
//! separated by `;`, whitespace or newlines. Values carry units that are
//! stripped on parse. Every field is optional.
//!
//! ```text
//! 00:13:A2:00:40:8B:6E:55 POW=ON;FREQ=50.0Hz;VRMS=230V;LOAD=100W;WORK=1.5kWh;IRMS=500mA
//! ```

use super::{DecodeError, FrameDecoder};
use crate::config::MeshConfig;
use crate::types::{MeasurementRecord, PlugMeasurement};
use chrono::Utc;
use regex::Regex;
use std::collections::HashSet;

/// Numeric value followed by an optional unit suffix
const VALUE_PATTERN: &str = r"^(-?\d+(?:\.\d+)?)\s*([A-Za-z]*)$";

#[derive(Debug, Clone)]
pub struct PlugDecoder {
    registered: HashSet<String>,
    value_re: Regex,
}

impl PlugDecoder {
    /// Build from the registered meter list. MACs are normalized.
    pub fn from_config(config: &MeshConfig) -> Result<Self, DecodeError> {
        let registered = config
            .plugmeters
            .iter()
            .map(|mac| normalize_mac(mac))
            .collect::<Result<HashSet<_>, _>>()?;
        let value_re = Regex::new(VALUE_PATTERN).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Ok(Self {
            registered,
            value_re,
        })
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    fn number(&self, key: &str, raw: &str) -> Result<f64, DecodeError> {
        self.value_re
            .captures(raw.trim())
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .ok_or_else(|| DecodeError::Malformed(format!("{}={}", key, raw)))
    }
}

impl FrameDecoder for PlugDecoder {
    fn decode(&self, frame: &str) -> Result<MeasurementRecord, DecodeError> {
        let frame = frame.trim();
        let (mac, fields) = match frame.split_once(char::is_whitespace) {
            Some((mac, rest)) => (mac, rest),
            None => (frame, ""),
        };
        if mac.is_empty() {
            return Err(DecodeError::Empty);
        }

        let device_id = normalize_mac(mac)?;
        if !self.registered.contains(&device_id) {
            return Err(DecodeError::UnregisteredDevice(device_id));
        }

        let mut m = PlugMeasurement::new(&device_id, Utc::now());
        for item in fields.split(|c: char| c == ';' || c.is_whitespace()) {
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            match key.trim() {
                "POW" => m.power_state = Some(value.trim().to_string()),
                "FREQ" => m.frequency = Some(self.number(key, value)?),
                "VRMS" => m.vrms = Some(self.number(key, value)?),
                "LOAD" => m.load = Some(self.number(key, value)?),
                "WORK" => m.work = Some(self.number(key, value)?),
                "IRMS" => m.irms = Some(self.number(key, value)?),
                other => tracing::debug!(key = other, device = %device_id, "Ignoring unknown plug field"),
            }
        }
        Ok(MeasurementRecord::Plug(m))
    }

    fn name(&self) -> &str {
        "plug"
    }
}

/// Colon-separated upper-case hex, e.g. `00:13:A2:00:40:8B:6E:55`.
///
/// Accepts 48- or 64-bit addresses with `:`/`-` separators or none.
pub fn normalize_mac(raw: &str) -> Result<String, DecodeError> {
    let hex: String = raw.chars().filter(|c| *c != ':' && *c != '-').collect();
    let valid_len = hex.len() == 12 || hex.len() == 16;
    if !valid_len || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DecodeError::BadDeviceId(raw.to_string()));
    }
    let upper = hex.to_ascii_uppercase();
    let pairs: Vec<&str> = (0..upper.len())
        .step_by(2)
        .map(|i| &upper[i..i + 2])
        .collect();
    Ok(pairs.join(":"))
}
