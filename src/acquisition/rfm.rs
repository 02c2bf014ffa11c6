//! RFM radio frame decoder
//!
//! Frames arrive as space-separated decimal bytes: the node id, then the
//! node's payload as little-endian i16 pairs.
//!
//! ```text
//! 10 4 0 0 0 0 0 0 0 42 98 0 0   -> power node: power1..4, vrms, temperature
//! 23 225 0 0 0 7 1 30 0          -> temp/hum node: temperature, external, humidity, battery
//! ```

use super::{DecodeError, FrameDecoder};
use crate::config::{defaults, DecoderConfig, NodeKind};
use crate::types::{MeasurementRecord, PowerMeasurement, TempHumidityMeasurement};
use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;

const POWER_VALUES: usize = 6;
const TEMP_HUM_VALUES: usize = 4;

#[derive(Debug, Clone)]
struct NodeEntry {
    kind: NodeKind,
    device_id: String,
}

/// Decoder for the RFM node table
#[derive(Debug, Clone, Default)]
pub struct RfmDecoder {
    nodes: HashMap<u8, NodeEntry>,
}

impl RfmDecoder {
    /// Build from the configured node table. Device ids must be UUIDs.
    pub fn from_config(config: &DecoderConfig) -> Result<Self, DecodeError> {
        let mut decoder = Self::default();
        for node in &config.nodes {
            decoder.register(node.node_id, node.kind, &node.device_id)?;
        }
        Ok(decoder)
    }

    pub fn register(&mut self, node_id: u8, kind: NodeKind, device_id: &str) -> Result<(), DecodeError> {
        let uuid = Uuid::parse_str(device_id)
            .map_err(|_| DecodeError::BadDeviceId(device_id.to_string()))?;
        self.nodes.insert(
            node_id,
            NodeEntry {
                kind,
                device_id: uuid.to_string(),
            },
        );
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl FrameDecoder for RfmDecoder {
    fn decode(&self, frame: &str) -> Result<MeasurementRecord, DecodeError> {
        let bytes = frame
            .split_whitespace()
            .map(|token| {
                token
                    .parse::<u8>()
                    .map_err(|_| DecodeError::InvalidByte(token.to_string()))
            })
            .collect::<Result<Vec<u8>, _>>()?;

        let (&node_id, payload) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let entry = self
            .nodes
            .get(&node_id)
            .ok_or(DecodeError::UnknownNode(node_id))?;
        let ts = Utc::now();

        match entry.kind {
            NodeKind::Power => {
                let raw: [i16; POWER_VALUES] = le_values(node_id, payload)?;
                let mut m = PowerMeasurement::from_raw(&entry.device_id, ts, raw);
                m.standardize("vrms", defaults::POWER_VRMS_RATE)
                    .map_err(|e| DecodeError::Malformed(e.to_string()))?;
                Ok(MeasurementRecord::Power(m))
            }
            NodeKind::TempHumidity => {
                let raw: [i16; TEMP_HUM_VALUES] = le_values(node_id, payload)?;
                let mut m = TempHumidityMeasurement::from_raw(&entry.device_id, ts, raw);
                m.standardize("all", defaults::TEMP_HUM_RATE)
                    .map_err(|e| DecodeError::Malformed(e.to_string()))?;
                Ok(MeasurementRecord::TempHumidity(m))
            }
        }
    }

    fn name(&self) -> &str {
        "rfm"
    }
}

/// Read exactly `N` little-endian i16 values.
fn le_values<const N: usize>(node: u8, payload: &[u8]) -> Result<[i16; N], DecodeError> {
    if payload.len() != N * 2 {
        return Err(DecodeError::FrameLength {
            node,
            got: payload.len(),
            expected: N * 2,
        });
    }
    let mut values = [0i16; N];
    for (value, pair) in values.iter_mut().zip(payload.chunks_exact(2)) {
        *value = i16::from_le_bytes([pair[0], pair[1]]);
    }
    Ok(values)
}
