//! Sensor data acquisition
//!
//! Producers read text frames from a [`FrameSource`], decode them with a
//! [`FrameDecoder`] and push the resulting records into the shared live
//! channel. A frame that fails to decode yields no record.

pub mod plug;
pub mod rfm;
pub mod source;

pub use plug::PlugDecoder;
pub use rfm::RfmDecoder;
pub use source::{run_producer, FrameEvent, FrameSource, LineSource, ProducerStats};

use crate::types::MeasurementRecord;
use thiserror::Error;

/// Frame decoding failures. Logged by the producer, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("token '{0}' is not a byte value")]
    InvalidByte(String),

    #[error("no decoder registered for node {0}")]
    UnknownNode(u8),

    #[error("node {node} frame carries {got} data bytes, expected {expected}")]
    FrameLength { node: u8, got: usize, expected: usize },

    #[error("invalid device id '{0}'")]
    BadDeviceId(String),

    #[error("device {0} is not a registered plug meter")]
    UnregisteredDevice(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Turns one text frame into a record.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, frame: &str) -> Result<MeasurementRecord, DecodeError>;

    /// Name for logging (e.g. "rfm", "plug")
    fn name(&self) -> &str;
}
