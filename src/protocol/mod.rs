//! Collection server wire protocol
//!
//! Every message travels as one length-prefixed frame (see [`frame`]) whose
//! body is a JSON envelope:
//!
//! ```text
//! {"version": 1, "message": {"type": "batch", "id": 7, "records": [...]}}
//! ```
//!
//! Message types:
//!
//! | type      | direction         | fields                              |
//! |-----------|-------------------|-------------------------------------|
//! | `batch`   | client → server   | `id`, `records`                     |
//! | `no_data` | client → server   | `id`                                |
//! | `ack`     | server → client   | `acknowledged_id`, `wanted_id?`     |
//! | `request` | both (echoed)     | `request_kind`, `response?`         |
//!
//! Any other `type` decodes as [`WireMessage::Unknown`] so callers can log and
//! drop it instead of failing the decode.

pub mod frame;

pub use frame::{write_frame, FrameError, FrameReader};

use crate::types::MeasurementRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope version written by this client and the only one it accepts.
pub const PROTOCOL_VERSION: u8 = 1;

/// Server query for the client's current message counter.
pub const GET_MSG_COUNTER: &str = "GET_MSG_COUNTER";

/// Malformed or unsupported inbound data. Never fatal to a connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub message: WireMessage,
}

/// All message kinds, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Batch {
        id: u64,
        records: Vec<MeasurementRecord>,
    },
    /// The client holds nothing for `id`; the server should stop asking.
    NoData { id: u64 },
    Ack(AckMessage),
    Request(RequestMessage),
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Batch { .. } => "batch",
            Self::NoData { .. } => "no_data",
            Self::Ack(_) => "ack",
            Self::Request(_) => "request",
            Self::Unknown => "unknown",
        }
    }
}

/// Server acknowledgment, optionally asking for a retransmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub acknowledged_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wanted_id: Option<u64>,
}

/// Server query. The client fills `response` and echoes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub request_kind: String,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u8,
}

/// Serialize a message into a frame body.
pub fn encode(message: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&EnvelopeRef {
        version: PROTOCOL_VERSION,
        message,
    })
}

/// Parse a frame body, checking the envelope version first.
pub fn decode(body: &[u8]) -> Result<WireMessage, ProtocolError> {
    let header: VersionHeader = serde_json::from_slice(body)?;
    if header.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(header.version));
    }
    let envelope: Envelope = serde_json::from_slice(body)?;
    Ok(envelope.message)
}

/// Serialize a batch without taking ownership of its records.
pub fn encode_batch(id: u64, records: &[MeasurementRecord]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&EnvelopeRef {
        version: PROTOCOL_VERSION,
        message: BatchRef::Batch { id, records },
    })
}

#[derive(Serialize)]
struct EnvelopeRef<M> {
    version: u8,
    message: M,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BatchRef<'a> {
    Batch {
        id: u64,
        records: &'a [MeasurementRecord],
    },
}
