//! Delivery channel: windowed send / acknowledge over one encrypted stream
//!
//! ## Architecture
//!
//! - **Connector**: opens the transport stream (TLS in production, in-memory
//!   pipes in tests). The channel never retries a failed connect.
//! - **DeliveryChannel**: buffers records until a full window, sends the
//!   window as one numbered batch, waits for the server's response, and
//!   answers acks, retransmission requests and counter queries.
//! - **PendingAckTable**: every batch sent but not yet acknowledged.
//!
//! Reconnection, spooling and backoff belong to the reporting supervisor
//! ([`crate::reporter`]).

pub mod channel;
pub mod pending;
pub mod tls;

pub use channel::{ChannelStats, DeliveryChannel, DeliverySettings};
pub use pending::{MeasurementBatch, PendingAckTable};
pub use tls::TlsConnector;

use crate::protocol::FrameError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Delivery errors surfaced to the reporting supervisor
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("not connected")]
    NotConnected,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("outgoing frame of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Refused / reset / handshake class: spool and reconnect.
    ///
    /// Everything else is treated by the supervisor as unexpected.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused(_)
                | Self::ConnectionReset(_)
                | Self::ConnectTimeout(_)
                | Self::Handshake(_)
                | Self::NotConnected
        )
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused(e.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => Self::ConnectionReset(e.to_string()),
            _ => Self::Io(e),
        }
    }
}

impl From<FrameError> for DeliveryError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Closed => Self::ConnectionReset("connection closed by server".to_string()),
            FrameError::Io(io) => io.into(),
            FrameError::TooLarge { len, max } => Self::Oversized { len, max },
        }
    }
}

/// Opens the stream a [`DeliveryChannel`] talks over.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Establish one connection. Must not retry internally.
    async fn connect(&self) -> Result<Self::Stream, DeliveryError>;

    /// Human-readable endpoint for logging (e.g. "collector:8443").
    fn endpoint(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let refused: DeliveryError = std::io::Error::from(ErrorKind::ConnectionRefused).into();
        assert!(matches!(refused, DeliveryError::ConnectionRefused(_)));
        assert!(refused.is_connection_failure());

        let reset: DeliveryError = std::io::Error::from(ErrorKind::BrokenPipe).into();
        assert!(matches!(reset, DeliveryError::ConnectionReset(_)));
        assert!(reset.is_connection_failure());

        let other: DeliveryError = std::io::Error::from(ErrorKind::PermissionDenied).into();
        assert!(matches!(other, DeliveryError::Io(_)));
        assert!(!other.is_connection_failure());
    }

    #[test]
    fn test_closed_frame_is_reset() {
        let err: DeliveryError = FrameError::Closed.into();
        assert!(err.is_connection_failure());
    }
}
