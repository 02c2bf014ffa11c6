//! fieldlink: reliable measurement delivery for field gateways
//!
//! Producers decode sensor frames into records and push them onto an
//! unbounded live channel. A single reporting task batches them over one
//! TLS connection to the collection server, acknowledging per batch, and
//! spools to disk whenever the server cannot be reached.
//!
//! ## Architecture
//!
//! - **Acquisition**: RFM radio and mesh plug-meter decoders, line sources
//! - **Delivery**: windowed send / acknowledge channel with retransmission
//! - **Spool**: JSON-lines disk buffer with a claimed-for-replay file
//! - **Reporter**: session loop, replay pacing, reconnect backoff

pub mod acquisition;
pub mod config;
pub mod delivery;
pub mod protocol;
pub mod reporter;
pub mod spool;
pub mod types;

pub use config::GatewayConfig;

pub use types::{
    MeasurementRecord, PlugMeasurement, PowerMeasurement, TempHumidityMeasurement,
};

pub use delivery::{
    ChannelStats, Connector, DeliveryChannel, DeliveryError, DeliverySettings, TlsConnector,
};

pub use reporter::{Reporter, ReporterStats, ReporterTimings};

pub use spool::{DiskSpool, SpoolError};
