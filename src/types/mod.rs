//! Shared data structures for the gateway
//!
//! - `MeasurementRecord`: one decoded sensor reading, the unit that flows
//!   from producers through the live channel, the spool and the wire.

mod measurement;

pub use measurement::*;
