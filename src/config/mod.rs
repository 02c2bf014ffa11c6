//! Gateway Configuration Module
//!
//! Provides the gateway configuration loaded from a TOML file, holding the
//! collection server endpoint, TLS material, protocol timings, and the sensor
//! tables used by the decoders.
//!
//! ## Loading Order
//!
//! 1. `FIELDLINK_CONFIG` environment variable (path to TOML file)
//! 2. `fieldlink.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! The loaded config is passed by value into the components that need it;
//! there is no global instance.

mod gateway_config;
pub mod defaults;
pub mod validation;

pub use gateway_config::*;
