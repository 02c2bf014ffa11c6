//! System-wide default constants.
//!
//! Centralises the protocol and timing constants of the delivery subsystem.
//! Every value here is the default for a field in [`GatewayConfig`](super::GatewayConfig).

// ============================================================================
// Delivery Channel
// ============================================================================

/// Number of records batched into one message.
pub const WINDOW_SIZE: usize = 3;

/// How long to wait for the server's response to a batch (ms).
pub const ACK_TIMEOUT_MS: u64 = 3_000;

/// Largest frame accepted or sent on the wire (bytes).
///
/// The previous protocol capped responses at a single 1000-byte read; framed
/// messages can be larger, but never unbounded.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Smallest `max_frame_bytes` a config may set.
pub const MIN_FRAME_BYTES: usize = 1024;

/// Generous estimate of one encoded record, used to check that a full
/// window fits in a frame.
pub const MAX_RECORD_BYTES: usize = 512;

/// Envelope and batch header bytes around the records.
pub const BATCH_OVERHEAD_BYTES: usize = 128;

/// Upper bound on chained retransmission requests handled for one response.
pub const MAX_RETRANSMIT_CHAIN: usize = 8;

/// TCP connect timeout (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// TCP keepalive idle time before probing (seconds).
pub const TCP_KEEPALIVE_TIME_SECS: u64 = 30;

/// TCP keepalive interval between checks (seconds).
pub const TCP_KEEPALIVE_INTERVAL_SECS: u64 = 10;

/// Default collection server port.
pub const SERVER_PORT: u16 = 8443;

// ============================================================================
// Reporting Supervisor
// ============================================================================

/// Delay between replayed backlog sends (ms).
pub const REPLAY_PACING_MS: u64 = 500;

/// Sleep when both the backlog and the live channel are empty (ms).
pub const IDLE_POLL_MS: u64 = 1_000;

/// Spool window and backoff after a failure (seconds).
pub const RECONNECT_BACKOFF_SECS: u64 = 10;

/// Bounded wait for one live record while spooling (ms).
pub const SPOOL_POP_WAIT_MS: u64 = 500;

// ============================================================================
// Spool
// ============================================================================

/// Default spool directory.
pub const SPOOL_DIR: &str = "./data/spool";

/// Active spool file name (appended while disconnected).
pub const SPOOL_FILE_NAME: &str = "spool.jsonl";

/// Claimed backlog file name (deleted after confirmed delivery).
pub const REPLAY_FILE_NAME: &str = "replay.jsonl";

// ============================================================================
// Acquisition
// ============================================================================

/// Pause before reading again after a frame source error (ms).
pub const SOURCE_RETRY_MS: u64 = 500;

/// Consecutive source errors after which a producer gives up.
pub const SOURCE_ERROR_LIMIT: u32 = 5;

/// RFM node id of the power meter.
pub const RFM_POWER_NODE: u8 = 10;

/// RFM node ids of the temperature / humidity sensors.
pub const RFM_TEMP_HUM_NODES: [u8; 4] = [19, 22, 23, 24];

/// Rate applied to the power node `vrms` value.
pub const POWER_VRMS_RATE: f64 = 0.01;

/// Rate applied to every temperature / humidity value.
pub const TEMP_HUM_RATE: f64 = 0.1;
