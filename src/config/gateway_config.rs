//! Gateway Configuration - server endpoint, TLS material, protocol timings
//!
//! Each struct implements `Default` with the values from [`super::defaults`],
//! so a gateway with no config file behaves exactly like the built-in protocol.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one gateway deployment.
///
/// Load with `GatewayConfig::load()` which searches:
/// 1. `$FIELDLINK_CONFIG` env var
/// 2. `./fieldlink.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Collection server endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// Transport encryption
    #[serde(default)]
    pub tls: TlsConfig,

    /// Windowed send / acknowledge protocol
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Reporting loop pacing and backoff
    #[serde(default)]
    pub reporter: ReporterConfig,

    /// Disk spool location
    #[serde(default)]
    pub spool: SpoolConfig,

    /// RFM radio node table
    #[serde(default)]
    pub decoder: DecoderConfig,

    /// Registered mesh plug meters
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Frame sources, one producer each
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl GatewayConfig {
    /// Load configuration using the standard search order:
    /// 1. `$FIELDLINK_CONFIG` environment variable
    /// 2. `./fieldlink.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("FIELDLINK_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), server = %config.server.address(), "Loaded gateway config from FIELDLINK_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from FIELDLINK_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "FIELDLINK_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("fieldlink.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(server = %config.server.address(), "Loaded gateway config from ./fieldlink.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./fieldlink.toml, using defaults");
                }
            }
        }

        info!("No fieldlink.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, err) => ConfigError::Parse(path.to_path_buf(), err),
            other => other,
        })
    }

    /// Parse and validate a TOML document. Unknown keys only warn.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate values that would break the protocol at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be > 0".to_string());
        }
        if self.server.connect_timeout_secs == 0 {
            errors.push("server.connect_timeout_secs must be > 0".to_string());
        }

        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            errors.push("tls.cert_file and tls.key_file must be set together".to_string());
        }

        if self.delivery.window_size == 0 {
            errors.push("delivery.window_size must be > 0".to_string());
        }
        if self.delivery.ack_timeout_ms == 0 {
            errors.push("delivery.ack_timeout_ms must be > 0".to_string());
        }
        if self.delivery.max_frame_bytes < defaults::MIN_FRAME_BYTES {
            errors.push(format!(
                "delivery.max_frame_bytes ({}) must be >= {}",
                self.delivery.max_frame_bytes,
                defaults::MIN_FRAME_BYTES
            ));
        }
        let window_bytes = self
            .delivery
            .window_size
            .saturating_mul(defaults::MAX_RECORD_BYTES)
            .saturating_add(defaults::BATCH_OVERHEAD_BYTES);
        if self.delivery.window_size > 0 && self.delivery.max_frame_bytes < window_bytes {
            errors.push(format!(
                "delivery.max_frame_bytes ({}) cannot hold a window of {} records (needs {})",
                self.delivery.max_frame_bytes, self.delivery.window_size, window_bytes
            ));
        }

        if self.reporter.reconnect_backoff_secs == 0 {
            errors.push("reporter.reconnect_backoff_secs must be > 0".to_string());
        }
        if self.reporter.idle_poll_ms == 0 {
            errors.push("reporter.idle_poll_ms must be > 0".to_string());
        }

        let mut seen = HashSet::new();
        for node in &self.decoder.nodes {
            if !seen.insert(node.node_id) {
                errors.push(format!("decoder.nodes: duplicate node_id {}", node.node_id));
            }
            if uuid::Uuid::parse_str(&node.device_id).is_err() {
                errors.push(format!(
                    "decoder.nodes: node {} device_id '{}' is not a UUID",
                    node.node_id, node.device_id
                ));
            }
        }

        let mut paths = HashSet::new();
        for source in &self.sources {
            if !paths.insert(&source.path) {
                errors.push(format!("sources: path '{}' listed twice", source.path.display()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Collection server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_server_host() -> String {
    "localhost".to_string()
}
fn default_server_port() -> u16 {
    defaults::SERVER_PORT
}
fn default_connect_timeout_secs() -> u64 {
    defaults::CONNECT_TIMEOUT_SECS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// `host:port` for logging and connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ============================================================================
// TLS
// ============================================================================

/// Certificate material and verification policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Client certificate chain (PEM)
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// CA bundle used to verify the server (PEM). Falls back to the webpki roots.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Name used for SNI and certificate verification. Defaults to `server.host`.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Accept any server certificate. Only for sites without a usable PKI.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

// ============================================================================
// Delivery
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_window_size() -> usize {
    defaults::WINDOW_SIZE
}
fn default_ack_timeout_ms() -> u64 {
    defaults::ACK_TIMEOUT_MS
}
fn default_max_frame_bytes() -> usize {
    defaults::MAX_FRAME_BYTES
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

// ============================================================================
// Reporter
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    #[serde(default = "default_replay_pacing_ms")]
    pub replay_pacing_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_spool_pop_wait_ms")]
    pub spool_pop_wait_ms: u64,
}

fn default_replay_pacing_ms() -> u64 {
    defaults::REPLAY_PACING_MS
}
fn default_idle_poll_ms() -> u64 {
    defaults::IDLE_POLL_MS
}
fn default_reconnect_backoff_secs() -> u64 {
    defaults::RECONNECT_BACKOFF_SECS
}
fn default_spool_pop_wait_ms() -> u64 {
    defaults::SPOOL_POP_WAIT_MS
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            replay_pacing_ms: default_replay_pacing_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            spool_pop_wait_ms: default_spool_pop_wait_ms(),
        }
    }
}

// ============================================================================
// Spool
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    #[serde(default = "default_spool_dir")]
    pub dir: PathBuf,
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from(defaults::SPOOL_DIR)
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: default_spool_dir(),
        }
    }
}

// ============================================================================
// Acquisition
// ============================================================================

/// Sensor kind of an RFM radio node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Power,
    TempHumidity,
}

/// One entry of the RFM node table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: u8,
    pub kind: NodeKind,
    /// UUID identifying the physical device
    pub device_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    /// MAC addresses of registered plug meters
    #[serde(default)]
    pub plugmeters: Vec<String>,
}

/// Wire format of a frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// RFM radio bridge: space-separated decimal bytes
    Rfm,
    /// Mesh plug meter: "<MAC> KEY=value;..."
    Plug,
}

impl std::str::FromStr for SourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rfm" => Ok(Self::Rfm),
            "plug" => Ok(Self::Plug),
            other => Err(format!("unknown frame format '{other}' (expected rfm or plug)")),
        }
    }
}

/// One line-oriented frame source. A `path` of `-` reads stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub format: SourceFormat,
    pub path: PathBuf,
}

impl SourceConfig {
    pub fn is_stdin(&self) -> bool {
        self.path.as_os_str() == "-"
    }
}

/// Parses the CLI form `FORMAT:PATH`, e.g. `rfm:/dev/ttyAMA0` or `plug:-`.
impl std::str::FromStr for SourceConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (format, path) = s
            .split_once(':')
            .ok_or_else(|| format!("source '{s}' must look like FORMAT:PATH"))?;
        if path.is_empty() {
            return Err(format!("source '{s}' has an empty path"));
        }
        Ok(Self {
            format: format.parse()?,
            path: PathBuf::from(path),
        })
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok(), "Default config must always validate");
    }

    #[test]
    fn test_empty_toml_produces_defaults() {
        let config: GatewayConfig = toml::from_str("").expect("empty TOML should parse");
        assert_eq!(config.delivery.window_size, 3);
        assert_eq!(config.delivery.ack_timeout_ms, 3_000);
        assert_eq!(config.reporter.replay_pacing_ms, 500);
        assert_eq!(config.reporter.idle_poll_ms, 1_000);
        assert_eq!(config.reporter.reconnect_backoff_secs, 10);
        assert!(!config.tls.insecure_skip_verify);
    }

    #[test]
    fn test_partial_toml_override() {
        let toml_str = r#"
[server]
host = "collector.example.net"
port = 9000

[delivery]
window_size = 5

[[decoder.nodes]]
node_id = 10
kind = "power"
device_id = "6f1c0c52-8a2e-4c39-9d1f-3a7e4cfa0a10"
"#;
        let config = GatewayConfig::from_toml_str(toml_str).expect("partial TOML should parse");
        assert_eq!(config.server.address(), "collector.example.net:9000");
        assert_eq!(config.delivery.window_size, 5);
        assert_eq!(config.delivery.ack_timeout_ms, 3_000);
        assert_eq!(config.decoder.nodes.len(), 1);
        assert_eq!(config.decoder.nodes[0].kind, NodeKind::Power);
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = GatewayConfig::default();
        config.delivery.window_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("window_size"));
    }

    #[test]
    fn test_duplicate_node_ids_rejected() {
        let mut config = GatewayConfig::default();
        let node = NodeConfig {
            node_id: 23,
            kind: NodeKind::TempHumidity,
            device_id: "6f1c0c52-8a2e-4c39-9d1f-3a7e4cfa0a10".to_string(),
        };
        config.decoder.nodes = vec![node.clone(), node];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node_id 23"));
    }

    #[test]
    fn test_source_cli_form_parses() {
        let source: SourceConfig = "rfm:/dev/ttyAMA0".parse().unwrap();
        assert_eq!(source.format, SourceFormat::Rfm);
        assert_eq!(source.path, PathBuf::from("/dev/ttyAMA0"));
        assert!(!source.is_stdin());

        let stdin: SourceConfig = "PLUG:-".parse().unwrap();
        assert_eq!(stdin.format, SourceFormat::Plug);
        assert!(stdin.is_stdin());

        assert!("/dev/ttyAMA0".parse::<SourceConfig>().is_err());
        assert!("zigbee:/dev/ttyUSB0".parse::<SourceConfig>().is_err());
        assert!("rfm:".parse::<SourceConfig>().is_err());
    }

    #[test]
    fn test_sources_from_toml() {
        let config = GatewayConfig::from_toml_str(
            r#"
[[sources]]
format = "rfm"
path = "/dev/ttyAMA0"

[[sources]]
format = "plug"
path = "-"
"#,
        )
        .unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].format, SourceFormat::Rfm);
        assert!(config.sources[1].is_stdin());
    }

    #[test]
    fn test_duplicate_source_path_rejected() {
        let mut config = GatewayConfig::default();
        config.sources = vec![
            "rfm:-".parse().unwrap(),
            "plug:-".parse().unwrap(),
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let mut config = GatewayConfig::default();
        config.tls.cert_file = Some(PathBuf::from("client.pem"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = GatewayConfig::default();
        config.mesh.plugmeters = vec!["00:13:A2:00:40:8B:6E:55".to_string()];
        let text = config.to_toml().unwrap();
        let back = GatewayConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.mesh.plugmeters, config.mesh.plugmeters);
    }
}
