//! Config validation: unknown-key detection with Levenshtein suggestions
//! and operational sanity checks.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Then proceed with normal serde
//! deserialization. Warnings never break existing configs.

use super::{defaults, NodeKind};
use std::collections::HashSet;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, "; did you mean '{s}'?")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Returns the complete set of valid dotted key paths for GatewayConfig.
///
/// Maintained by hand to match the struct hierarchy in gateway_config.rs.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [server]
        "server",
        "server.host",
        "server.port",
        "server.connect_timeout_secs",
        // [tls]
        "tls",
        "tls.cert_file",
        "tls.key_file",
        "tls.ca_file",
        "tls.server_name",
        "tls.insecure_skip_verify",
        // [delivery]
        "delivery",
        "delivery.window_size",
        "delivery.ack_timeout_ms",
        "delivery.max_frame_bytes",
        // [reporter]
        "reporter",
        "reporter.replay_pacing_ms",
        "reporter.idle_poll_ms",
        "reporter.reconnect_backoff_secs",
        "reporter.spool_pop_wait_ms",
        // [spool]
        "spool",
        "spool.dir",
        // [decoder]
        "decoder",
        "decoder.nodes",
        // [mesh]
        "mesh",
        "mesh.plugmeters",
        // [[sources]]
        "sources",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// For example, a table `{ a = { b = 1, c = 2 } }` yields:
/// `["a", "a.b", "a.c"]`
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let a_len = a.chars().count();
    let b_len = b.chars().count();
    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;
    for &k in known {
        let dist = levenshtein(unknown, k);
        if dist <= 3 {
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((k, dist)),
            }
        }
    }
    best.map(|(k, _)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// This does NOT fail on unknown keys; it only warns.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let value: toml::Value = match raw_toml.parse() {
        Ok(v) => v,
        Err(_) => return Vec::new(), // parse errors are handled by serde later
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| {
            let suggestion = suggest_correction(&key, &known);
            ValidationWarning {
                message: format!("Unknown config key '{key}'"),
                field: key,
                suggestion,
            }
        })
        .collect()
}

// ============================================================================
// Operational Sanity Checks
// ============================================================================

/// Flag values that are legal but likely to misbehave in the field.
pub fn validate_operational_ranges(config: &super::GatewayConfig) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if config.tls.insecure_skip_verify {
        warnings.push(ValidationWarning {
            field: "tls.insecure_skip_verify".to_string(),
            message: "tls.insecure_skip_verify = true: server certificates are NOT verified"
                .to_string(),
            suggestion: None,
        });
    }

    if config.delivery.ack_timeout_ms > 60_000 {
        warnings.push(ValidationWarning {
            field: "delivery.ack_timeout_ms".to_string(),
            message: format!(
                "ack_timeout_ms = {} stalls the reporting loop for over a minute per batch",
                config.delivery.ack_timeout_ms
            ),
            suggestion: None,
        });
    }

    if config.reporter.replay_pacing_ms > 10_000 {
        warnings.push(ValidationWarning {
            field: "reporter.replay_pacing_ms".to_string(),
            message: format!(
                "replay_pacing_ms = {} makes backlog replay very slow",
                config.reporter.replay_pacing_ms
            ),
            suggestion: None,
        });
    }

    if config.reporter.spool_pop_wait_ms > config.reporter.reconnect_backoff_secs * 1000 {
        warnings.push(ValidationWarning {
            field: "reporter.spool_pop_wait_ms".to_string(),
            message: "spool_pop_wait_ms exceeds the whole spool window".to_string(),
            suggestion: None,
        });
    }

    for node in &config.decoder.nodes {
        let expected = if node.node_id == defaults::RFM_POWER_NODE {
            Some(NodeKind::Power)
        } else if defaults::RFM_TEMP_HUM_NODES.contains(&node.node_id) {
            Some(NodeKind::TempHumidity)
        } else {
            None
        };
        if let Some(expected) = expected.filter(|k| *k != node.kind) {
            warnings.push(ValidationWarning {
                field: "decoder.nodes".to_string(),
                message: format!(
                    "node {} is configured as {:?} but the standard radio layout wires it as {:?}",
                    node.node_id, node.kind, expected
                ),
                suggestion: None,
            });
        }
    }

    warnings
}

// ============================================================================
// Tests
// ============================================================================
