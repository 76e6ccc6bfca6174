//! Endpoint configuration.
//!
//! Values come from [`EndpointConfig::default`], optionally a TOML or JSON
//! file, then `RDM_*` environment variables. Runtime options set through
//! the endpoint override all three but only until the first post.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::handshake::Capabilities;
use crate::op::MemoryKind;
use crate::peer::PeerSettings;
use crate::retry::{RetryConfig, RetryPolicy, BACKOFF_CEILING};
use crate::sizing::{RuntPolicy, Thresholds, ACCEL_ALIGNMENT};

/// Endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Packet entries available for transmit.
    pub tx_pool_size: usize,
    /// Operation entries available for sends and receives together.
    pub op_capacity: usize,
    /// User bytes per packet.
    pub max_payload: usize,
    /// Largest message sent with packets only.
    pub medium_max: usize,
    /// Largest message accepted from the wire.
    pub max_message_size: usize,
    /// Reorder window size per peer.
    pub reorder_window: u32,
    /// Overflow list capacity per peer.
    pub overflow_capacity: usize,
    /// Runt budget per memory kind.
    pub runt: RuntPolicy,
    /// Segment alignment for host memory.
    pub host_alignment: usize,
    /// Segment alignment for accelerator memory.
    pub accel_alignment: usize,
    /// Posted operations queued per peer before `QueueFull`.
    pub queue_limit_per_peer: usize,
    /// Implicitly inserted peers kept before the oldest idle one is forgotten.
    pub implicit_peer_capacity: usize,
    /// RNR retry behavior.
    pub retry: RetryConfig,
    /// Capabilities this endpoint offers.
    pub capabilities: Capabilities,
    /// File holding this host's id.
    pub host_id_file: Option<PathBuf>,
    /// Send the connection id in the handshake.
    pub connid_header: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            tx_pool_size: 1024,
            op_capacity: 1024,
            max_payload: 8192,
            medium_max: 65536,
            max_message_size: 1 << 30,
            reorder_window: 16384,
            overflow_capacity: 256,
            runt: RuntPolicy::default(),
            host_alignment: 8,
            accel_alignment: ACCEL_ALIGNMENT,
            queue_limit_per_peer: 256,
            implicit_peer_capacity: 1024,
            retry: RetryConfig::default(),
            capabilities: Capabilities::all(),
            host_id_file: None,
            connid_header: false,
        }
    }
}

/// Option that may be changed on an endpoint before its first post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOption {
    /// RNR retries per operation; `None` retries forever.
    RnrRetry(Option<u32>),
    /// Per-peer queue limit.
    QueueLimit(usize),
    /// Runt ceiling for host memory.
    HostRuntCeiling(usize),
    /// Runt ceiling for accelerator memory.
    AccelRuntCeiling(usize),
    /// Offered capabilities.
    Capabilities(Capabilities),
}

impl EndpointOption {
    /// Name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            EndpointOption::RnrRetry(_) => "rnr_retry",
            EndpointOption::QueueLimit(_) => "queue_limit",
            EndpointOption::HostRuntCeiling(_) => "host_runt_ceiling",
            EndpointOption::AccelRuntCeiling(_) => "accel_runt_ceiling",
            EndpointOption::Capabilities(_) => "capabilities",
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidConfig(format!("{key}={value:?} is not valid")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ProtocolError::InvalidConfig(format!("{key}={value:?} is not a boolean"))),
    }
}

impl EndpointConfig {
    /// Reads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EndpointConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies `RDM_*` variables. Unknown `RDM_` names are ignored.
    ///
    /// Takes the variables as an iterator so callers pass
    /// `std::env::vars()` and tests pass a fixed list.
    pub fn with_env_overrides<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "RDM_TX_POOL_SIZE" => self.tx_pool_size = parse(key, value)?,
                "RDM_OP_CAPACITY" => self.op_capacity = parse(key, value)?,
                "RDM_MAX_PAYLOAD" => self.max_payload = parse(key, value)?,
                "RDM_MEDIUM_MAX" => self.medium_max = parse(key, value)?,
                "RDM_MAX_MESSAGE_SIZE" => self.max_message_size = parse(key, value)?,
                "RDM_REORDER_WINDOW" => self.reorder_window = parse(key, value)?,
                "RDM_OVERFLOW_CAPACITY" => self.overflow_capacity = parse(key, value)?,
                "RDM_QUEUE_LIMIT" => self.queue_limit_per_peer = parse(key, value)?,
                "RDM_RUNT_SIZE" => {
                    let size = parse(key, value)?;
                    self.runt.host_ceiling = size;
                    self.runt.accel_ceiling = size;
                }
                "RDM_HOST_RUNT_SIZE" => self.runt.host_ceiling = parse(key, value)?,
                "RDM_ACCEL_RUNT_SIZE" => self.runt.accel_ceiling = parse(key, value)?,
                "RDM_RNR_RETRY" => {
                    self.retry.max_rnr_retries = match value.trim() {
                        "" | "inf" | "infinite" => None,
                        v => Some(parse(key, v)?),
                    }
                }
                "RDM_HOST_ID_FILE" => self.host_id_file = Some(PathBuf::from(value)),
                "RDM_CONNID_HEADER" => self.connid_header = parse_bool(key, value)?,
                other if other.starts_with("RDM_") => {
                    debug!(variable = other, "ignoring unknown configuration variable");
                    continue;
                }
                _ => continue,
            }
            debug!(variable = key, value, "configuration override from environment");
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("tx_pool_size", self.tx_pool_size),
            ("op_capacity", self.op_capacity),
            ("max_payload", self.max_payload),
            ("max_message_size", self.max_message_size),
            ("overflow_capacity", self.overflow_capacity),
            ("queue_limit_per_peer", self.queue_limit_per_peer),
            ("host_alignment", self.host_alignment),
            ("accel_alignment", self.accel_alignment),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ProtocolError::InvalidConfig(format!("{name} must be greater than zero")));
            }
        }
        if self.reorder_window == 0 {
            return Err(ProtocolError::InvalidConfig(
                "reorder_window must be greater than zero".to_string(),
            ));
        }
        if self.medium_max < self.max_payload {
            return Err(ProtocolError::InvalidConfig(format!(
                "medium_max ({}) is smaller than max_payload ({})",
                self.medium_max, self.max_payload
            )));
        }
        if let RetryPolicy::Fixed(d) = self.retry.policy {
            if d > BACKOFF_CEILING {
                return Err(ProtocolError::InvalidConfig(format!(
                    "retry.policy fixed backoff {d:?} exceeds {BACKOFF_CEILING:?}"
                )));
            }
        }
        if self.retry.backoff_multiplier <= 0.0 {
            return Err(ProtocolError::InvalidConfig(
                "retry.backoff_multiplier must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies a runtime option.
    pub fn apply(&mut self, option: EndpointOption) {
        match option {
            EndpointOption::RnrRetry(n) => self.retry.max_rnr_retries = n,
            EndpointOption::QueueLimit(n) => self.queue_limit_per_peer = n,
            EndpointOption::HostRuntCeiling(n) => self.runt.host_ceiling = n,
            EndpointOption::AccelRuntCeiling(n) => self.runt.accel_ceiling = n,
            EndpointOption::Capabilities(c) => self.capabilities = c,
        }
    }

    /// Segment alignment for a memory kind.
    pub fn alignment(&self, kind: MemoryKind) -> usize {
        match kind {
            MemoryKind::Host => self.host_alignment,
            MemoryKind::Accelerator => self.accel_alignment,
        }
    }

    /// Packetization thresholds.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_payload: self.max_payload,
            medium_max: self.medium_max,
        }
    }

    /// Sizing for new peers.
    pub fn peer_settings(&self) -> PeerSettings {
        PeerSettings {
            window: self.reorder_window,
            overflow_capacity: self.overflow_capacity,
            queue_limit: self.queue_limit_per_peer,
            implicit_capacity: self.implicit_peer_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn temp_with_suffix(suffix: &str) -> NamedTempFile {
        tempfile::Builder::new().suffix(suffix).tempfile().unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = EndpointConfig::default();
        assert_eq!(config.tx_pool_size, 1024);
        assert_eq!(config.max_payload, 8192);
        assert_eq!(config.runt.host_ceiling, 307_200);
        assert_eq!(config.accel_alignment, 128);
        assert_eq!(config.capabilities, Capabilities::all());
        assert!(config.host_id_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = temp_with_suffix(".toml");
        writeln!(
            file,
            "tx_pool_size = 64\nqueue_limit_per_peer = 4\nconnid_header = true\n\n[runt]\nhost_ceiling = 1000\naccel_ceiling = 2000\n"
        )
        .unwrap();
        let config = EndpointConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tx_pool_size, 64);
        assert_eq!(config.queue_limit_per_peer, 4);
        assert!(config.connid_header);
        assert_eq!(config.runt.accel_ceiling, 2000);
        assert_eq!(config.max_payload, 8192);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = temp_with_suffix(".json");
        writeln!(file, r#"{{"reorder_window": 32, "overflow_capacity": 2}}"#).unwrap();
        let config = EndpointConfig::from_file(file.path()).unwrap();
        assert_eq!(config.reorder_window, 32);
        assert_eq!(config.overflow_capacity, 2);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = temp_with_suffix(".yaml");
        let err = EndpointConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported config file extension"));
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = temp_with_suffix(".toml");
        writeln!(file, "max_payload = 0").unwrap();
        assert!(EndpointConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("RDM_QUEUE_LIMIT", "9"),
            ("RDM_RUNT_SIZE", "4096"),
            ("RDM_RNR_RETRY", "3"),
            ("RDM_CONNID_HEADER", "yes"),
            ("RDM_UNKNOWN", "x"),
            ("PATH", "/usr/bin"),
        ];
        let config = EndpointConfig::default().with_env_overrides(vars).unwrap();
        assert_eq!(config.queue_limit_per_peer, 9);
        assert_eq!(config.runt.host_ceiling, 4096);
        assert_eq!(config.runt.accel_ceiling, 4096);
        assert_eq!(config.retry.max_rnr_retries, Some(3));
        assert!(config.connid_header);
    }

    #[test]
    fn test_env_override_bad_value() {
        let err = EndpointConfig::default()
            .with_env_overrides([("RDM_TX_POOL_SIZE", "lots")])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidConfig(_)));
    }

    #[test]
    fn test_env_rnr_retry_infinite() {
        let config = EndpointConfig::default()
            .with_env_overrides([("RDM_RNR_RETRY", "3"), ("RDM_RNR_RETRY", "inf")])
            .unwrap();
        assert_eq!(config.retry.max_rnr_retries, None);
    }

    #[test]
    fn test_validate_medium_below_payload() {
        let config = EndpointConfig {
            max_payload: 4096,
            medium_max: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_option() {
        let mut config = EndpointConfig::default();
        config.apply(EndpointOption::RnrRetry(Some(0)));
        config.apply(EndpointOption::AccelRuntCeiling(512));
        assert_eq!(config.retry.max_rnr_retries, Some(0));
        assert_eq!(config.runt.accel_ceiling, 512);
        assert_eq!(EndpointOption::QueueLimit(1).name(), "queue_limit");
    }

    #[test]
    fn test_validate_rejects_huge_fixed_backoff() {
        let mut config = EndpointConfig::default();
        config.retry.policy = RetryPolicy::Fixed(Duration::from_secs(7200));
        assert!(config.validate().is_err());
        config.retry.policy = RetryPolicy::Fixed(Duration::from_millis(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_max_message_size() {
        let config = EndpointConfig::default()
            .with_env_overrides([("RDM_MAX_MESSAGE_SIZE", "4096")])
            .unwrap();
        assert_eq!(config.max_message_size, 4096);
        assert!(EndpointConfig::default()
            .with_env_overrides([("RDM_MAX_MESSAGE_SIZE", "0")])
            .is_err());
    }
}
