//! YAML Configuration Structures for the RLC loopback harness
//!
//! The file carries the bearer configuration shared by both peers, the
//! simulated MAC channel and the generated traffic.

use layers::rlc::RlcConfig;
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// RLC bearer configuration, used by both peers
    #[serde(default)]
    pub rlc: RlcConfig,
    /// Simulated MAC channel
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Generated traffic
    #[serde(default)]
    pub traffic: TrafficConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Simulated MAC channel between the two peers
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Probability of losing a PDU in either direction
    pub loss_probability: f64,
    /// Bytes granted to each peer per slot
    pub grant_bytes: usize,
    /// Slot duration in microseconds
    pub slot_duration_us: u64,
    /// Give up after this many slots
    pub max_slots: u64,
    /// Seed of the loss generator
    pub seed: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            loss_probability: 0.0,
            grant_bytes: 256,
            slot_duration_us: 1000,
            max_slots: 20_000,
            seed: 1,
        }
    }
}

/// Downlink traffic pushed into the gNB side
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Number of SDUs to transfer
    pub nof_sdus: u32,
    /// SDU size in bytes
    pub sdu_size: usize,
    /// UE index of the bearer
    pub ue_index: u16,
    /// Logical channel of the bearer
    pub lcid: u8,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            nof_sdus: 100,
            sdu_size: 1500,
            ue_index: 0,
            lcid: 4,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level used when neither RUST_LOG nor --log-level is given
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl HarnessConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        let config: HarnessConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the harness cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.rlc.validate()?;
        if !(0.0..1.0).contains(&self.channel.loss_probability) {
            anyhow::bail!(
                "Invalid loss probability: {} (expected 0 <= p < 1)",
                self.channel.loss_probability
            );
        }
        if self.channel.grant_bytes == 0 {
            anyhow::bail!("Grant size must be positive");
        }
        if self.traffic.sdu_size < 4 {
            anyhow::bail!("SDU size must hold the 4 byte sequence tag");
        }
        if self.traffic.sdu_size > layers::rlc::MAX_SDU_SIZE {
            anyhow::bail!(
                "SDU size {} exceeds maximum {}",
                self.traffic.sdu_size,
                layers::rlc::MAX_SDU_SIZE
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layers::rlc::{AmSnSize, RlcMode};

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
rlc:
  mode: am
  am:
    tx:
      sn_field_length: 18
      t_poll_retx: 30
      max_retx_thresh: 4
    rx:
      sn_field_length: 18
      t_reassembly: 20
channel:
  loss_probability: 0.1
  grant_bytes: 500
traffic:
  nof_sdus: 10
  sdu_size: 1200
log:
  level: debug
"#;
        let config = HarnessConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.rlc.mode, RlcMode::Am);
        assert_eq!(config.rlc.am.tx.sn_field_length, AmSnSize::Size18Bits);
        assert_eq!(config.rlc.am.tx.t_poll_retx, 30);
        assert_eq!(config.rlc.am.tx.max_retx_thresh, 4);
        assert_eq!(config.rlc.am.rx.t_reassembly, 20);
        assert_eq!(config.channel.grant_bytes, 500);
        assert_eq!(config.channel.max_slots, 20_000);
        assert_eq!(config.traffic.nof_sdus, 10);
        assert_eq!(config.traffic.lcid, 4);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HarnessConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.rlc.mode, RlcMode::Am);
        assert_eq!(config.traffic.sdu_size, 1500);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(HarnessConfig::from_yaml_str("channel:\n  loss_probability: 1.5\n").is_err());
        assert!(HarnessConfig::from_yaml_str("channel:\n  grant_bytes: 0\n").is_err());
        assert!(HarnessConfig::from_yaml_str("traffic:\n  sdu_size: 2\n").is_err());
        assert!(HarnessConfig::from_yaml_str("rlc:\n  mode: am\n  am:\n    tx:\n      sn_field_length: 7\n").is_err());
    }
}
