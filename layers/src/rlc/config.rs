//! RLC Bearer Configuration
//!
//! Configurable parameters of TS 38.322 §7 as carried by RLC-Config
//! (TS 38.331). The configuration is read once when an entity is built.

use crate::LayerError;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// RLC operating modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RlcMode {
    /// Transparent Mode
    Tm,
    /// Unacknowledged Mode, both directions
    UmBidir,
    /// Unacknowledged Mode, uplink only (receive side at the gNB)
    UmUnidirUl,
    /// Unacknowledged Mode, downlink only (transmit side at the gNB)
    UmUnidirDl,
    /// Acknowledged Mode
    Am,
}

impl RlcMode {
    /// Whether this mode composes a transmitting entity
    pub fn has_tx(&self) -> bool {
        !matches!(self, RlcMode::UmUnidirUl)
    }

    /// Whether this mode composes a receiving entity
    pub fn has_rx(&self) -> bool {
        !matches!(self, RlcMode::UmUnidirDl)
    }
}

impl fmt::Display for RlcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RlcMode::Tm => "TM",
            RlcMode::UmBidir => "UM Bi-dir",
            RlcMode::UmUnidirUl => "UM Uni-dir-UL",
            RlcMode::UmUnidirDl => "UM Uni-dir-DL",
            RlcMode::Am => "AM",
        };
        write!(f, "{}", name)
    }
}

/// UM sequence number field length
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum UmSnSize {
    /// 6 bit SN
    Size6Bits = 6,
    /// 12 bit SN
    Size12Bits = 12,
}

impl UmSnSize {
    /// Field length in bits
    pub fn bits(&self) -> u16 {
        *self as u16
    }
}

impl TryFrom<u16> for UmSnSize {
    type Error = String;

    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        Self::from_u16(bits).ok_or_else(|| format!("invalid UM SN field length: {} bits", bits))
    }
}

impl From<UmSnSize> for u16 {
    fn from(size: UmSnSize) -> Self {
        size.bits()
    }
}

impl fmt::Display for UmSnSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bit", self.bits())
    }
}

/// AM sequence number field length
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum AmSnSize {
    /// 12 bit SN
    Size12Bits = 12,
    /// 18 bit SN
    Size18Bits = 18,
}

impl AmSnSize {
    /// Field length in bits
    pub fn bits(&self) -> u16 {
        *self as u16
    }
}

impl TryFrom<u16> for AmSnSize {
    type Error = String;

    fn try_from(bits: u16) -> Result<Self, Self::Error> {
        Self::from_u16(bits).ok_or_else(|| format!("invalid AM SN field length: {} bits", bits))
    }
}

impl From<AmSnSize> for u16 {
    fn from(size: AmSnSize) -> Self {
        size.bits()
    }
}

impl fmt::Display for AmSnSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bit", self.bits())
    }
}

/// Transmitting side of an AM bearer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlcTxAmConfig {
    /// Number of bits used for the sequence number
    pub sn_field_length: AmSnSize,
    /// Poll retransmit timeout in ms
    pub t_poll_retx: u32,
    /// Max number of retransmissions before the bearer is declared failed
    pub max_retx_thresh: u32,
    /// Insert a poll bit after this many PDUs (`None` = infinity)
    pub poll_pdu: Option<u32>,
    /// Insert a poll bit after this many new data bytes (`None` = infinity)
    pub poll_byte: Option<u32>,
    /// Byte budget of the SDU queue (`None` = unbounded)
    pub queue_limit_bytes: Option<usize>,
}

impl Default for RlcTxAmConfig {
    fn default() -> Self {
        Self {
            sn_field_length: AmSnSize::Size12Bits,
            t_poll_retx: 45,
            max_retx_thresh: 8,
            poll_pdu: Some(16),
            poll_byte: Some(25_000),
            queue_limit_bytes: None,
        }
    }
}

impl fmt::Display for RlcTxAmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sn_field_length={}, t_poll_retx={}, max_retx_thresh={}, poll_pdu={:?}, poll_byte={:?}",
            self.sn_field_length, self.t_poll_retx, self.max_retx_thresh, self.poll_pdu, self.poll_byte
        )
    }
}

/// Receiving side of an AM bearer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlcRxAmConfig {
    /// Number of bits used for the sequence number
    pub sn_field_length: AmSnSize,
    /// Timer used to detect PDU loss (ms)
    pub t_reassembly: u32,
    /// Timer used to prohibit transmission of status PDUs (ms)
    pub t_status_prohibit: u32,
}

impl Default for RlcRxAmConfig {
    fn default() -> Self {
        Self {
            sn_field_length: AmSnSize::Size12Bits,
            t_reassembly: 35,
            t_status_prohibit: 10,
        }
    }
}

impl fmt::Display for RlcRxAmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sn_field_length={}, t_reassembly={}, t_status_prohibit={}",
            self.sn_field_length, self.t_reassembly, self.t_status_prohibit
        )
    }
}

/// AM bearer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlcAmConfig {
    /// Tx configuration
    pub tx: RlcTxAmConfig,
    /// Rx configuration
    pub rx: RlcRxAmConfig,
}

/// Transmitting side of a UM bearer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlcTxUmConfig {
    /// Number of bits used for the sequence number
    pub sn_field_length: UmSnSize,
    /// Byte budget of the SDU queue (`None` = unbounded)
    pub queue_limit_bytes: Option<usize>,
}

impl Default for RlcTxUmConfig {
    fn default() -> Self {
        Self {
            sn_field_length: UmSnSize::Size12Bits,
            queue_limit_bytes: None,
        }
    }
}

/// Receiving side of a UM bearer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlcRxUmConfig {
    /// Number of bits used for the sequence number
    pub sn_field_length: UmSnSize,
    /// Timer used to detect PDU loss (ms)
    pub t_reassembly_ms: u32,
}

impl Default for RlcRxUmConfig {
    fn default() -> Self {
        Self {
            sn_field_length: UmSnSize::Size12Bits,
            t_reassembly_ms: 35,
        }
    }
}

impl fmt::Display for RlcRxUmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sn_field_length={}, t_reassembly_ms={}",
            self.sn_field_length, self.t_reassembly_ms
        )
    }
}

/// UM bearer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlcUmConfig {
    /// Tx configuration
    pub tx: RlcTxUmConfig,
    /// Rx configuration
    pub rx: RlcRxUmConfig,
}

/// TM bearer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlcTmConfig {
    /// Byte budget of the SDU queue (`None` = unbounded)
    pub queue_limit_bytes: Option<usize>,
}

/// Configuration of an RLC bearer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlcConfig {
    /// Operating mode
    pub mode: RlcMode,
    /// Used when mode is TM
    #[serde(default)]
    pub tm: RlcTmConfig,
    /// Used when mode is one of the UM variants
    #[serde(default)]
    pub um: RlcUmConfig,
    /// Used when mode is AM
    #[serde(default)]
    pub am: RlcAmConfig,
}

impl Default for RlcConfig {
    fn default() -> Self {
        Self {
            mode: RlcMode::Am,
            tm: RlcTmConfig::default(),
            um: RlcUmConfig::default(),
            am: RlcAmConfig::default(),
        }
    }
}

impl RlcConfig {
    /// Default AM bearer
    pub fn am(am: RlcAmConfig) -> Self {
        Self {
            mode: RlcMode::Am,
            am,
            ..Default::default()
        }
    }

    /// Default UM bearer of the given mode
    pub fn um(mode: RlcMode, um: RlcUmConfig) -> Self {
        Self {
            mode,
            um,
            ..Default::default()
        }
    }

    /// Check the parameters of the configured mode for consistency
    pub fn validate(&self) -> Result<(), LayerError> {
        match self.mode {
            RlcMode::Tm => {}
            RlcMode::UmBidir => {
                if self.um.tx.sn_field_length != self.um.rx.sn_field_length {
                    return Err(LayerError::InvalidConfiguration(format!(
                        "UM Tx/Rx SN field lengths differ: {} vs {}",
                        self.um.tx.sn_field_length, self.um.rx.sn_field_length
                    )));
                }
            }
            RlcMode::UmUnidirUl | RlcMode::UmUnidirDl => {}
            RlcMode::Am => {
                let am = &self.am;
                if am.tx.sn_field_length != am.rx.sn_field_length {
                    return Err(LayerError::InvalidConfiguration(format!(
                        "AM Tx/Rx SN field lengths differ: {} vs {}",
                        am.tx.sn_field_length, am.rx.sn_field_length
                    )));
                }
                if am.tx.max_retx_thresh == 0 {
                    return Err(LayerError::InvalidConfiguration(
                        "max_retx_thresh must be at least 1".to_string(),
                    ));
                }
                if am.tx.poll_pdu == Some(0) || am.tx.poll_byte == Some(0) {
                    return Err(LayerError::InvalidConfiguration(
                        "poll_pdu/poll_byte must be positive or unset".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sn_size_conversion() {
        assert_eq!(UmSnSize::try_from(6).unwrap(), UmSnSize::Size6Bits);
        assert!(UmSnSize::try_from(18).is_err());
        assert_eq!(AmSnSize::try_from(18).unwrap().bits(), 18);
        assert!(AmSnSize::try_from(6).is_err());
    }

    #[test]
    fn test_mode_directions() {
        assert!(RlcMode::Am.has_tx() && RlcMode::Am.has_rx());
        assert!(!RlcMode::UmUnidirUl.has_tx());
        assert!(!RlcMode::UmUnidirDl.has_rx());
        assert_eq!(RlcMode::UmBidir.to_string(), "UM Bi-dir");
    }

    #[test]
    fn test_validate_rejects_mismatched_sn() {
        let mut config = RlcConfig::default();
        assert!(config.validate().is_ok());

        config.am.rx.sn_field_length = AmSnSize::Size18Bits;
        assert!(config.validate().is_err());

        let mut config = RlcConfig::default();
        config.am.tx.max_retx_thresh = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: RlcConfig = serde_json::from_str(
            r#"{"mode": "um_bidir", "um": {"tx": {"sn_field_length": 6}, "rx": {"sn_field_length": 6, "t_reassembly_ms": 50}}}"#,
        )
        .unwrap();
        assert_eq!(config.mode, RlcMode::UmBidir);
        assert_eq!(config.um.rx.t_reassembly_ms, 50);
        assert_eq!(config.um.tx.sn_field_length, UmSnSize::Size6Bits);
        assert!(config.validate().is_ok());

        let bad = serde_json::from_str::<RlcConfig>(r#"{"mode": "am", "am": {"tx": {"sn_field_length": 7}}}"#);
        assert!(bad.is_err());
    }
}
