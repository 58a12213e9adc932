//! Common Types for the RLC bearer engine
//!
//! Defines the identifiers used to name a bearer throughout the stack

use serde::{Deserialize, Serialize};
use std::fmt;

/// DU-local UE index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UeIndex(pub u16);

impl UeIndex {
    /// Maximum number of UEs handled by one DU
    pub const MAX_NOF_UES: u16 = 1024;

    /// Create a new UE index with validation
    pub fn new(value: u16) -> Option<Self> {
        if value < Self::MAX_NOF_UES {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Get the index value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for UeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical Channel ID (TS 38.321 Table 6.2.1-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lcid(pub u8);

impl Lcid {
    /// SRB0 (CCCH)
    pub const SRB0: Self = Self(0);
    /// SRB1
    pub const SRB1: Self = Self(1);
    /// SRB2
    pub const SRB2: Self = Self(2);
    /// SRB3
    pub const SRB3: Self = Self(3);
    /// First LCID usable by a DRB
    pub const MIN_DRB: u8 = 4;
    /// Last LCID usable by a DRB
    pub const MAX_DRB: u8 = 32;

    /// Create a new LCID with validation
    pub fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX_DRB {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Whether this LCID carries a signalling radio bearer
    pub fn is_srb(&self) -> bool {
        self.0 < Self::MIN_DRB
    }
}

impl fmt::Display for Lcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_srb() {
            write!(f, "{} (SRB{})", self.0, self.0)
        } else {
            write!(f, "{} (DRB)", self.0)
        }
    }
}
