//! RLC bearer counters

use serde::Serialize;

/// Transmitting side counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RlcTxMetrics {
    /// SDUs accepted from the upper layer
    pub num_sdus: u64,
    pub num_sdu_bytes: u64,
    /// SDUs rejected at submission
    pub num_dropped_sdus: u64,
    /// PDUs handed to the lower layer, retransmissions included
    pub num_pdus: u64,
    pub num_pdu_bytes: u64,
    pub num_retx_pdus: u64,
    pub num_retx_bytes: u64,
    /// STATUS PDUs received from the peer
    pub num_status_pdus: u64,
}

/// Receiving side counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RlcRxMetrics {
    /// SDUs delivered to the upper layer
    pub num_sdus: u64,
    pub num_sdu_bytes: u64,
    /// Data PDUs received
    pub num_pdus: u64,
    pub num_pdu_bytes: u64,
    /// Duplicate and out-of-window PDUs
    pub num_dropped_pdus: u64,
    pub num_malformed_pdus: u64,
    /// SDUs declared lost on t-Reassembly expiry
    pub num_lost_sdus: u64,
    /// STATUS PDUs sent to the peer
    pub num_status_pdus: u64,
}

/// Both directions of one bearer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RlcMetrics {
    pub tx: RlcTxMetrics,
    pub rx: RlcRxMetrics,
}

impl RlcRxMetrics {
    pub(crate) fn add_sdu(&mut self, len: usize) {
        self.num_sdus += 1;
        self.num_sdu_bytes += len as u64;
    }

    pub(crate) fn add_pdu(&mut self, len: usize) {
        self.num_pdus += 1;
        self.num_pdu_bytes += len as u64;
    }
}

impl RlcTxMetrics {
    pub(crate) fn add_sdu(&mut self, len: usize) {
        self.num_sdus += 1;
        self.num_sdu_bytes += len as u64;
    }

    pub(crate) fn add_pdu(&mut self, len: usize) {
        self.num_pdus += 1;
        self.num_pdu_bytes += len as u64;
    }

    pub(crate) fn add_retx_pdu(&mut self, len: usize) {
        self.add_pdu(len);
        self.num_retx_pdus += 1;
        self.num_retx_bytes += len as u64;
    }
}
