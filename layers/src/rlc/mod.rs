//! Radio Link Control (RLC) Layer Implementation
//!
//! Implements the 5G NR RLC layer according to 3GPP TS 38.322: the
//! transparent (TM), unacknowledged (UM) and acknowledged (AM) mode
//! entities of one radio bearer, and the task that drives them.

pub mod config;
pub mod entity;
pub mod layer;
pub mod metrics;
pub mod pdu;
pub mod reassembly;
pub mod rx_am;
pub mod rx_um;
pub mod sn;
pub mod sn_table;
pub mod timer;
pub mod tm;
pub mod tx_am;
pub mod tx_um;

pub use config::{
    AmSnSize, RlcAmConfig, RlcConfig, RlcMode, RlcRxAmConfig, RlcRxUmConfig, RlcTmConfig,
    RlcTxAmConfig, RlcTxUmConfig, RlcUmConfig, UmSnSize,
};
pub use entity::RlcEntity;
pub use layer::{RlcEvent, RlcLayer};
pub use metrics::{RlcMetrics, RlcRxMetrics, RlcTxMetrics};

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Largest SDU accepted from the upper layer (max PDCP PDU size, TS 38.323)
pub const MAX_SDU_SIZE: usize = 9000;

/// RLC entity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RlcError {
    #[error("Malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("Duplicate or out-of-window PDU, SN={sn}")]
    DuplicateOrOutOfWindow { sn: u32 },

    #[error("SDU queue full: {queued} bytes queued, SDU of {sdu_len} bytes, limit {limit}")]
    CapacityExceeded {
        queued: usize,
        sdu_len: usize,
        limit: usize,
    },

    #[error("Empty SDU")]
    EmptySdu,

    #[error("SDU of {len} bytes exceeds maximum of {max}")]
    SduTooLarge { len: usize, max: usize },

    #[error("Invalid status PDU: {0}")]
    InvalidStatusPdu(String),

    #[error("{0} direction not configured for this bearer")]
    DirectionNotConfigured(&'static str),
}

/// Delivery of reassembled SDUs to the upper layer
pub trait RlcRxUpperLayerDataNotifier: Send + Sync {
    /// A complete SDU was received
    fn on_new_sdu(&self, sdu: Bytes);
}

/// Transmit progress reported to the upper layer
pub trait RlcTxUpperLayerDataNotifier: Send + Sync {
    /// The last new byte of the SDU with this SN left the entity
    fn on_transmitted_sdu(&self, sn: u32);

    /// The peer acknowledged the SDU with this SN (AM only)
    fn on_delivered_sdu(&self, sn: u32);
}

/// Bearer failures reported to the control plane
pub trait RlcTxUpperLayerControlNotifier: Send + Sync {
    /// A PDU reached `max_retx_thresh` retransmissions
    fn on_max_retx(&self);

    /// The peer violated the protocol
    fn on_protocol_failure(&self, error: RlcError);
}

/// Buffer state reports towards the MAC scheduler
pub trait RlcTxLowerLayerNotifier: Send + Sync {
    /// Bytes the entity needs to drain its buffers, headers included
    fn on_buffer_state_update(&self, bytes: usize);
}

/// Callback set handed to an entity at construction
#[derive(Clone)]
pub struct RlcNotifiers {
    pub rx_upper_dn: Arc<dyn RlcRxUpperLayerDataNotifier>,
    pub tx_upper_dn: Arc<dyn RlcTxUpperLayerDataNotifier>,
    pub tx_upper_cn: Arc<dyn RlcTxUpperLayerControlNotifier>,
    pub tx_lower_dn: Arc<dyn RlcTxLowerLayerNotifier>,
}

/// Observable state of a receiving entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// No reassembly timer running
    Receiving,
    /// t-Reassembly running
    ReassemblyPending,
}

/// Transmitting side of a bearer
pub trait RlcTxEntity: Send {
    /// Queue an SDU from the upper layer
    fn submit_sdu(&mut self, sdu: Bytes) -> Result<(), RlcError>;

    /// Build one PDU of at most `grant` bytes
    fn pull_pdu(&mut self, grant: usize) -> Option<Bytes>;

    /// Bytes needed to drain the entity
    fn buffer_state(&self) -> usize;

    /// Advance the entity clock by one millisecond
    fn tick(&mut self) {}

    /// Counter snapshot
    fn metrics(&self) -> RlcTxMetrics;
}

/// Receiving side of a bearer
pub trait RlcRxEntity: Send {
    /// Process one PDU from the lower layer
    fn handle_pdu(&mut self, pdu: Bytes) -> Result<(), RlcError>;

    /// Advance the entity clock by one millisecond
    fn tick(&mut self) {}

    /// Counter snapshot
    fn metrics(&self) -> RlcRxMetrics;
}

/// Reject SDUs the transmitting side can never carry
pub(crate) fn check_sdu(sdu: &Bytes) -> Result<(), RlcError> {
    if sdu.is_empty() {
        return Err(RlcError::EmptySdu);
    }
    if sdu.len() > MAX_SDU_SIZE {
        return Err(RlcError::SduTooLarge {
            len: sdu.len(),
            max: MAX_SDU_SIZE,
        });
    }
    Ok(())
}

/// Check an SDU against the queue byte limit
pub(crate) fn check_queue_limit(queued: usize, sdu_len: usize, limit: Option<usize>) -> Result<(), RlcError> {
    match limit {
        Some(limit) if queued + sdu_len > limit => Err(RlcError::CapacityExceeded {
            queued,
            sdu_len,
            limit,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    //! Recording notifiers shared by the entity tests

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sdus: Mutex<Vec<Bytes>>,
        pub transmitted: Mutex<Vec<u32>>,
        pub delivered: Mutex<Vec<u32>>,
        pub max_retx: Mutex<u32>,
        pub failures: Mutex<Vec<RlcError>>,
        pub buffer_states: Mutex<Vec<usize>>,
    }

    impl RecordingNotifier {
        pub fn sdus(&self) -> Vec<Bytes> {
            self.sdus.lock().unwrap().clone()
        }

        pub fn delivered(&self) -> Vec<u32> {
            self.delivered.lock().unwrap().clone()
        }

        pub fn transmitted(&self) -> Vec<u32> {
            self.transmitted.lock().unwrap().clone()
        }

        pub fn max_retx_count(&self) -> u32 {
            *self.max_retx.lock().unwrap()
        }

        pub fn last_buffer_state(&self) -> Option<usize> {
            self.buffer_states.lock().unwrap().last().copied()
        }
    }

    impl RlcRxUpperLayerDataNotifier for RecordingNotifier {
        fn on_new_sdu(&self, sdu: Bytes) {
            self.sdus.lock().unwrap().push(sdu);
        }
    }

    impl RlcTxUpperLayerDataNotifier for RecordingNotifier {
        fn on_transmitted_sdu(&self, sn: u32) {
            self.transmitted.lock().unwrap().push(sn);
        }

        fn on_delivered_sdu(&self, sn: u32) {
            self.delivered.lock().unwrap().push(sn);
        }
    }

    impl RlcTxUpperLayerControlNotifier for RecordingNotifier {
        fn on_max_retx(&self) {
            *self.max_retx.lock().unwrap() += 1;
        }

        fn on_protocol_failure(&self, error: RlcError) {
            self.failures.lock().unwrap().push(error);
        }
    }

    impl RlcTxLowerLayerNotifier for RecordingNotifier {
        fn on_buffer_state_update(&self, bytes: usize) {
            self.buffer_states.lock().unwrap().push(bytes);
        }
    }

    /// One recorder wired into every notifier slot
    pub fn recording_notifiers() -> (Arc<RecordingNotifier>, RlcNotifiers) {
        let recorder = Arc::new(RecordingNotifier::default());
        let notifiers = RlcNotifiers {
            rx_upper_dn: recorder.clone(),
            tx_upper_dn: recorder.clone(),
            tx_upper_cn: recorder.clone(),
            tx_lower_dn: recorder.clone(),
        };
        (recorder, notifiers)
    }
}
