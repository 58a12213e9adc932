//! TM Entities
//!
//! Transparent mode (TS 38.322 §5.2.1): no header, no segmentation.

use super::config::RlcTmConfig;
use super::metrics::{RlcRxMetrics, RlcTxMetrics};
use super::{
    check_queue_limit, check_sdu, RlcError, RlcRxEntity, RlcRxUpperLayerDataNotifier, RlcTxEntity,
    RlcTxLowerLayerNotifier,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// TM transmitting side
pub struct RlcTxTmEntity {
    config: RlcTmConfig,
    sdu_queue: VecDeque<Bytes>,
    sdu_queue_bytes: usize,
    lower_dn: Arc<dyn RlcTxLowerLayerNotifier>,
    metrics: RlcTxMetrics,
}

impl RlcTxTmEntity {
    pub fn new(config: RlcTmConfig, lower_dn: Arc<dyn RlcTxLowerLayerNotifier>) -> Self {
        Self {
            config,
            sdu_queue: VecDeque::new(),
            sdu_queue_bytes: 0,
            lower_dn,
            metrics: RlcTxMetrics::default(),
        }
    }
}

impl RlcTxEntity for RlcTxTmEntity {
    fn submit_sdu(&mut self, sdu: Bytes) -> Result<(), RlcError> {
        if let Err(err) = check_sdu(&sdu)
            .and_then(|_| check_queue_limit(self.sdu_queue_bytes, sdu.len(), self.config.queue_limit_bytes))
        {
            self.metrics.num_dropped_sdus += 1;
            warn!("Dropping SDU: {}", err);
            return Err(err);
        }
        self.metrics.add_sdu(sdu.len());
        self.sdu_queue_bytes += sdu.len();
        self.sdu_queue.push_back(sdu);
        self.lower_dn.on_buffer_state_update(self.sdu_queue_bytes);
        Ok(())
    }

    fn pull_pdu(&mut self, grant: usize) -> Option<Bytes> {
        let len = self.sdu_queue.front()?.len();
        if len > grant {
            debug!("TM SDU of {} bytes does not fit grant of {} bytes", len, grant);
            return None;
        }
        let sdu = self.sdu_queue.pop_front()?;
        self.sdu_queue_bytes -= len;
        self.metrics.add_pdu(len);
        self.lower_dn.on_buffer_state_update(self.sdu_queue_bytes);
        Some(sdu)
    }

    fn buffer_state(&self) -> usize {
        self.sdu_queue_bytes
    }

    fn metrics(&self) -> RlcTxMetrics {
        self.metrics.clone()
    }
}

/// TM receiving side
pub struct RlcRxTmEntity {
    upper_dn: Arc<dyn RlcRxUpperLayerDataNotifier>,
    metrics: RlcRxMetrics,
}

impl RlcRxTmEntity {
    pub fn new(upper_dn: Arc<dyn RlcRxUpperLayerDataNotifier>) -> Self {
        Self {
            upper_dn,
            metrics: RlcRxMetrics::default(),
        }
    }
}

impl RlcRxEntity for RlcRxTmEntity {
    fn handle_pdu(&mut self, pdu: Bytes) -> Result<(), RlcError> {
        self.metrics.add_pdu(pdu.len());
        if pdu.is_empty() {
            self.metrics.num_malformed_pdus += 1;
            return Err(RlcError::MalformedPdu("empty TM PDU".to_string()));
        }
        self.metrics.add_sdu(pdu.len());
        self.upper_dn.on_new_sdu(pdu);
        Ok(())
    }

    fn metrics(&self) -> RlcRxMetrics {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlc::test_utils::recording_notifiers;

    #[test]
    fn test_tm_pass_through() {
        let (recorder, n) = recording_notifiers();
        let mut tx = RlcTxTmEntity::new(RlcTmConfig::default(), n.tx_lower_dn);
        let mut rx = RlcRxTmEntity::new(n.rx_upper_dn);

        tx.submit_sdu(Bytes::from_static(b"rrc setup")).unwrap();
        assert_eq!(recorder.last_buffer_state(), Some(9));
        assert!(tx.pull_pdu(8).is_none());
        let pdu = tx.pull_pdu(9).unwrap();
        assert_eq!(recorder.last_buffer_state(), Some(0));

        rx.handle_pdu(pdu).unwrap();
        assert_eq!(recorder.sdus(), vec![Bytes::from_static(b"rrc setup")]);
        assert!(rx.handle_pdu(Bytes::new()).is_err());
    }
}
