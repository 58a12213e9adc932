//! UM Transmitting Entity
//!
//! Segmentation and SN assignment of TS 38.322 §5.2.2.1. Whole SDUs go out
//! without an SN; segmented SDUs carry TX_Next, which advances after the
//! last segment.

use super::config::{RlcTxUmConfig, UmSnSize};
use super::metrics::RlcTxMetrics;
use super::pdu::{SiField, UmdPduHeader};
use super::sn::SnSpace;
use super::{check_queue_limit, check_sdu, RlcError, RlcTxEntity, RlcTxLowerLayerNotifier};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// UM transmitting side of a bearer
pub struct RlcTxUmEntity {
    config: RlcTxUmConfig,
    sn_size: UmSnSize,
    sn: SnSpace,

    sdu_queue: VecDeque<Bytes>,
    sdu_queue_bytes: usize,
    /// SDU under segmentation and its next segment offset
    segmentation: Option<(Bytes, usize)>,
    /// SN of the next segmented SDU
    tx_next: u32,

    lower_dn: Arc<dyn RlcTxLowerLayerNotifier>,
    last_buffer_state: usize,
    metrics: RlcTxMetrics,
}

impl RlcTxUmEntity {
    pub fn new(config: RlcTxUmConfig, lower_dn: Arc<dyn RlcTxLowerLayerNotifier>) -> Self {
        let sn_size = config.sn_field_length;
        info!("Creating RLC Tx UM entity: sn_field_length={}", sn_size);
        Self {
            sn_size,
            sn: SnSpace::new(sn_size.bits()),
            sdu_queue: VecDeque::new(),
            sdu_queue_bytes: 0,
            segmentation: None,
            tx_next: 0,
            lower_dn,
            last_buffer_state: 0,
            metrics: RlcTxMetrics::default(),
            config,
        }
    }

    pub fn tx_next(&self) -> u32 {
        self.tx_next
    }

    fn build_pdu(&self, header: UmdPduHeader, payload: &[u8]) -> Bytes {
        let mut pdu = BytesMut::with_capacity(UmdPduHeader::packed_size(self.sn_size, header.si) + payload.len());
        header.write(self.sn_size, &mut pdu);
        pdu.extend_from_slice(payload);
        pdu.freeze()
    }

    fn build_segment(&mut self, grant: usize) -> Option<Bytes> {
        let (sdu, so) = self.segmentation.take()?;
        let header_size = UmdPduHeader::packed_size(self.sn_size, SiField::MiddleSegment);
        if grant <= header_size {
            trace!("Grant of {} bytes too small for next segment", grant);
            self.segmentation = Some((sdu, so));
            return None;
        }
        let length = (sdu.len() - so).min(grant - header_size);
        let last = so + length == sdu.len();
        let header = UmdPduHeader {
            si: if last { SiField::LastSegment } else { SiField::MiddleSegment },
            sn: self.tx_next,
            so: so as u16,
        };
        let pdu = self.build_pdu(header, &sdu[so..so + length]);
        debug!("Sending SN={} SI={} SO={} payload={}", header.sn, header.si, so, length);
        if last {
            self.tx_next = self.sn.next(self.tx_next);
        } else {
            self.segmentation = Some((sdu, so + length));
        }
        Some(pdu)
    }

    fn build_new(&mut self, grant: usize) -> Option<Bytes> {
        let sdu_len = self.sdu_queue.front()?.len();
        let full_size = UmdPduHeader::packed_size(self.sn_size, SiField::FullSdu) + sdu_len;
        let first_header = UmdPduHeader::packed_size(self.sn_size, SiField::FirstSegment);
        if full_size > grant && grant <= first_header {
            trace!("Grant of {} bytes too small for a new PDU", grant);
            return None;
        }
        let sdu = self.sdu_queue.pop_front()?;
        self.sdu_queue_bytes -= sdu.len();

        if full_size <= grant {
            let header = UmdPduHeader {
                si: SiField::FullSdu,
                sn: 0,
                so: 0,
            };
            debug!("Sending full SDU, payload={}", sdu.len());
            return Some(self.build_pdu(header, &sdu));
        }
        let length = grant - first_header;
        let header = UmdPduHeader {
            si: SiField::FirstSegment,
            sn: self.tx_next,
            so: 0,
        };
        let pdu = self.build_pdu(header, &sdu[..length]);
        debug!("Sending SN={} SI={} payload={}", header.sn, header.si, length);
        self.segmentation = Some((sdu, length));
        Some(pdu)
    }

    fn report_buffer_state(&mut self) {
        let bs = self.buffer_state();
        if bs != self.last_buffer_state {
            self.last_buffer_state = bs;
            self.lower_dn.on_buffer_state_update(bs);
        }
    }
}

impl RlcTxEntity for RlcTxUmEntity {
    fn submit_sdu(&mut self, sdu: Bytes) -> Result<(), RlcError> {
        if let Err(err) = check_sdu(&sdu)
            .and_then(|_| check_queue_limit(self.sdu_queue_bytes, sdu.len(), self.config.queue_limit_bytes))
        {
            self.metrics.num_dropped_sdus += 1;
            warn!("Dropping SDU: {}", err);
            return Err(err);
        }
        debug!("Queued SDU of {} bytes", sdu.len());
        self.metrics.add_sdu(sdu.len());
        self.sdu_queue_bytes += sdu.len();
        self.sdu_queue.push_back(sdu);
        self.report_buffer_state();
        Ok(())
    }

    fn pull_pdu(&mut self, grant: usize) -> Option<Bytes> {
        let pdu = if self.segmentation.is_some() {
            self.build_segment(grant)
        } else {
            self.build_new(grant)
        }?;
        self.metrics.add_pdu(pdu.len());
        self.report_buffer_state();
        Some(pdu)
    }

    fn buffer_state(&self) -> usize {
        let full_header = UmdPduHeader::packed_size(self.sn_size, SiField::FullSdu);
        let segment = self.segmentation.as_ref().map_or(0, |(sdu, so)| {
            sdu.len() - so + UmdPduHeader::packed_size(self.sn_size, SiField::LastSegment)
        });
        self.sdu_queue_bytes + self.sdu_queue.len() * full_header + segment
    }

    fn metrics(&self) -> RlcTxMetrics {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlc::test_utils::recording_notifiers;

    fn tx_entity(sn_size: UmSnSize) -> RlcTxUmEntity {
        let (_recorder, n) = recording_notifiers();
        let config = RlcTxUmConfig {
            sn_field_length: sn_size,
            queue_limit_bytes: None,
        };
        RlcTxUmEntity::new(config, n.tx_lower_dn)
    }

    #[test]
    fn test_full_sdu_has_no_sn() {
        let mut tx = tx_entity(UmSnSize::Size12Bits);
        tx.submit_sdu(Bytes::from_static(b"abcd")).unwrap();
        assert_eq!(tx.buffer_state(), 5);
        let pdu = tx.pull_pdu(100).unwrap();
        assert_eq!(&pdu[..], &[0x00, b'a', b'b', b'c', b'd']);
        assert_eq!(tx.tx_next(), 0);
        assert_eq!(tx.buffer_state(), 0);
    }

    #[test]
    fn test_segmentation_advances_sn() {
        let mut tx = tx_entity(UmSnSize::Size6Bits);
        tx.submit_sdu(Bytes::from(vec![9u8; 10])).unwrap();

        let first = tx.pull_pdu(5).unwrap();
        let (h, len) = UmdPduHeader::decode(&first, UmSnSize::Size6Bits).unwrap();
        assert_eq!((h.si, h.sn, len, first.len()), (SiField::FirstSegment, 0, 1, 5));

        // SO header needs 3 bytes, a grant of 3 carries nothing
        assert!(tx.pull_pdu(3).is_none());

        let middle = tx.pull_pdu(6).unwrap();
        let (h, _) = UmdPduHeader::decode(&middle, UmSnSize::Size6Bits).unwrap();
        assert_eq!((h.si, h.so), (SiField::MiddleSegment, 4));

        let last = tx.pull_pdu(100).unwrap();
        let (h, _) = UmdPduHeader::decode(&last, UmSnSize::Size6Bits).unwrap();
        assert_eq!((h.si, h.so, last.len()), (SiField::LastSegment, 7, 6));
        assert_eq!(tx.tx_next(), 1);
        assert!(tx.pull_pdu(100).is_none());
        assert_eq!(tx.metrics().num_pdus, 3);
    }

    #[test]
    fn test_queue_limit() {
        let (_recorder, n) = recording_notifiers();
        let config = RlcTxUmConfig {
            queue_limit_bytes: Some(10),
            ..Default::default()
        };
        let mut tx = RlcTxUmEntity::new(config, n.tx_lower_dn);
        tx.submit_sdu(Bytes::from(vec![0u8; 10])).unwrap();
        assert!(matches!(
            tx.submit_sdu(Bytes::from_static(b"x")),
            Err(RlcError::CapacityExceeded { limit: 10, .. })
        ));
        tx.pull_pdu(100).unwrap();
        assert!(tx.submit_sdu(Bytes::from_static(b"x")).is_ok());
    }
}
