//! RLC Base Entity
//!
//! Composes the transmitting and receiving sides configured for a bearer
//! and multiplexes AM STATUS PDUs onto the PDU path.

use super::config::{AmSnSize, RlcConfig, RlcMode};
use super::metrics::RlcMetrics;
use super::pdu::{DcField, StatusPdu};
use super::rx_am::RlcRxAmEntity;
use super::rx_um::RlcRxUmEntity;
use super::tm::{RlcRxTmEntity, RlcTxTmEntity};
use super::tx_am::{RlcTxAmEntity, TxAmState};
use super::tx_um::RlcTxUmEntity;
use super::{RlcError, RlcNotifiers, RlcRxEntity, RlcTxEntity, RlcTxLowerLayerNotifier, RxState};
use crate::LayerError;
use bytes::Bytes;
use common::types::{Lcid, UeIndex};
use common::utils::bytes_to_hex;
use std::sync::Arc;
use tracing::{debug, info, info_span, trace, Span};

/// Mode-specific entity pair
enum Bearer {
    Tm {
        tx: RlcTxTmEntity,
        rx: RlcRxTmEntity,
    },
    Um {
        tx: Option<RlcTxUmEntity>,
        rx: Option<RlcRxUmEntity>,
    },
    Am {
        tx: RlcTxAmEntity,
        rx: RlcRxAmEntity,
        sn_size: AmSnSize,
    },
}

impl Bearer {
    fn tx(&mut self) -> Result<&mut dyn RlcTxEntity, RlcError> {
        match self {
            Bearer::Tm { tx, .. } => Ok(tx),
            Bearer::Um { tx: Some(tx), .. } => Ok(tx),
            Bearer::Um { tx: None, .. } => Err(RlcError::DirectionNotConfigured("Tx")),
            Bearer::Am { tx, .. } => Ok(tx),
        }
    }

    fn rx(&mut self) -> Result<&mut dyn RlcRxEntity, RlcError> {
        match self {
            Bearer::Tm { rx, .. } => Ok(rx),
            Bearer::Um { rx: Some(rx), .. } => Ok(rx),
            Bearer::Um { rx: None, .. } => Err(RlcError::DirectionNotConfigured("Rx")),
            Bearer::Am { rx, .. } => Ok(rx),
        }
    }

    fn tx_ref(&self) -> Option<&dyn RlcTxEntity> {
        match self {
            Bearer::Tm { tx, .. } => Some(tx),
            Bearer::Um { tx, .. } => tx.as_ref().map(|tx| tx as &dyn RlcTxEntity),
            Bearer::Am { tx, .. } => Some(tx),
        }
    }

    fn rx_ref(&self) -> Option<&dyn RlcRxEntity> {
        match self {
            Bearer::Tm { rx, .. } => Some(rx),
            Bearer::Um { rx, .. } => rx.as_ref().map(|rx| rx as &dyn RlcRxEntity),
            Bearer::Am { rx, .. } => Some(rx),
        }
    }
}

/// RLC entity of one radio bearer
pub struct RlcEntity {
    ue_index: UeIndex,
    lcid: Lcid,
    mode: RlcMode,
    bearer: Bearer,
    lower_dn: Arc<dyn RlcTxLowerLayerNotifier>,
    span: Span,
}

impl RlcEntity {
    /// Build the entity pair for `config.mode`
    pub fn new(ue_index: UeIndex, lcid: Lcid, config: &RlcConfig, notifiers: RlcNotifiers) -> Result<Self, LayerError> {
        config.validate()?;
        let span = info_span!("rlc", ue = %ue_index, lcid = %lcid);
        let bearer = span.in_scope(|| {
            info!("Creating RLC entity: mode={}", config.mode);
            let RlcNotifiers {
                rx_upper_dn,
                tx_upper_dn,
                tx_upper_cn,
                tx_lower_dn,
            } = notifiers.clone();
            match config.mode {
                RlcMode::Tm => Bearer::Tm {
                    tx: RlcTxTmEntity::new(config.tm.clone(), tx_lower_dn),
                    rx: RlcRxTmEntity::new(rx_upper_dn),
                },
                RlcMode::UmBidir | RlcMode::UmUnidirUl | RlcMode::UmUnidirDl => Bearer::Um {
                    tx: config
                        .mode
                        .has_tx()
                        .then(|| RlcTxUmEntity::new(config.um.tx.clone(), tx_lower_dn)),
                    rx: config
                        .mode
                        .has_rx()
                        .then(|| RlcRxUmEntity::new(config.um.rx.clone(), rx_upper_dn)),
                },
                RlcMode::Am => Bearer::Am {
                    tx: RlcTxAmEntity::new(config.am.tx.clone(), tx_upper_dn, tx_upper_cn, tx_lower_dn),
                    rx: RlcRxAmEntity::new(config.am.rx.clone(), rx_upper_dn),
                    sn_size: config.am.tx.sn_field_length,
                },
            }
        });
        Ok(Self {
            ue_index,
            lcid,
            mode: config.mode,
            bearer,
            lower_dn: notifiers.tx_lower_dn,
            span,
        })
    }

    pub fn ue_index(&self) -> UeIndex {
        self.ue_index
    }

    pub fn lcid(&self) -> Lcid {
        self.lcid
    }

    pub fn mode(&self) -> RlcMode {
        self.mode
    }

    /// State of the AM transmitter, `None` for other modes
    pub fn am_tx_state(&self) -> Option<TxAmState> {
        match &self.bearer {
            Bearer::Am { tx, .. } => Some(tx.state()),
            _ => None,
        }
    }

    /// Reassembly state of the receiver, `None` without one (TM or UM Tx only)
    pub fn rx_state(&self) -> Option<RxState> {
        match &self.bearer {
            Bearer::Am { rx, .. } => Some(rx.state()),
            Bearer::Um { rx: Some(rx), .. } => Some(rx.state()),
            _ => None,
        }
    }

    /// Queue an SDU for transmission
    pub fn submit_sdu(&mut self, sdu: Bytes) -> Result<(), RlcError> {
        let _enter = self.span.enter();
        self.bearer.tx()?.submit_sdu(sdu)
    }

    /// Build one PDU of at most `grant` bytes; a due STATUS PDU goes first
    pub fn pull_pdu(&mut self, grant: usize) -> Result<Option<Bytes>, RlcError> {
        let _enter = self.span.enter();
        if let Bearer::Am { tx, rx, .. } = &mut self.bearer {
            if let Some(status) = rx.pull_status_pdu(grant) {
                self.lower_dn.on_buffer_state_update(tx.buffer_state());
                return Ok(Some(status));
            }
        }
        Ok(self.bearer.tx()?.pull_pdu(grant))
    }

    /// Process one PDU from the lower layer
    pub fn handle_pdu(&mut self, pdu: Bytes) -> Result<(), RlcError> {
        let _enter = self.span.enter();
        trace!("Rx PDU: {}", bytes_to_hex(&pdu));
        match &mut self.bearer {
            Bearer::Am { tx, rx, sn_size } => match DcField::of(&pdu) {
                None => Err(RlcError::MalformedPdu("empty PDU".to_string())),
                Some(DcField::Control) => {
                    let status = StatusPdu::decode(&pdu, *sn_size)?;
                    tx.handle_status_report(status)
                }
                Some(DcField::Data) => {
                    rx.handle_pdu(pdu)?;
                    if rx.status_report_due() {
                        debug!("Status report due");
                        self.lower_dn
                            .on_buffer_state_update(tx.buffer_state() + rx.status_pdu_size());
                    }
                    Ok(())
                }
            },
            bearer => bearer.rx()?.handle_pdu(pdu),
        }
    }

    /// Advance all timers by one millisecond
    pub fn tick(&mut self) {
        let _enter = self.span.enter();
        if let Bearer::Am { tx, rx, .. } = &mut self.bearer {
            let status_was_due = rx.status_report_due();
            tx.tick();
            rx.tick();
            if !status_was_due && rx.status_report_due() {
                self.lower_dn
                    .on_buffer_state_update(tx.buffer_state() + rx.status_pdu_size());
            }
            return;
        }
        if let Ok(tx) = self.bearer.tx() {
            tx.tick();
        }
        if let Ok(rx) = self.bearer.rx() {
            rx.tick();
        }
    }

    /// Bytes the MAC needs to grant to drain the entity
    pub fn buffer_state(&self) -> usize {
        let status = match &self.bearer {
            Bearer::Am { rx, .. } => rx.status_pdu_size(),
            _ => 0,
        };
        self.bearer.tx_ref().map_or(0, |tx| tx.buffer_state()) + status
    }

    pub fn metrics(&self) -> RlcMetrics {
        RlcMetrics {
            tx: self.bearer.tx_ref().map(|tx| tx.metrics()).unwrap_or_default(),
            rx: self.bearer.rx_ref().map(|rx| rx.metrics()).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlc::config::{RlcAmConfig, RlcRxAmConfig, RlcTxAmConfig, RlcUmConfig, UmSnSize};
    use crate::rlc::metrics::RlcTxMetrics;
    use crate::rlc::pdu::AmdPduHeader;
    use crate::rlc::test_utils::{recording_notifiers, RecordingNotifier};

    fn entity(config: &RlcConfig) -> (Arc<RecordingNotifier>, RlcEntity) {
        let (recorder, notifiers) = recording_notifiers();
        let entity = RlcEntity::new(UeIndex(0), Lcid(4), config, notifiers).unwrap();
        (recorder, entity)
    }

    fn sdu(i: u32, len: usize) -> Bytes {
        let mut sdu = i.to_be_bytes().to_vec();
        sdu.resize(len, i as u8);
        Bytes::from(sdu)
    }

    #[test]
    fn test_am_poll_pdu_scenario() {
        let config = RlcConfig::am(RlcAmConfig {
            tx: RlcTxAmConfig {
                poll_pdu: Some(4),
                ..Default::default()
            },
            ..Default::default()
        });
        let (recorder, mut gnb) = entity(&config);
        let (ue_recorder, mut ue) = entity(&config);

        for i in 0..10 {
            gnb.submit_sdu(sdu(i, 100)).unwrap();
        }
        let mut pdus = Vec::new();
        while let Some(pdu) = gnb.pull_pdu(50).unwrap() {
            assert!(pdu.len() <= 50);
            pdus.push(pdu);
        }
        let polls: Vec<bool> = pdus
            .iter()
            .map(|pdu| AmdPduHeader::decode(pdu, AmSnSize::Size12Bits).unwrap().0.p)
            .collect();
        assert!(polls[3]);
        assert!(polls[7]);
        assert!(!polls[0] && !polls[1] && !polls[2] && !polls[4] && !polls[5] && !polls[6]);
        assert_eq!(gnb.am_tx_state(), Some(TxAmState::Polling));

        // Crafted status acknowledging SNs 0..5
        let status = StatusPdu::new(5).encode(AmSnSize::Size12Bits);
        gnb.handle_pdu(status).unwrap();
        assert_eq!(recorder.delivered(), vec![0, 1, 2, 3, 4]);

        // The peer's own status report acknowledges the rest
        for pdu in pdus {
            ue.handle_pdu(pdu).unwrap();
        }
        assert_eq!(ue_recorder.sdus(), (0..10).map(|i| sdu(i, 100)).collect::<Vec<_>>());
        let status = ue.pull_pdu(100).unwrap().expect("status report after poll");
        assert_eq!(DcField::of(&status), Some(DcField::Control));
        assert_eq!(StatusPdu::decode(&status, AmSnSize::Size12Bits).unwrap(), StatusPdu::new(10));

        gnb.handle_pdu(status).unwrap();
        assert_eq!(recorder.delivered(), (0..10).collect::<Vec<_>>());
        assert_eq!(gnb.am_tx_state(), Some(TxAmState::Idle));
        assert_eq!(gnb.buffer_state(), 0);
    }

    #[test]
    fn test_am_loopback_with_loss() {
        let config = RlcConfig::am(RlcAmConfig {
            tx: RlcTxAmConfig {
                poll_pdu: Some(8),
                t_poll_retx: 20,
                ..Default::default()
            },
            rx: RlcRxAmConfig {
                t_reassembly: 500,
                t_status_prohibit: 5,
                ..Default::default()
            },
        });
        let (gnb_recorder, mut gnb) = entity(&config);
        let (ue_recorder, mut ue) = entity(&config);
        let sdus: Vec<Bytes> = (0..40).map(|i| sdu(i, 30 + (i as usize * 17) % 150)).collect();
        for sdu in &sdus {
            gnb.submit_sdu(sdu.clone()).unwrap();
        }

        let mut sent = 0;
        for _slot in 0..2000 {
            if let Some(pdu) = gnb.pull_pdu(64).unwrap() {
                sent += 1;
                // Lose every 7th PDU on the way down
                if sent % 7 != 0 {
                    let _ = ue.handle_pdu(pdu);
                }
            }
            if let Some(status) = ue.pull_pdu(64).unwrap() {
                gnb.handle_pdu(status).unwrap();
            }
            gnb.tick();
            ue.tick();
            if gnb_recorder.delivered().len() == sdus.len() {
                break;
            }
        }
        assert_eq!(ue_recorder.sdus(), sdus);
        // Acknowledgements of retransmitted SNs may arrive after later ones
        let mut delivered = gnb_recorder.delivered();
        delivered.sort_unstable();
        assert_eq!(delivered, (0..40).collect::<Vec<_>>());
        assert_eq!(gnb_recorder.max_retx_count(), 0);
        assert_eq!(ue.rx_state(), Some(RxState::Receiving));
        let metrics = gnb.metrics();
        assert!(metrics.tx.num_retx_pdus > 0);
        assert_eq!(metrics.tx.num_sdus, 40);
    }

    #[test]
    fn test_am_12bit_wraparound_with_loss() {
        let config = RlcConfig::am(RlcAmConfig {
            tx: RlcTxAmConfig {
                poll_pdu: Some(16),
                t_poll_retx: 20,
                max_retx_thresh: 16,
                ..Default::default()
            },
            rx: RlcRxAmConfig {
                t_reassembly: 500,
                t_status_prohibit: 5,
                ..Default::default()
            },
        });
        let (gnb_recorder, mut gnb) = entity(&config);
        let (ue_recorder, mut ue) = entity(&config);
        let count = 4200u32;
        let sdus: Vec<Bytes> = (0..count).map(|i| sdu(i, 20)).collect();
        for sdu in &sdus {
            gnb.submit_sdu(sdu.clone()).unwrap();
        }

        let mut sent = 0;
        for _slot in 0..20_000 {
            if let Some(pdu) = gnb.pull_pdu(64).unwrap() {
                sent += 1;
                if sent % 13 != 0 {
                    let _ = ue.handle_pdu(pdu);
                }
            }
            if let Some(status) = ue.pull_pdu(200).unwrap() {
                gnb.handle_pdu(status).unwrap();
            }
            gnb.tick();
            ue.tick();
            if gnb_recorder.delivered.lock().unwrap().len() == sdus.len() {
                break;
            }
        }
        // SN 4095 is followed by SN 0
        assert_eq!(ue_recorder.sdus(), sdus);
        let mut delivered = gnb_recorder.delivered();
        delivered.sort_unstable();
        let mut expected: Vec<u32> = (0..count).map(|i| i % 4096).collect();
        expected.sort_unstable();
        assert_eq!(delivered, expected);
        assert!(gnb_recorder.failures.lock().unwrap().is_empty());
        assert_eq!(gnb_recorder.max_retx_count(), 0);
        assert_eq!(gnb.am_tx_state(), Some(TxAmState::Idle));
        assert_eq!(ue.metrics().rx.num_lost_sdus, 0);
    }

    #[test]
    fn test_um_unidirectional_modes() {
        let (_recorder, mut dl) = entity(&RlcConfig::um(RlcMode::UmUnidirDl, RlcUmConfig::default()));
        dl.submit_sdu(Bytes::from_static(b"data")).unwrap();
        assert_eq!(
            dl.handle_pdu(Bytes::from_static(&[0x00, 0x01])),
            Err(RlcError::DirectionNotConfigured("Rx"))
        );

        let (recorder, mut ul) = entity(&RlcConfig::um(RlcMode::UmUnidirUl, RlcUmConfig::default()));
        assert_eq!(
            ul.submit_sdu(Bytes::from_static(b"data")),
            Err(RlcError::DirectionNotConfigured("Tx"))
        );
        assert_eq!(ul.pull_pdu(100), Err(RlcError::DirectionNotConfigured("Tx")));
        ul.handle_pdu(dl.pull_pdu(100).unwrap().unwrap()).unwrap();
        assert_eq!(recorder.sdus(), vec![Bytes::from_static(b"data")]);
        assert_eq!(ul.metrics().tx, RlcTxMetrics::default());
    }

    #[test]
    fn test_um_bidir_segmented_round_trip() {
        let mut um = RlcUmConfig::default();
        um.tx.sn_field_length = UmSnSize::Size6Bits;
        um.rx.sn_field_length = UmSnSize::Size6Bits;
        let config = RlcConfig::um(RlcMode::UmBidir, um);
        let (_tx_recorder, mut tx) = entity(&config);
        let (rx_recorder, mut rx) = entity(&config);

        let sdus: Vec<Bytes> = (0..100).map(|i| sdu(i, 25)).collect();
        for sdu in &sdus {
            tx.submit_sdu(sdu.clone()).unwrap();
        }
        assert_eq!(tx.buffer_state(), 100 * 26);
        while let Some(pdu) = tx.pull_pdu(12).unwrap() {
            rx.handle_pdu(pdu).unwrap();
        }
        assert_eq!(rx_recorder.sdus(), sdus);
        assert_eq!(rx.metrics().rx.num_sdus, 100);
    }

    #[test]
    fn test_tm_and_invalid_config() {
        let (recorder, mut tm) = entity(&RlcConfig {
            mode: RlcMode::Tm,
            ..Default::default()
        });
        tm.submit_sdu(Bytes::from_static(b"msg")).unwrap();
        let pdu = tm.pull_pdu(3).unwrap().unwrap();
        assert_eq!(&pdu[..], b"msg");
        tm.handle_pdu(pdu).unwrap();
        assert_eq!(recorder.sdus().len(), 1);
        assert_eq!(tm.rx_state(), None);

        let mut config = RlcConfig::default();
        config.am.tx.max_retx_thresh = 0;
        let (_recorder, notifiers) = recording_notifiers();
        assert!(matches!(
            RlcEntity::new(UeIndex(1), Lcid(5), &config, notifiers),
            Err(LayerError::InvalidConfiguration(_))
        ));
    }
}
