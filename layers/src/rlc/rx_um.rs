//! UM Receiving Entity
//!
//! Reassembly of TS 38.322 §5.2.2.2. The reassembly window is
//! `[RX_Next_Highest - UM_Window_Size, RX_Next_Highest)`; SDUs are
//! delivered as soon as all of their segments arrived.

use super::config::{RlcRxUmConfig, UmSnSize};
use super::metrics::RlcRxMetrics;
use super::pdu::{SiField, UmdPduHeader};
use super::reassembly::{SduReassembly, SegmentInsert};
use super::sn::SnSpace;
use super::sn_table::SnTable;
use super::timer::{RlcTimer, TimerKind};
use super::{RlcError, RlcRxEntity, RlcRxUpperLayerDataNotifier, RxState};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Reception state of one segmented SDU
#[derive(Debug, Default)]
struct RxUmSdu {
    reassembly: SduReassembly,
    delivered: bool,
}

/// UM receiving side of a bearer
pub struct RlcRxUmEntity {
    sn_size: UmSnSize,
    sn: SnSpace,

    rx_window: SnTable<RxUmSdu>,
    /// Earliest SN still considered for reassembly
    rx_next_reassembly: u32,
    /// RX_Next_Highest when t-Reassembly was started
    rx_timer_trigger: u32,
    /// One above the highest SN received
    rx_next_highest: u32,

    reassembly_timer: RlcTimer,
    now_ms: u64,

    upper_dn: Arc<dyn RlcRxUpperLayerDataNotifier>,
    metrics: RlcRxMetrics,
}

impl RlcRxUmEntity {
    pub fn new(config: RlcRxUmConfig, upper_dn: Arc<dyn RlcRxUpperLayerDataNotifier>) -> Self {
        let sn_size = config.sn_field_length;
        let sn = SnSpace::new(sn_size.bits());
        info!("Creating RLC Rx UM entity: {}", config);
        Self {
            sn_size,
            sn,
            rx_window: SnTable::new(sn.window_size() as usize),
            rx_next_reassembly: 0,
            rx_timer_trigger: 0,
            rx_next_highest: 0,
            reassembly_timer: RlcTimer::new(TimerKind::Reassembly, config.t_reassembly_ms),
            now_ms: 0,
            upper_dn,
            metrics: RlcRxMetrics::default(),
        }
    }

    pub fn rx_next_reassembly(&self) -> u32 {
        self.rx_next_reassembly
    }

    pub fn rx_next_highest(&self) -> u32 {
        self.rx_next_highest
    }

    pub fn is_reassembly_pending(&self) -> bool {
        self.reassembly_timer.is_running()
    }

    pub fn state(&self) -> RxState {
        if self.reassembly_timer.is_running() {
            RxState::ReassemblyPending
        } else {
            RxState::Receiving
        }
    }

    fn window_base(&self) -> u32 {
        self.sn.sub(self.rx_next_highest, self.sn.window_size())
    }

    /// Position of `sn` relative to the lower edge of the reassembly window
    fn rel(&self, sn: u32) -> u32 {
        self.sn.rel(sn, self.window_base())
    }

    fn inside_window(&self, sn: u32) -> bool {
        self.sn.inside_window(sn, self.window_base())
    }

    fn malformed(&mut self, err: RlcError) -> RlcError {
        self.metrics.num_malformed_pdus += 1;
        warn!("Discarding PDU: {}", err);
        err
    }

    fn deliver(&mut self, sdu: Bytes) {
        debug!("Delivering SDU ({} bytes)", sdu.len());
        self.metrics.add_sdu(sdu.len());
        self.upper_dn.on_new_sdu(sdu);
    }

    /// Drop the record of `sn`, counting it lost if it was never delivered
    fn discard(&mut self, sn: u32) {
        if let Some(record) = self.rx_window.remove(sn) {
            if !record.delivered {
                warn!("SN={} lost, {} bytes received", sn, record.reassembly.received_bytes());
                self.metrics.num_lost_sdus += 1;
            }
        }
    }

    /// Move RX_Next_Reassembly past SNs already delivered
    fn advance_reassembly(&mut self) {
        while self.rx_next_reassembly != self.rx_next_highest
            && self.rx_window.get(self.rx_next_reassembly).map_or(false, |r| r.delivered)
        {
            self.rx_window.remove(self.rx_next_reassembly);
            self.rx_next_reassembly = self.sn.next(self.rx_next_reassembly);
        }
    }

    /// Slide the window up so that `sn` becomes its highest SN
    fn move_window(&mut self, sn: u32) {
        let old_base = self.window_base();
        self.rx_next_highest = self.sn.next(sn);
        let new_base = self.window_base();
        let purge = self.sn.distance(old_base, new_base).min(self.sn.window_size());
        let mut old = old_base;
        for _ in 0..purge {
            self.discard(old);
            old = self.sn.next(old);
        }
        if !self.inside_window(self.rx_next_reassembly) {
            trace!(
                "RX_Next_Reassembly={} left the window, moving to {}",
                self.rx_next_reassembly,
                new_base
            );
            self.rx_next_reassembly = new_base;
            self.advance_reassembly();
        }
    }

    fn next_reassembly_has_gap(&self) -> bool {
        self.rx_window
            .get(self.rx_next_reassembly)
            .map_or(false, |r| r.reassembly.has_gap_before_last_byte())
    }

    fn start_reassembly_if_needed(&mut self) {
        let after_next = self.sn.next(self.rx_next_reassembly);
        if self.rel(self.rx_next_highest) > self.rel(after_next)
            || (self.rx_next_highest == after_next && self.next_reassembly_has_gap())
        {
            self.rx_timer_trigger = self.rx_next_highest;
            self.reassembly_timer.run(self.now_ms);
            trace!("{} started, RX_Timer_Trigger={}", self.reassembly_timer.kind(), self.rx_timer_trigger);
        }
    }

    fn update_reassembly_timer(&mut self) {
        if self.reassembly_timer.is_running() {
            let trigger = self.rx_timer_trigger;
            let trigger_passed = self.rel(trigger) <= self.rel(self.rx_next_reassembly)
                || (!self.inside_window(trigger) && trigger != self.rx_next_highest)
                || (self.rx_next_highest == self.sn.next(self.rx_next_reassembly) && !self.next_reassembly_has_gap());
            if trigger_passed {
                trace!("{} stopped", self.reassembly_timer.kind());
                self.reassembly_timer.stop();
            }
        }
        if !self.reassembly_timer.is_running() {
            self.start_reassembly_if_needed();
        }
    }

    fn on_reassembly_expired(&mut self) {
        debug!(
            "{} expired: RX_Next_Reassembly={}, RX_Timer_Trigger={}, RX_Next_Highest={}",
            self.reassembly_timer.kind(),
            self.rx_next_reassembly,
            self.rx_timer_trigger,
            self.rx_next_highest
        );
        while self.rx_next_reassembly != self.rx_timer_trigger {
            self.discard(self.rx_next_reassembly);
            self.rx_next_reassembly = self.sn.next(self.rx_next_reassembly);
        }
        self.advance_reassembly();
        self.start_reassembly_if_needed();
    }
}

impl RlcRxEntity for RlcRxUmEntity {
    fn handle_pdu(&mut self, pdu: Bytes) -> Result<(), RlcError> {
        self.metrics.add_pdu(pdu.len());
        let (header, header_len) = match UmdPduHeader::decode(&pdu, self.sn_size) {
            Ok(decoded) => decoded,
            Err(err) => return Err(self.malformed(err)),
        };
        let payload = pdu.slice(header_len..);
        if payload.is_empty() {
            return Err(self.malformed(RlcError::MalformedPdu("UMD PDU without payload".to_string())));
        }
        if header.si == SiField::FullSdu {
            self.deliver(payload);
            return Ok(());
        }

        let sn = header.sn;
        trace!("Rx UMD PDU SN={} SI={} SO={} payload={}", sn, header.si, header.so, payload.len());
        if self.rel(sn) < self.rel(self.rx_next_reassembly) {
            self.metrics.num_dropped_pdus += 1;
            debug!("SN={} below RX_Next_Reassembly={}", sn, self.rx_next_reassembly);
            return Err(RlcError::DuplicateOrOutOfWindow { sn });
        }
        if !self.inside_window(sn) {
            self.move_window(sn);
        }

        let record = self.rx_window.get_or_insert_with(sn, RxUmSdu::default);
        if record.delivered {
            self.metrics.num_dropped_pdus += 1;
            debug!("SN={} already delivered", sn);
            return Err(RlcError::DuplicateOrOutOfWindow { sn });
        }
        match record.reassembly.insert(u32::from(header.so), payload, header.si.is_last_byte()) {
            SegmentInsert::Accepted => {}
            SegmentInsert::Duplicate => {
                self.metrics.num_dropped_pdus += 1;
                debug!("Duplicate segment SN={} SO={}", sn, header.so);
                return Err(RlcError::DuplicateOrOutOfWindow { sn });
            }
            SegmentInsert::Inconsistent => {
                return Err(self.malformed(RlcError::MalformedPdu(format!(
                    "SN={} SO={} inconsistent with SDU length",
                    sn, header.so
                ))));
            }
        }

        if let Some(sdu) = record.reassembly.assemble() {
            record.delivered = true;
            record.reassembly = SduReassembly::default();
            self.deliver(sdu);
            if sn == self.rx_next_reassembly {
                self.advance_reassembly();
            }
        }
        self.update_reassembly_timer();
        Ok(())
    }

    fn tick(&mut self) {
        self.now_ms += 1;
        if self.reassembly_timer.expire(self.now_ms) {
            self.on_reassembly_expired();
        }
    }

    fn metrics(&self) -> RlcRxMetrics {
        self.metrics.clone()
    }
}
