//! AM Receiving Entity
//!
//! Reception, in-order delivery and status reporting of TS 38.322 §5.2.3.2
//! and §5.3.4. On t-Reassembly expiry, SNs below the trigger that are still
//! incomplete are declared lost so delivery can move on.

use super::config::{AmSnSize, RlcRxAmConfig};
use super::metrics::RlcRxMetrics;
use super::pdu::{AmdPduHeader, NackInfo, StatusPdu};
use super::reassembly::{SduReassembly, SegmentInsert};
use super::sn::SnSpace;
use super::sn_table::SnTable;
use super::timer::{RlcTimer, TimerKind};
use super::{RlcError, RlcRxEntity, RlcRxUpperLayerDataNotifier, RxState};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// AM receiving side of a bearer
pub struct RlcRxAmEntity {
    config: RlcRxAmConfig,
    sn_size: AmSnSize,
    sn: SnSpace,

    rx_window: SnTable<SduReassembly>,
    /// Earliest SN not yet delivered
    rx_next: u32,
    /// One above the highest SN received
    rx_next_highest: u32,
    /// RX_Next_Highest when t-Reassembly was started
    rx_next_status_trigger: u32,

    status_required: bool,
    reassembly_timer: RlcTimer,
    status_prohibit_timer: RlcTimer,
    now_ms: u64,

    upper_dn: Arc<dyn RlcRxUpperLayerDataNotifier>,
    metrics: RlcRxMetrics,
}

impl RlcRxAmEntity {
    pub fn new(config: RlcRxAmConfig, upper_dn: Arc<dyn RlcRxUpperLayerDataNotifier>) -> Self {
        let sn_size = config.sn_field_length;
        let sn = SnSpace::new(sn_size.bits());
        info!("Creating RLC Rx AM entity: {}", config);
        Self {
            sn_size,
            sn,
            rx_window: SnTable::new(sn.window_size() as usize),
            rx_next: 0,
            rx_next_highest: 0,
            rx_next_status_trigger: 0,
            status_required: false,
            reassembly_timer: RlcTimer::new(TimerKind::Reassembly, config.t_reassembly),
            status_prohibit_timer: RlcTimer::new(TimerKind::StatusProhibit, config.t_status_prohibit),
            now_ms: 0,
            upper_dn,
            metrics: RlcRxMetrics::default(),
            config,
        }
    }

    pub fn rx_next(&self) -> u32 {
        self.rx_next
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

    /// Whether a STATUS PDU should be sent now
    pub fn status_report_due(&self) -> bool {
        self.status_required && !self.status_prohibit_timer.is_running()
    }

    fn malformed(&mut self, err: RlcError) -> RlcError {
        self.metrics.num_malformed_pdus += 1;
        warn!("Discarding PDU: {}", err);
        err
    }

    /// A poll is honoured for every well-formed PDU, discarded or not
    fn on_poll(&mut self, p: bool, sn: u32) {
        if p {
            debug!("Status report requested by poll, SN={}", sn);
            self.status_required = true;
        }
    }

    fn rx_next_has_gap(&self) -> bool {
        self.rx_window
            .get(self.rx_next)
            .map_or(true, SduReassembly::has_gap_before_last_byte)
    }

    /// Deliver complete SDUs from RX_Next onwards
    fn deliver_in_order(&mut self) {
        while let Some(sdu) = self.rx_window.get(self.rx_next).and_then(SduReassembly::assemble) {
            self.rx_window.remove(self.rx_next);
            debug!("Delivering SN={} ({} bytes)", self.rx_next, sdu.len());
            self.metrics.add_sdu(sdu.len());
            self.upper_dn.on_new_sdu(sdu);
            self.rx_next = self.sn.next(self.rx_next);
        }
    }

    /// Start t-Reassembly when data beyond RX_Next is waiting
    fn start_reassembly_if_needed(&mut self) {
        let highest_rel = self.sn.rel(self.rx_next_highest, self.rx_next);
        if highest_rel > 1 || (highest_rel == 1 && self.rx_next_has_gap()) {
            self.rx_next_status_trigger = self.rx_next_highest;
            self.reassembly_timer.run(self.now_ms);
            trace!(
                "{} started, RX_Next_Status_Trigger={}",
                self.reassembly_timer.kind(),
                self.rx_next_status_trigger
            );
        }
    }

    fn update_reassembly_timer(&mut self) {
        if self.reassembly_timer.is_running() {
            let trigger = self.rx_next_status_trigger;
            let window_end = self.sn.add(self.rx_next, self.sn.window_size());
            let trigger_passed = trigger == self.rx_next
                || (trigger == self.sn.next(self.rx_next) && !self.rx_next_has_gap())
                || (!self.sn.inside_window(trigger, self.rx_next) && trigger != window_end);
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
        let trigger = self.rx_next_status_trigger;
        debug!(
            "{} expired: RX_Next={}, RX_Next_Status_Trigger={}, RX_Next_Highest={}",
            self.reassembly_timer.kind(),
            self.rx_next,
            trigger,
            self.rx_next_highest
        );
        while self.rx_next != trigger {
            match self.rx_window.remove(self.rx_next) {
                Some(record) => match record.assemble() {
                    Some(sdu) => {
                        self.metrics.add_sdu(sdu.len());
                        self.upper_dn.on_new_sdu(sdu);
                    }
                    None => {
                        warn!(
                            "SN={} lost, {} bytes received",
                            self.rx_next,
                            record.received_bytes()
                        );
                        self.metrics.num_lost_sdus += 1;
                    }
                },
                None => {
                    warn!("SN={} lost, nothing received", self.rx_next);
                    self.metrics.num_lost_sdus += 1;
                }
            }
            self.rx_next = self.sn.next(self.rx_next);
        }
        self.deliver_in_order();
        self.start_reassembly_if_needed();
        self.status_required = true;
    }

    /// STATUS PDU describing the current receive state
    pub fn build_status_report(&self) -> StatusPdu {
        let mut status = StatusPdu::new(self.rx_next_highest);
        let mut sn = self.rx_next;
        while sn != self.rx_next_highest {
            match self.rx_window.get(sn) {
                None => {
                    // Consecutive missing SDUs share one NACK range
                    let extends_last = status.nacks.last().map_or(false, |last| {
                        last.so_range.is_none()
                            && self.sn.add(last.nack_sn, last.range_len()) == sn
                            && last.range_len() < u32::from(u8::MAX)
                    });
                    match status.nacks.last_mut() {
                        Some(last) if extends_last => {
                            last.nack_range = Some(last.range_len() as u8 + 1);
                        }
                        _ => status.nacks.push(NackInfo::sdu(sn)),
                    }
                }
                Some(record) if record.is_complete() => {}
                Some(record) => {
                    for (start, end) in record.missing_ranges() {
                        let so_end = end.map_or(StatusPdu::SO_END_OF_SDU, |end| end as u16);
                        status.nacks.push(NackInfo::segment(sn, start as u16, so_end));
                    }
                }
            }
            sn = self.sn.next(sn);
        }
        status
    }

    /// Size of the STATUS PDU that would be sent now
    pub fn status_pdu_size(&self) -> usize {
        if self.status_report_due() {
            self.build_status_report().packed_size(self.sn_size)
        } else {
            0
        }
    }

    /// STATUS PDU trimmed to `max_bytes`, or `None` if even the fixed part does not fit
    pub fn build_status_pdu(&self, max_bytes: usize) -> Option<StatusPdu> {
        let mut status = self.build_status_report();
        status.trim(max_bytes, self.sn_size).then_some(status)
    }

    /// Build the STATUS PDU if one is due and fits `grant`
    pub fn pull_status_pdu(&mut self, grant: usize) -> Option<Bytes> {
        if !self.status_report_due() {
            return None;
        }
        let Some(status) = self.build_status_pdu(grant) else {
            trace!("Grant of {} bytes too small for a status PDU", grant);
            return None;
        };
        debug!(
            "Sending status PDU: ACK_SN={}, {} NACKs",
            status.ack_sn,
            status.nacks.len()
        );
        self.status_required = false;
        if self.config.t_status_prohibit > 0 {
            self.status_prohibit_timer.run(self.now_ms);
        }
        self.metrics.num_status_pdus += 1;
        Some(status.encode(self.sn_size))
    }
}

impl RlcRxEntity for RlcRxAmEntity {
    fn handle_pdu(&mut self, pdu: Bytes) -> Result<(), RlcError> {
        self.metrics.add_pdu(pdu.len());
        let (header, header_len) = match AmdPduHeader::decode(&pdu, self.sn_size) {
            Ok(decoded) => decoded,
            Err(err) => return Err(self.malformed(err)),
        };
        let payload = pdu.slice(header_len..);
        if payload.is_empty() {
            return Err(self.malformed(RlcError::MalformedPdu(format!("SN={} without payload", header.sn))));
        }
        trace!(
            "Rx AMD PDU SN={} SI={} SO={} p={} payload={}",
            header.sn,
            header.si,
            header.so,
            header.p,
            payload.len()
        );

        let sn = header.sn;
        if !self.sn.inside_window(sn, self.rx_next) {
            self.on_poll(header.p, sn);
            self.metrics.num_dropped_pdus += 1;
            debug!("SN={} outside of rx window [{}, +{})", sn, self.rx_next, self.sn.window_size());
            return Err(RlcError::DuplicateOrOutOfWindow { sn });
        }

        let record = self.rx_window.get_or_insert_with(sn, SduReassembly::default);
        match record.insert(u32::from(header.so), payload, header.si.is_last_byte()) {
            SegmentInsert::Accepted => self.on_poll(header.p, sn),
            SegmentInsert::Duplicate => {
                self.on_poll(header.p, sn);
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

        if !self.sn.lt(sn, self.rx_next_highest, self.rx_next) {
            self.rx_next_highest = self.sn.next(sn);
        }
        if sn == self.rx_next {
            self.deliver_in_order();
        }
        self.update_reassembly_timer();
        Ok(())
    }

    fn tick(&mut self) {
        self.now_ms += 1;
        if self.status_prohibit_timer.expire(self.now_ms) {
            trace!("{} expired", self.status_prohibit_timer.kind());
        }
        if self.reassembly_timer.expire(self.now_ms) {
            self.on_reassembly_expired();
        }
    }

    fn metrics(&self) -> RlcRxMetrics {
        self.metrics.clone()
    }
}
