//! AM Transmitting Entity
//!
//! Segmentation, ARQ and polling of TS 38.322 §5.2.3.1 and §5.3.3.
//! SDUs get an SN when their first byte is sent and stay in the
//! transmission window until the peer acknowledges them.

use super::config::{AmSnSize, RlcTxAmConfig};
use super::metrics::RlcTxMetrics;
use super::pdu::{AmdPduHeader, SiField, StatusPdu};
use super::sn::SnSpace;
use super::sn_table::SnTable;
use super::timer::{RlcTimer, TimerKind};
use super::{
    check_queue_limit, check_sdu, RlcError, RlcTxEntity, RlcTxLowerLayerNotifier,
    RlcTxUpperLayerControlNotifier, RlcTxUpperLayerDataNotifier,
};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Observable state of the transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAmState {
    /// Nothing queued and nothing awaiting acknowledgement
    Idle,
    /// Data pending or awaiting acknowledgement
    Transmitting,
    /// A poll is outstanding (t-PollRetransmit running)
    Polling,
    /// The transmission window is full
    Stalled,
}

impl fmt::Display for TxAmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// SDU held in the transmission window
#[derive(Debug, Clone)]
struct TxSduInfo {
    sdu: Bytes,
    /// Number of times the SDU was considered for retransmission
    retx_count: u32,
}

/// Byte range of an SDU waiting for retransmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RetxInfo {
    sn: u32,
    so: u32,
    length: u32,
}

/// AM transmitting side of a bearer
pub struct RlcTxAmEntity {
    config: RlcTxAmConfig,
    sn_size: AmSnSize,
    sn: SnSpace,

    sdu_queue: VecDeque<Bytes>,
    sdu_queue_bytes: usize,
    /// SN and next segment offset of the SDU under segmentation
    segmentation: Option<(u32, u32)>,

    tx_window: SnTable<TxSduInfo>,
    retx_queue: VecDeque<RetxInfo>,

    /// Earliest SN awaiting a positive acknowledgement
    tx_next_ack: u32,
    /// SN assigned to the next new SDU
    tx_next: u32,
    /// Highest SN sent when the last poll was set
    poll_sn: u32,
    pdu_without_poll: u32,
    byte_without_poll: u32,
    force_poll: bool,
    max_retx_reached: bool,

    poll_retx_timer: RlcTimer,
    now_ms: u64,

    upper_dn: Arc<dyn RlcTxUpperLayerDataNotifier>,
    upper_cn: Arc<dyn RlcTxUpperLayerControlNotifier>,
    lower_dn: Arc<dyn RlcTxLowerLayerNotifier>,
    last_buffer_state: usize,
    metrics: RlcTxMetrics,
}

impl RlcTxAmEntity {
    pub fn new(
        config: RlcTxAmConfig,
        upper_dn: Arc<dyn RlcTxUpperLayerDataNotifier>,
        upper_cn: Arc<dyn RlcTxUpperLayerControlNotifier>,
        lower_dn: Arc<dyn RlcTxLowerLayerNotifier>,
    ) -> Self {
        let sn_size = config.sn_field_length;
        let sn = SnSpace::new(sn_size.bits());
        info!("Creating RLC Tx AM entity: {}", config);
        Self {
            sn_size,
            sn,
            sdu_queue: VecDeque::new(),
            sdu_queue_bytes: 0,
            segmentation: None,
            tx_window: SnTable::new(sn.window_size() as usize),
            retx_queue: VecDeque::new(),
            tx_next_ack: 0,
            tx_next: 0,
            poll_sn: 0,
            pdu_without_poll: 0,
            byte_without_poll: 0,
            force_poll: false,
            max_retx_reached: false,
            poll_retx_timer: RlcTimer::new(TimerKind::PollRetransmit, config.t_poll_retx),
            now_ms: 0,
            upper_dn,
            upper_cn,
            lower_dn,
            last_buffer_state: 0,
            metrics: RlcTxMetrics::default(),
            config,
        }
    }

    pub fn tx_next(&self) -> u32 {
        self.tx_next
    }

    pub fn tx_next_ack(&self) -> u32 {
        self.tx_next_ack
    }

    pub fn poll_sn(&self) -> u32 {
        self.poll_sn
    }

    pub fn state(&self) -> TxAmState {
        if self.window_full() {
            TxAmState::Stalled
        } else if self.poll_retx_timer.is_running() {
            TxAmState::Polling
        } else if self.tx_window.is_empty() && self.sdu_queue.is_empty() {
            TxAmState::Idle
        } else {
            TxAmState::Transmitting
        }
    }

    fn window_full(&self) -> bool {
        self.sn.distance(self.tx_next_ack, self.tx_next) >= self.sn.window_size()
    }

    fn buffers_empty(&self) -> bool {
        self.sdu_queue.is_empty() && self.segmentation.is_none() && self.retx_queue.is_empty()
    }

    fn header_size(&self, so: u32) -> usize {
        let si = if so == 0 { SiField::FullSdu } else { SiField::MiddleSegment };
        AmdPduHeader::packed_size(self.sn_size, si)
    }

    /// Handle a STATUS PDU from the peer receiver
    ///
    /// t-PollRetransmit is stopped once nothing is outstanding and
    /// restarted while SDUs still await acknowledgement.
    pub fn handle_status_report(&mut self, status: StatusPdu) -> Result<(), RlcError> {
        self.metrics.num_status_pdus += 1;
        let base = self.tx_next_ack;
        let ack_rel = self.sn.rel(status.ack_sn, base);
        if ack_rel > self.sn.rel(self.tx_next, base) {
            let err = RlcError::InvalidStatusPdu(format!(
                "ACK_SN={} outside [TX_Next_Ack={}, TX_Next={}]",
                status.ack_sn, self.tx_next_ack, self.tx_next
            ));
            warn!("{}", err);
            self.upper_cn.on_protocol_failure(err.clone());
            return Err(err);
        }

        let mut nacked = BTreeSet::new();
        for nack in &status.nacks {
            if nack.nack_range == Some(0) {
                let err = RlcError::InvalidStatusPdu(format!("NACK_SN={} with NACK range of zero", nack.nack_sn));
                warn!("{}", err);
                self.upper_cn.on_protocol_failure(err.clone());
                return Err(err);
            }
            let last = self.sn.add(nack.nack_sn, nack.range_len() - 1);
            if self.sn.rel(nack.nack_sn, base) >= ack_rel || self.sn.rel(last, base) >= ack_rel {
                let err = RlcError::InvalidStatusPdu(format!(
                    "NACK_SN={} range={} not below ACK_SN={}",
                    nack.nack_sn,
                    nack.range_len(),
                    status.ack_sn
                ));
                warn!("{}", err);
                self.upper_cn.on_protocol_failure(err.clone());
                return Err(err);
            }
            for i in 0..nack.range_len() {
                nacked.insert(self.sn.add(nack.nack_sn, i));
            }
        }
        debug!(
            "Handling status PDU: ACK_SN={}, {} NACKs, TX_Next_Ack={}, TX_Next={}",
            status.ack_sn,
            status.nacks.len(),
            self.tx_next_ack,
            self.tx_next
        );

        let mut sn = base;
        while sn != status.ack_sn {
            if !nacked.contains(&sn) && self.tx_window.remove(sn).is_some() {
                trace!("SN={} acknowledged", sn);
                if matches!(self.segmentation, Some((seg_sn, _)) if seg_sn == sn) {
                    warn!("SN={} acknowledged while under segmentation", sn);
                    self.segmentation = None;
                }
                self.upper_dn.on_delivered_sdu(sn);
            }
            sn = self.sn.next(sn);
        }

        for nack in &status.nacks {
            let count = nack.range_len();
            for i in 0..count {
                let nack_sn = self.sn.add(nack.nack_sn, i);
                let (so_start, so_end) = match nack.so_range {
                    Some((start, end)) => (
                        if i == 0 { start } else { 0 },
                        if i + 1 == count { end } else { StatusPdu::SO_END_OF_SDU },
                    ),
                    None => (0, StatusPdu::SO_END_OF_SDU),
                };
                self.queue_nacked(nack_sn, u32::from(so_start), so_end);
            }
        }

        let tx_window = &self.tx_window;
        self.retx_queue.retain(|retx| tx_window.contains(retx.sn));
        while self.tx_next_ack != self.tx_next && !self.tx_window.contains(self.tx_next_ack) {
            self.tx_next_ack = self.sn.next(self.tx_next_ack);
        }

        if self.tx_window.is_empty() {
            self.poll_retx_timer.stop();
        } else {
            self.poll_retx_timer.run(self.now_ms);
        }
        debug!(
            "Status handled: TX_Next_Ack={}, {} SDUs outstanding, {} pending retx",
            self.tx_next_ack,
            self.tx_window.len(),
            self.retx_queue.len()
        );
        self.report_buffer_state();
        Ok(())
    }

    /// Queue the NACKed bytes `[so_start, so_end]` of `sn` for retransmission
    fn queue_nacked(&mut self, sn: u32, so_start: u32, so_end: u16) {
        let Some(info) = self.tx_window.get(sn) else {
            debug!("NACK for SN={} which is not in the window", sn);
            return;
        };
        let sdu_len = info.sdu.len() as u32;
        let mut end = if so_end == StatusPdu::SO_END_OF_SDU {
            sdu_len
        } else {
            (u32::from(so_end) + 1).min(sdu_len)
        };
        if let Some((seg_sn, next_so)) = self.segmentation {
            if seg_sn == sn {
                end = end.min(next_so);
            }
        }
        if so_start >= end {
            debug!("Ignoring NACK for SN={} with empty range {}..{}", sn, so_start, end);
            return;
        }
        self.queue_retx(RetxInfo {
            sn,
            so: so_start,
            length: end - so_start,
        });
    }

    fn queue_retx(&mut self, retx: RetxInfo) {
        let covered = self.retx_queue.iter().any(|pending| {
            pending.sn == retx.sn && pending.so <= retx.so && retx.so + retx.length <= pending.so + pending.length
        });
        if covered {
            trace!("SN={} SO={} already pending retransmission", retx.sn, retx.so);
            return;
        }
        let already_pending = self.retx_queue.iter().any(|pending| pending.sn == retx.sn);
        self.retx_queue.push_back(retx);
        if already_pending {
            return;
        }

        let Some(info) = self.tx_window.get_mut(retx.sn) else {
            return;
        };
        info.retx_count += 1;
        debug!(
            "Queued SN={} SO={} len={} for retransmission, retx_count={}",
            retx.sn, retx.so, retx.length, info.retx_count
        );
        if info.retx_count >= self.config.max_retx_thresh && !self.max_retx_reached {
            self.max_retx_reached = true;
            warn!(
                "SN={} reached max_retx_thresh={}",
                retx.sn, self.config.max_retx_thresh
            );
            self.upper_cn.on_max_retx();
        }
    }

    fn on_poll_retx_expired(&mut self) {
        debug!(
            "{} expired: TX_Next_Ack={}, TX_Next={}, POLL_SN={}",
            self.poll_retx_timer.kind(),
            self.tx_next_ack,
            self.tx_next,
            self.poll_sn
        );
        let mut sn = self.tx_next_ack;
        while sn != self.tx_next {
            let pending = self.retx_queue.iter().any(|retx| retx.sn == sn);
            if !pending {
                let sent = match (self.segmentation, self.tx_window.get(sn)) {
                    (_, None) => 0,
                    (Some((seg_sn, next_so)), Some(_)) if seg_sn == sn => next_so,
                    (_, Some(info)) => info.sdu.len() as u32,
                };
                if sent > 0 {
                    self.queue_retx(RetxInfo { sn, so: 0, length: sent });
                }
            }
            sn = self.sn.next(sn);
        }
        self.force_poll = true;
        self.report_buffer_state();
    }

    /// Decide on the poll bit for the PDU being built
    fn poll_required(&mut self, new_bytes: Option<usize>) -> bool {
        if let Some(bytes) = new_bytes {
            self.pdu_without_poll += 1;
            self.byte_without_poll += bytes as u32;
        }
        let poll = self.force_poll
            || self.config.poll_pdu.map_or(false, |n| self.pdu_without_poll >= n)
            || self.config.poll_byte.map_or(false, |n| self.byte_without_poll >= n)
            || self.buffers_empty()
            || self.window_full();
        if poll {
            self.pdu_without_poll = 0;
            self.byte_without_poll = 0;
            self.force_poll = false;
            self.poll_sn = self.sn.sub(self.tx_next, 1);
            if !self.poll_retx_timer.is_running() {
                self.poll_retx_timer.run(self.now_ms);
            }
            trace!("Poll set, POLL_SN={}", self.poll_sn);
        }
        poll
    }

    fn build_pdu(&self, header: AmdPduHeader, payload: &[u8]) -> Bytes {
        let mut pdu = BytesMut::with_capacity(self.header_size(header.so as u32) + payload.len());
        header.write(self.sn_size, &mut pdu);
        pdu.extend_from_slice(payload);
        pdu.freeze()
    }

    fn build_retx_pdu(&mut self, grant: usize) -> Option<Bytes> {
        let retx = *self.retx_queue.front()?;
        let sdu = self.tx_window.get(retx.sn)?.sdu.clone();
        let header_size = self.header_size(retx.so);
        if grant <= header_size {
            trace!("Grant of {} bytes too small for retransmission of SN={}", grant, retx.sn);
            return None;
        }
        let length = retx.length.min((grant - header_size) as u32);
        let end = retx.so + length;
        if length == retx.length {
            self.retx_queue.pop_front();
        } else if let Some(front) = self.retx_queue.front_mut() {
            front.so = end;
            front.length -= length;
        }

        let si = SiField::from_bounds(retx.so == 0, end as usize == sdu.len());
        let p = self.poll_required(None);
        let header = AmdPduHeader {
            p,
            si,
            sn: retx.sn,
            so: retx.so as u16,
        };
        let pdu = self.build_pdu(header, &sdu[retx.so as usize..end as usize]);
        debug!(
            "Retransmitting SN={} SI={} SO={} payload={} p={}",
            retx.sn, si, retx.so, length, p
        );
        self.metrics.add_retx_pdu(pdu.len());
        Some(pdu)
    }

    fn build_continued_pdu(&mut self, grant: usize) -> Option<Bytes> {
        let (sn, so) = self.segmentation?;
        let Some(info) = self.tx_window.get(sn) else {
            self.segmentation = None;
            return None;
        };
        let sdu = info.sdu.clone();
        let header_size = self.header_size(so);
        if grant <= header_size {
            trace!("Grant of {} bytes too small for next segment of SN={}", grant, sn);
            return None;
        }
        let remaining = sdu.len() - so as usize;
        let length = remaining.min(grant - header_size);
        let last = length == remaining;
        self.segmentation = if last { None } else { Some((sn, so + length as u32)) };

        let si = if last { SiField::LastSegment } else { SiField::MiddleSegment };
        let p = self.poll_required(Some(length));
        let header = AmdPduHeader {
            p,
            si,
            sn,
            so: so as u16,
        };
        let pdu = self.build_pdu(header, &sdu[so as usize..so as usize + length]);
        debug!("Sending SN={} SI={} SO={} payload={} p={}", sn, si, so, length, p);
        if last {
            self.upper_dn.on_transmitted_sdu(sn);
        }
        self.metrics.add_pdu(pdu.len());
        Some(pdu)
    }

    fn build_new_pdu(&mut self, grant: usize) -> Option<Bytes> {
        if self.sdu_queue.is_empty() {
            return None;
        }
        if self.window_full() {
            debug!(
                "Tx window full: TX_Next_Ack={}, TX_Next={}",
                self.tx_next_ack, self.tx_next
            );
            return None;
        }
        let header_size = self.header_size(0);
        if grant <= header_size {
            trace!("Grant of {} bytes too small for a new PDU", grant);
            return None;
        }
        let sdu = self.sdu_queue.pop_front()?;
        self.sdu_queue_bytes -= sdu.len();

        let sn = self.tx_next;
        self.tx_next = self.sn.next(sn);
        self.tx_window.insert(
            sn,
            TxSduInfo {
                sdu: sdu.clone(),
                retx_count: 0,
            },
        );

        let length = sdu.len().min(grant - header_size);
        let full = length == sdu.len();
        if !full {
            self.segmentation = Some((sn, length as u32));
        }
        let si = if full { SiField::FullSdu } else { SiField::FirstSegment };
        let p = self.poll_required(Some(length));
        let header = AmdPduHeader { p, si, sn, so: 0 };
        let pdu = self.build_pdu(header, &sdu[..length]);
        debug!("Sending SN={} SI={} payload={} p={}", sn, si, length, p);
        if full {
            self.upper_dn.on_transmitted_sdu(sn);
        }
        self.metrics.add_pdu(pdu.len());
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

impl RlcTxEntity for RlcTxAmEntity {
    fn submit_sdu(&mut self, sdu: Bytes) -> Result<(), RlcError> {
        if let Err(err) = check_sdu(&sdu)
            .and_then(|_| check_queue_limit(self.sdu_queue_bytes, sdu.len(), self.config.queue_limit_bytes))
        {
            self.metrics.num_dropped_sdus += 1;
            warn!("Dropping SDU: {}", err);
            return Err(err);
        }
        debug!("Queued SDU of {} bytes ({} SDUs queued)", sdu.len(), self.sdu_queue.len() + 1);
        self.metrics.add_sdu(sdu.len());
        self.sdu_queue_bytes += sdu.len();
        self.sdu_queue.push_back(sdu);
        self.report_buffer_state();
        Ok(())
    }

    fn pull_pdu(&mut self, grant: usize) -> Option<Bytes> {
        let pdu = if !self.retx_queue.is_empty() {
            self.build_retx_pdu(grant)
        } else if self.segmentation.is_some() {
            self.build_continued_pdu(grant)
        } else {
            self.build_new_pdu(grant)
        };
        if pdu.is_some() {
            self.report_buffer_state();
        }
        pdu
    }

    fn buffer_state(&self) -> usize {
        let queued = self.sdu_queue_bytes + self.sdu_queue.len() * self.header_size(0);
        let segmenting = match self.segmentation {
            Some((sn, so)) => self
                .tx_window
                .get(sn)
                .map_or(0, |info| info.sdu.len() - so as usize + self.header_size(so)),
            None => 0,
        };
        let retx: usize = self
            .retx_queue
            .iter()
            .map(|retx| retx.length as usize + self.header_size(retx.so))
            .sum();
        queued + segmenting + retx
    }

    fn tick(&mut self) {
        self.now_ms += 1;
        if self.poll_retx_timer.expire(self.now_ms) {
            self.on_poll_retx_expired();
        }
    }

    fn metrics(&self) -> RlcTxMetrics {
        self.metrics.clone()
    }
}
