//! SDU reassembly record
//!
//! Holds the byte segments received for one SN. Segments may overlap or
//! arrive in any order; assembly never emits a byte twice.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// Outcome of adding a segment to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentInsert {
    /// At least one new byte was stored
    Accepted,
    /// Every byte of the segment was already held
    Duplicate,
    /// The segment contradicts the SDU length learned from an earlier last segment
    Inconsistent,
}

/// Received segments of one SDU
#[derive(Debug, Default, Clone)]
pub struct SduReassembly {
    /// Segments keyed by segment offset
    segments: BTreeMap<u32, Bytes>,
    /// SDU length, known once the segment carrying the last byte arrived
    sdu_len: Option<u32>,
}

impl SduReassembly {
    /// Add the segment `[so, so + payload.len())`
    pub fn insert(&mut self, so: u32, payload: Bytes, last_byte: bool) -> SegmentInsert {
        let end = so + payload.len() as u32;
        match self.sdu_len {
            Some(len) if end > len || (last_byte && end != len) => return SegmentInsert::Inconsistent,
            None if last_byte && self.received_end() > end => return SegmentInsert::Inconsistent,
            _ => {}
        }
        if self.covers(so, end) {
            return SegmentInsert::Duplicate;
        }
        if last_byte {
            self.sdu_len = Some(end);
        }
        // A shorter segment stored at the same offset is covered by the new one
        self.segments.insert(so, payload);
        SegmentInsert::Accepted
    }

    /// Whether every byte of the SDU has been received
    pub fn is_complete(&self) -> bool {
        match self.sdu_len {
            Some(len) => {
                let covered = self.coverage();
                covered.len() == 1 && covered[0] == (0, len)
            }
            None => false,
        }
    }

    /// Whether a byte is missing before the last received byte
    pub fn has_gap_before_last_byte(&self) -> bool {
        let covered = self.coverage();
        covered.len() > 1 || covered.first().map_or(false, |(start, _)| *start > 0)
    }

    /// Missing byte ranges as inclusive `(start, end)`; `None` end runs to the SDU end
    pub fn missing_ranges(&self) -> Vec<(u32, Option<u32>)> {
        let mut missing = Vec::new();
        let mut next = 0;
        for (start, end) in self.coverage() {
            if start > next {
                missing.push((next, Some(start - 1)));
            }
            next = end;
        }
        match self.sdu_len {
            Some(len) if next < len => missing.push((next, Some(len - 1))),
            Some(_) => {}
            None => missing.push((next, None)),
        }
        missing
    }

    /// Number of bytes currently held
    pub fn received_bytes(&self) -> usize {
        self.coverage().iter().map(|(start, end)| (end - start) as usize).sum()
    }

    /// Concatenate the SDU once complete
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut sdu = BytesMut::with_capacity(self.sdu_len.unwrap_or_default() as usize);
        let mut end = 0u32;
        for (&so, data) in &self.segments {
            let seg_end = so + data.len() as u32;
            if seg_end <= end {
                continue;
            }
            sdu.extend_from_slice(&data[(end - so) as usize..]);
            end = seg_end;
        }
        Some(sdu.freeze())
    }

    fn received_end(&self) -> u32 {
        self.segments
            .iter()
            .map(|(so, data)| so + data.len() as u32)
            .max()
            .unwrap_or(0)
    }

    /// Merged half-open byte intervals held by this record
    fn coverage(&self) -> Vec<(u32, u32)> {
        let mut merged: Vec<(u32, u32)> = Vec::new();
        for (&so, data) in &self.segments {
            let end = so + data.len() as u32;
            match merged.last_mut() {
                Some(last) if so <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((so, end)),
            }
        }
        merged
    }

    fn covers(&self, start: u32, end: u32) -> bool {
        self.coverage().iter().any(|(s, e)| *s <= start && end <= *e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    #[test]
    fn test_in_order_segments() {
        let mut sdu = SduReassembly::default();
        assert_eq!(sdu.insert(0, seg(b"hel"), false), SegmentInsert::Accepted);
        assert!(!sdu.is_complete());
        assert!(!sdu.has_gap_before_last_byte());
        assert_eq!(sdu.insert(3, seg(b"lo"), true), SegmentInsert::Accepted);
        assert!(sdu.is_complete());
        assert_eq!(sdu.assemble().unwrap(), seg(b"hello"));
    }

    #[test]
    fn test_reverse_order_and_gaps() {
        let mut sdu = SduReassembly::default();
        sdu.insert(6, seg(b"world"), true);
        assert!(sdu.has_gap_before_last_byte());
        assert_eq!(sdu.missing_ranges(), vec![(0, Some(5))]);

        sdu.insert(0, seg(b"he"), false);
        assert_eq!(sdu.missing_ranges(), vec![(2, Some(5))]);
        assert!(sdu.assemble().is_none());

        sdu.insert(2, seg(b"llo "), false);
        assert_eq!(sdu.assemble().unwrap(), seg(b"hello world"));
        assert_eq!(sdu.received_bytes(), 11);
    }

    #[test]
    fn test_duplicates_and_overlaps() {
        let mut sdu = SduReassembly::default();
        sdu.insert(0, seg(b"abcd"), false);
        assert_eq!(sdu.insert(0, seg(b"abcd"), false), SegmentInsert::Duplicate);
        assert_eq!(sdu.insert(1, seg(b"bc"), false), SegmentInsert::Duplicate);

        // Overlapping retransmission carrying two new bytes
        assert_eq!(sdu.insert(2, seg(b"cdef"), true), SegmentInsert::Accepted);
        assert_eq!(sdu.assemble().unwrap(), seg(b"abcdef"));
    }

    #[test]
    fn test_open_ended_missing_range() {
        let mut sdu = SduReassembly::default();
        sdu.insert(0, seg(b"ab"), false);
        sdu.insert(4, seg(b"ef"), false);
        assert_eq!(sdu.missing_ranges(), vec![(2, Some(3)), (6, None)]);
    }

    #[test]
    fn test_inconsistent_length() {
        let mut sdu = SduReassembly::default();
        sdu.insert(0, seg(b"abc"), true);
        assert_eq!(sdu.insert(2, seg(b"cdef"), false), SegmentInsert::Inconsistent);
        assert_eq!(sdu.insert(0, seg(b"ab"), true), SegmentInsert::Inconsistent);
    }
}
