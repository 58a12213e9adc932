//! RLC PDU Formats
//!
//! Encoding and decoding of UMD/AMD data PDU headers and the AM STATUS
//! control PDU according to 3GPP TS 38.322 §6.2. Decoding is done with
//! `nom` bit parsers; encoding writes MSB-first bit fields.

use super::config::{AmSnSize, UmSnSize};
use super::RlcError;
use bytes::{BufMut, Bytes, BytesMut};
use common::utils::BitWriter;
use nom::bits::complete::take;
use nom::IResult;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::fmt;

/// Bit-level parser input: remaining bytes and bit offset into the first one
type BitInput<'a> = (&'a [u8], usize);

/// Read an unsigned field of `width` bits
fn field(input: BitInput<'_>, width: usize) -> IResult<BitInput<'_>, u32> {
    take(width)(input)
}

/// Read a single flag bit
fn flag(input: BitInput<'_>) -> IResult<BitInput<'_>, bool> {
    let (input, bit) = field(input, 1)?;
    Ok((input, bit == 1))
}

/// Number of bytes consumed by a byte-aligned bit parser
fn consumed(pdu: &[u8], rest: BitInput<'_>) -> usize {
    pdu.len() - rest.0.len()
}

fn truncated(what: &str) -> RlcError {
    RlcError::MalformedPdu(format!("truncated {}", what))
}

/// Data/Control field
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum DcField {
    /// Control PDU
    Control = 0b0,
    /// Data PDU
    Data = 0b1,
}

impl DcField {
    /// Read the D/C flag from the first byte of an AM PDU
    pub fn of(pdu: &[u8]) -> Option<Self> {
        pdu.first().map(|b| if b & 0x80 != 0 { DcField::Data } else { DcField::Control })
    }
}

/// Segmentation Info field
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SiField {
    /// Data field contains all bytes of an SDU
    FullSdu = 0b00,
    /// Data field contains the first segment of an SDU
    FirstSegment = 0b01,
    /// Data field contains the last segment of an SDU
    LastSegment = 0b10,
    /// Data field contains neither the first nor the last segment
    MiddleSegment = 0b11,
}

impl SiField {
    /// SI for a segment given whether it holds the first and last byte
    pub fn from_bounds(first_byte: bool, last_byte: bool) -> Self {
        match (first_byte, last_byte) {
            (true, true) => SiField::FullSdu,
            (true, false) => SiField::FirstSegment,
            (false, true) => SiField::LastSegment,
            (false, false) => SiField::MiddleSegment,
        }
    }

    /// Whether the header carries a segment offset
    pub fn has_so(&self) -> bool {
        matches!(self, SiField::LastSegment | SiField::MiddleSegment)
    }

    /// Whether the data field ends with the last byte of the SDU
    pub fn is_last_byte(&self) -> bool {
        matches!(self, SiField::FullSdu | SiField::LastSegment)
    }

    fn from_bits(bits: u32) -> Result<Self, RlcError> {
        Self::from_u32(bits).ok_or_else(|| RlcError::MalformedPdu(format!("invalid SI field {:#b}", bits)))
    }
}

impl fmt::Display for SiField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SiField::FullSdu => "full",
            SiField::FirstSegment => "first",
            SiField::LastSegment => "last",
            SiField::MiddleSegment => "middle",
        };
        write!(f, "{}", name)
    }
}

/// Control PDU Type field
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ControlPduType {
    /// STATUS PDU
    StatusPdu = 0b000,
}

/// UMD PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmdPduHeader {
    /// Segmentation info
    pub si: SiField,
    /// Sequence number (absent for full SDUs)
    pub sn: u32,
    /// Segment offset (middle and last segments only)
    pub so: u16,
}

impl UmdPduHeader {
    /// Header length in bytes for the given SN size and SI
    pub fn packed_size(sn_size: UmSnSize, si: SiField) -> usize {
        let base = match (si, sn_size) {
            (SiField::FullSdu, _) => return 1,
            (_, UmSnSize::Size6Bits) => 1,
            (_, UmSnSize::Size12Bits) => 2,
        };
        if si.has_so() {
            base + 2
        } else {
            base
        }
    }

    /// Append the header to `buf`
    pub fn write(&self, sn_size: UmSnSize, buf: &mut BytesMut) {
        let mut bits = BitWriter::new();
        bits.put(self.si as u32, 2);
        if self.si != SiField::FullSdu {
            if sn_size == UmSnSize::Size12Bits {
                bits.put(0, 2);
            }
            bits.put(self.sn, sn_size.bits() as usize);
        } else {
            bits.put(0, 6);
        }
        if self.si.has_so() {
            bits.put(self.so as u32, 16);
        }
        debug_assert!(bits.is_aligned());
        buf.put(bits.finish());
    }

    /// Decode the header, returning it with its length in bytes
    pub fn decode(pdu: &[u8], sn_size: UmSnSize) -> Result<(Self, usize), RlcError> {
        let (rest, (si, sn, so)) =
            parse_umd_header((pdu, 0), sn_size).map_err(|_| truncated("UMD header"))?;
        let si = SiField::from_bits(si)?;
        check_segment_offset(si, so)?;
        let header = Self {
            si,
            sn,
            so: so as u16,
        };
        Ok((header, consumed(pdu, rest)))
    }
}

fn parse_umd_header(input: BitInput<'_>, sn_size: UmSnSize) -> IResult<BitInput<'_>, (u32, u32, u32)> {
    let (input, si) = field(input, 2)?;
    if si == SiField::FullSdu as u32 {
        let (input, _reserved) = field(input, 6)?;
        return Ok((input, (si, 0, 0)));
    }
    let input = match sn_size {
        UmSnSize::Size6Bits => input,
        UmSnSize::Size12Bits => field(input, 2)?.0,
    };
    let (input, sn) = field(input, sn_size.bits() as usize)?;
    let (input, so) = if si & 0b10 != 0 { field(input, 16)? } else { (input, 0) };
    Ok((input, (si, sn, so)))
}

/// Middle and last segments never start at offset zero
fn check_segment_offset(si: SiField, so: u32) -> Result<(), RlcError> {
    if si.has_so() && so == 0 {
        return Err(RlcError::MalformedPdu(format!("{} segment with SO=0", si)));
    }
    Ok(())
}

/// AMD PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmdPduHeader {
    /// Poll bit
    pub p: bool,
    /// Segmentation info
    pub si: SiField,
    /// Sequence number
    pub sn: u32,
    /// Segment offset (middle and last segments only)
    pub so: u16,
}

impl AmdPduHeader {
    /// Header length in bytes for the given SN size and SI
    pub fn packed_size(sn_size: AmSnSize, si: SiField) -> usize {
        let base = match sn_size {
            AmSnSize::Size12Bits => 2,
            AmSnSize::Size18Bits => 3,
        };
        if si.has_so() {
            base + 2
        } else {
            base
        }
    }

    /// Append the header to `buf`
    pub fn write(&self, sn_size: AmSnSize, buf: &mut BytesMut) {
        let mut bits = BitWriter::new();
        bits.put(DcField::Data as u32, 1);
        bits.put_flag(self.p);
        bits.put(self.si as u32, 2);
        if sn_size == AmSnSize::Size18Bits {
            bits.put(0, 2);
        }
        bits.put(self.sn, sn_size.bits() as usize);
        if self.si.has_so() {
            bits.put(self.so as u32, 16);
        }
        debug_assert!(bits.is_aligned());
        buf.put(bits.finish());
    }

    /// Decode the header, returning it with its length in bytes
    pub fn decode(pdu: &[u8], sn_size: AmSnSize) -> Result<(Self, usize), RlcError> {
        let (rest, (dc, p, si, sn, so)) =
            parse_amd_header((pdu, 0), sn_size).map_err(|_| truncated("AMD header"))?;
        if dc != DcField::Data as u32 {
            return Err(RlcError::MalformedPdu("control PDU on the data path".to_string()));
        }
        let si = SiField::from_bits(si)?;
        check_segment_offset(si, so)?;
        let header = Self {
            p,
            si,
            sn,
            so: so as u16,
        };
        Ok((header, consumed(pdu, rest)))
    }
}

type RawAmdHeader = (u32, bool, u32, u32, u32);

fn parse_amd_header(input: BitInput<'_>, sn_size: AmSnSize) -> IResult<BitInput<'_>, RawAmdHeader> {
    let (input, dc) = field(input, 1)?;
    let (input, p) = flag(input)?;
    let (input, si) = field(input, 2)?;
    let input = match sn_size {
        AmSnSize::Size12Bits => input,
        AmSnSize::Size18Bits => field(input, 2)?.0,
    };
    let (input, sn) = field(input, sn_size.bits() as usize)?;
    let (input, so) = if si & 0b10 != 0 { field(input, 16)? } else { (input, 0) };
    Ok((input, (dc, p, si, sn, so)))
}

/// One NACK entry of a STATUS PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackInfo {
    /// SN of the first missing SDU
    pub nack_sn: u32,
    /// Missing byte range (SOstart, SOend); SOend = 0xFFFF runs to the end of the SDU
    pub so_range: Option<(u16, u16)>,
    /// Number of consecutive missing SDUs starting at `nack_sn`
    pub nack_range: Option<u8>,
}

impl NackInfo {
    /// NACK for a whole SDU
    pub fn sdu(nack_sn: u32) -> Self {
        Self {
            nack_sn,
            so_range: None,
            nack_range: None,
        }
    }

    /// NACK for a byte range of an SDU
    pub fn segment(nack_sn: u32, so_start: u16, so_end: u16) -> Self {
        Self {
            nack_sn,
            so_range: Some((so_start, so_end)),
            nack_range: None,
        }
    }

    /// Number of SNs covered by this entry
    pub fn range_len(&self) -> u32 {
        self.nack_range.map_or(1, u32::from)
    }

    /// Packed length of this entry in bytes
    pub fn packed_size(&self, sn_size: AmSnSize) -> usize {
        let mut size = match sn_size {
            AmSnSize::Size12Bits => 2,
            AmSnSize::Size18Bits => 3,
        };
        if self.so_range.is_some() {
            size += 4;
        }
        if self.nack_range.is_some() {
            size += 1;
        }
        size
    }
}

/// STATUS PDU (TS 38.322 §6.2.2.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPdu {
    /// Next SN not reported as received, and not NACKed
    pub ack_sn: u32,
    /// Missing SDUs and segments, in increasing SN order
    pub nacks: Vec<NackInfo>,
}

impl StatusPdu {
    /// SOend value meaning "up to the last byte of the SDU"
    pub const SO_END_OF_SDU: u16 = 0xFFFF;
    /// Fixed part: D/C, CPT, ACK_SN, E1 and padding
    pub const HEADER_SIZE: usize = 3;

    /// STATUS PDU acknowledging everything below `ack_sn`
    pub fn new(ack_sn: u32) -> Self {
        Self {
            ack_sn,
            nacks: Vec::new(),
        }
    }

    /// Packed length in bytes
    pub fn packed_size(&self, sn_size: AmSnSize) -> usize {
        Self::HEADER_SIZE + self.nacks.iter().map(|n| n.packed_size(sn_size)).sum::<usize>()
    }

    /// Drop trailing NACKs until the PDU fits `max_bytes`
    ///
    /// ACK_SN is moved down to the first dropped NACK_SN so that nothing
    /// above it is implicitly acknowledged. Segment NACKs left with the
    /// same SN as the new ACK_SN are dropped too, since every NACK_SN must
    /// stay below ACK_SN. Returns false when even the fixed part does not fit.
    pub fn trim(&mut self, max_bytes: usize, sn_size: AmSnSize) -> bool {
        if max_bytes < Self::HEADER_SIZE {
            return false;
        }
        while self.packed_size(sn_size) > max_bytes
            || self.nacks.last().map_or(false, |nack| nack.nack_sn == self.ack_sn)
        {
            match self.nacks.pop() {
                Some(nack) => self.ack_sn = nack.nack_sn,
                None => break,
            }
        }
        true
    }

    /// Encode the PDU
    pub fn encode(&self, sn_size: AmSnSize) -> Bytes {
        let sn_bits = sn_size.bits() as usize;
        let mut bits = BitWriter::new();
        bits.put(DcField::Control as u32, 1);
        bits.put(ControlPduType::StatusPdu as u32, 3);
        bits.put(self.ack_sn, sn_bits);
        bits.put_flag(!self.nacks.is_empty());
        bits.put(0, if sn_size == AmSnSize::Size12Bits { 7 } else { 1 });

        for (i, nack) in self.nacks.iter().enumerate() {
            bits.put(nack.nack_sn, sn_bits);
            bits.put_flag(i + 1 < self.nacks.len());
            bits.put_flag(nack.so_range.is_some());
            bits.put_flag(nack.nack_range.is_some());
            bits.put(0, if sn_size == AmSnSize::Size12Bits { 1 } else { 3 });
            if let Some((start, end)) = nack.so_range {
                bits.put(start as u32, 16);
                bits.put(end as u32, 16);
            }
            if let Some(range) = nack.nack_range {
                bits.put(range as u32, 8);
            }
        }
        debug_assert!(bits.is_aligned());
        bits.finish()
    }

    /// Decode a STATUS PDU
    pub fn decode(pdu: &[u8], sn_size: AmSnSize) -> Result<Self, RlcError> {
        let (_, (dc, cpt, status)) =
            parse_status_pdu((pdu, 0), sn_size).map_err(|_| truncated("STATUS PDU"))?;
        if dc != DcField::Control as u32 {
            return Err(RlcError::MalformedPdu("data PDU on the control path".to_string()));
        }
        if ControlPduType::from_u32(cpt).is_none() {
            return Err(RlcError::MalformedPdu(format!("unsupported CPT {:#05b}", cpt)));
        }
        for nack in &status.nacks {
            if nack.nack_range == Some(0) {
                return Err(RlcError::MalformedPdu("NACK range of zero".to_string()));
            }
            if let Some((start, end)) = nack.so_range {
                if nack.nack_range.is_none() && end != Self::SO_END_OF_SDU && end < start {
                    return Err(RlcError::MalformedPdu(format!(
                        "NACK SN={} with SOstart={} > SOend={}",
                        nack.nack_sn, start, end
                    )));
                }
            }
        }
        Ok(status)
    }
}

fn parse_status_pdu(input: BitInput<'_>, sn_size: AmSnSize) -> IResult<BitInput<'_>, (u32, u32, StatusPdu)> {
    let sn_bits = sn_size.bits() as usize;
    let (input, dc) = field(input, 1)?;
    let (input, cpt) = field(input, 3)?;
    let (input, ack_sn) = field(input, sn_bits)?;
    let (input, mut e1) = flag(input)?;
    let (mut input, _reserved) = field(input, if sn_size == AmSnSize::Size12Bits { 7 } else { 1 })?;

    let mut status = StatusPdu::new(ack_sn);
    while e1 {
        let (rest, nack_sn) = field(input, sn_bits)?;
        let (rest, next_e1) = flag(rest)?;
        let (rest, e2) = flag(rest)?;
        let (rest, e3) = flag(rest)?;
        let (mut rest, _reserved) = field(rest, if sn_size == AmSnSize::Size12Bits { 1 } else { 3 })?;

        let mut nack = NackInfo::sdu(nack_sn);
        if e2 {
            let (r, start) = field(rest, 16)?;
            let (r, end) = field(r, 16)?;
            nack.so_range = Some((start as u16, end as u16));
            rest = r;
        }
        if e3 {
            let (r, range) = field(rest, 8)?;
            nack.nack_range = Some(range as u8);
            rest = r;
        }
        status.nacks.push(nack);
        e1 = next_e1;
        input = rest;
    }
    Ok((input, (dc, cpt, status)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umd_header_sizes() {
        assert_eq!(UmdPduHeader::packed_size(UmSnSize::Size6Bits, SiField::FullSdu), 1);
        assert_eq!(UmdPduHeader::packed_size(UmSnSize::Size6Bits, SiField::FirstSegment), 1);
        assert_eq!(UmdPduHeader::packed_size(UmSnSize::Size6Bits, SiField::LastSegment), 3);
        assert_eq!(UmdPduHeader::packed_size(UmSnSize::Size12Bits, SiField::FirstSegment), 2);
        assert_eq!(UmdPduHeader::packed_size(UmSnSize::Size12Bits, SiField::MiddleSegment), 4);
    }

    #[test]
    fn test_umd_12bit_middle_segment_layout() {
        let header = UmdPduHeader {
            si: SiField::MiddleSegment,
            sn: 0x5A3,
            so: 0x0102,
        };
        let mut buf = BytesMut::new();
        header.write(UmSnSize::Size12Bits, &mut buf);
        // SI=11 R=00 SN[11:8]=0101 | SN[7:0] | SO
        assert_eq!(&buf[..], &[0xC5, 0xA3, 0x01, 0x02]);

        let (decoded, len) = UmdPduHeader::decode(&buf, UmSnSize::Size12Bits).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(len, 4);
    }

    #[test]
    fn test_umd_full_sdu_has_no_sn() {
        let pdu = [0x00, 0xAA, 0xBB];
        let (header, len) = UmdPduHeader::decode(&pdu, UmSnSize::Size6Bits).unwrap();
        assert_eq!(header.si, SiField::FullSdu);
        assert_eq!(len, 1);
    }

    #[test]
    fn test_umd_6bit_first_segment() {
        // SI=01 SN=63
        let pdu = [0x7F, 0x11];
        let (header, len) = UmdPduHeader::decode(&pdu, UmSnSize::Size6Bits).unwrap();
        assert_eq!(header.si, SiField::FirstSegment);
        assert_eq!(header.sn, 63);
        assert_eq!(len, 1);
    }

    #[test]
    fn test_amd_18bit_last_segment_layout() {
        let header = AmdPduHeader {
            p: true,
            si: SiField::LastSegment,
            sn: 0x2_1234,
            so: 300,
        };
        let mut buf = BytesMut::new();
        header.write(AmSnSize::Size18Bits, &mut buf);
        // D/C=1 P=1 SI=10 R=00 SN[17:16]=10 | 0x12 | 0x34 | SO
        assert_eq!(&buf[..], &[0xE2, 0x12, 0x34, 0x01, 0x2C]);
        assert_eq!(buf.len(), AmdPduHeader::packed_size(AmSnSize::Size18Bits, SiField::LastSegment));

        let (decoded, len) = AmdPduHeader::decode(&buf, AmSnSize::Size18Bits).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(len, 5);
    }

    #[test]
    fn test_amd_header_rejects_truncation_and_bad_so() {
        assert!(matches!(
            AmdPduHeader::decode(&[0x80], AmSnSize::Size12Bits),
            Err(RlcError::MalformedPdu(_))
        ));
        // Last segment (SI=10) with SO=0
        assert!(matches!(
            AmdPduHeader::decode(&[0xA0, 0x01, 0x00, 0x00, 0xFF], AmSnSize::Size12Bits),
            Err(RlcError::MalformedPdu(_))
        ));
        // Control PDU handed to the data decoder
        assert!(AmdPduHeader::decode(&[0x00, 0x01, 0x00], AmSnSize::Size12Bits).is_err());
    }

    #[test]
    fn test_status_pdu_ack_only_12bit() {
        let status = StatusPdu::new(11);
        let encoded = status.encode(AmSnSize::Size12Bits);
        assert_eq!(&encoded[..], &[0x00, 0x0B, 0x00]);
        assert_eq!(StatusPdu::decode(&encoded, AmSnSize::Size12Bits).unwrap(), status);
    }

    #[test]
    fn test_status_pdu_with_nacks_18bit() {
        let status = StatusPdu {
            ack_sn: 200,
            nacks: vec![
                NackInfo::sdu(5),
                NackInfo::segment(7, 100, StatusPdu::SO_END_OF_SDU),
                NackInfo {
                    nack_sn: 10,
                    so_range: None,
                    nack_range: Some(4),
                },
            ],
        };
        let encoded = status.encode(AmSnSize::Size18Bits);
        assert_eq!(encoded.len(), status.packed_size(AmSnSize::Size18Bits));
        assert_eq!(encoded.len(), 3 + 3 + 7 + 4);
        assert_eq!(DcField::of(&encoded), Some(DcField::Control));
        assert_eq!(StatusPdu::decode(&encoded, AmSnSize::Size18Bits).unwrap(), status);
    }

    #[test]
    fn test_status_pdu_rejects_unknown_cpt() {
        // D/C=0 CPT=001
        assert!(StatusPdu::decode(&[0x10, 0x00, 0x00], AmSnSize::Size12Bits).is_err());
    }

    #[test]
    fn test_status_pdu_trim_moves_ack_sn() {
        let mut status = StatusPdu {
            ack_sn: 50,
            nacks: vec![NackInfo::sdu(3), NackInfo::sdu(9), NackInfo::sdu(20)],
        };
        assert_eq!(status.packed_size(AmSnSize::Size12Bits), 9);
        assert!(status.trim(7, AmSnSize::Size12Bits));
        assert_eq!(status.nacks.len(), 2);
        assert_eq!(status.ack_sn, 20);

        assert!(status.trim(3, AmSnSize::Size12Bits));
        assert!(status.nacks.is_empty());
        assert_eq!(status.ack_sn, 3);

        assert!(!status.trim(2, AmSnSize::Size12Bits));
    }

    #[test]
    fn test_status_pdu_trim_drops_segments_of_new_ack_sn() {
        let mut status = StatusPdu {
            ack_sn: 1,
            nacks: vec![NackInfo::segment(0, 2, 3), NackInfo::segment(0, 6, 7)],
        };
        assert_eq!(status.packed_size(AmSnSize::Size12Bits), 15);
        assert!(status.trim(9, AmSnSize::Size12Bits));
        assert_eq!(status, StatusPdu::new(0));

        // Only segments of the dropped SN go, earlier SNs stay
        let mut status = StatusPdu {
            ack_sn: 9,
            nacks: vec![
                NackInfo::sdu(2),
                NackInfo::segment(5, 0, 9),
                NackInfo::segment(5, 20, StatusPdu::SO_END_OF_SDU),
            ],
        };
        assert!(status.trim(12, AmSnSize::Size12Bits));
        assert_eq!(status.ack_sn, 5);
        assert_eq!(status.nacks, vec![NackInfo::sdu(2)]);
    }
}
