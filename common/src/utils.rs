//! Common Utilities
//!
//! Provides byte and bit helpers used by the protocol codecs

use bytes::{Bytes, BytesMut, BufMut};
use tracing::trace;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pack bits into bytes (MSB first)
pub fn pack_bits(bits: &[bool]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);

    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }

    bytes.freeze()
}

/// MSB-first writer for bit-aligned protocol fields
///
/// Fields are appended in wire order; `finish` pads the last byte with
/// zero bits.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    bits: Vec<bool>,
}

impl BitWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the `width` least significant bits of `value`
    pub fn put(&mut self, value: u32, width: usize) {
        debug_assert!(width <= 32);
        for i in (0..width).rev() {
            self.bits.push((value >> i) & 1 != 0);
        }
    }

    /// Append a single flag bit
    pub fn put_flag(&mut self, flag: bool) {
        self.bits.push(flag);
    }

    /// Number of bits written so far
    pub fn len_bits(&self) -> usize {
        self.bits.len()
    }

    /// Whether the writer sits on a byte boundary
    pub fn is_aligned(&self) -> bool {
        self.bits.len() % 8 == 0
    }

    /// Pack the written bits into bytes
    pub fn finish(self) -> Bytes {
        trace!("Packing {} bits", self.bits.len());
        pack_bits(&self.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_bit_packing() {
        let bits = vec![true, false, true, false, true, false, true, false];
        let packed = pack_bits(&bits);
        assert_eq!(packed[0], 0xAA); // 10101010
    }

    #[test]
    fn test_bit_writer_fields() {
        let mut writer = BitWriter::new();
        writer.put_flag(false);
        writer.put(0, 3);
        writer.put(0xABC, 12);
        assert!(writer.is_aligned());
        writer.put_flag(true);
        writer.put(0, 7);
        assert_eq!(writer.len_bits(), 24);
        assert_eq!(&writer.finish()[..], &[0x0A, 0xBC, 0x80]);
    }

    #[test]
    fn test_bit_writer_pads_last_byte() {
        let mut writer = BitWriter::new();
        writer.put(0b101, 3);
        assert!(!writer.is_aligned());
        assert_eq!(&writer.finish()[..], &[0xA0]);
    }
}
