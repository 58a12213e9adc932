//! Sequence Number Arithmetic
//!
//! Modulo arithmetic over the RLC SN field (TS 38.322 §7.1). All
//! comparisons are made relative to a window base, never on raw values.

/// Value range of a sequence number field of `sn_size` bits
pub const fn cardinality(sn_size: u16) -> u32 {
    1 << sn_size
}

/// UM_Window_Size / AM_Window_Size for a field of `sn_size` bits
pub const fn window_size(sn_size: u16) -> u32 {
    cardinality(sn_size - 1)
}

/// Sequence number space of a configured field width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnSpace {
    bits: u16,
    mask: u32,
}

impl SnSpace {
    /// Create the SN space for a field of `bits` bits
    pub fn new(bits: u16) -> Self {
        debug_assert!((1..32).contains(&bits));
        Self {
            bits,
            mask: cardinality(bits) - 1,
        }
    }

    /// Field width in bits
    pub fn bits(&self) -> u16 {
        self.bits
    }

    /// Number of distinct SN values
    pub fn cardinality(&self) -> u32 {
        self.mask + 1
    }

    /// Size of the transmission/reception window
    pub fn window_size(&self) -> u32 {
        window_size(self.bits)
    }

    /// `sn + n` modulo the field width
    pub fn add(&self, sn: u32, n: u32) -> u32 {
        sn.wrapping_add(n) & self.mask
    }

    /// `sn - n` modulo the field width
    pub fn sub(&self, sn: u32, n: u32) -> u32 {
        sn.wrapping_sub(n) & self.mask
    }

    /// Next SN after `sn`
    pub fn next(&self, sn: u32) -> u32 {
        self.add(sn, 1)
    }

    /// Distance of `sn` from the window base `base`
    ///
    /// This is the value TS 38.322 compares after "modulus base" rebasing.
    pub fn rel(&self, sn: u32, base: u32) -> u32 {
        self.sub(sn, base)
    }

    /// Whether `sn` lies inside `[base, base + window_size)`
    pub fn inside_window(&self, sn: u32, base: u32) -> bool {
        self.rel(sn, base) < self.window_size()
    }

    /// Whether `a < b`, both taken relative to `base`
    pub fn lt(&self, a: u32, b: u32, base: u32) -> bool {
        self.rel(a, base) < self.rel(b, base)
    }

    /// Number of SNs in `[from, to)`
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        self.sub(to, from)
    }
}
