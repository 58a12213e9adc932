//! SN-indexed window storage
//!
//! Fixed-capacity table indexed by `SN mod capacity`. With the capacity set
//! to the window size, every SN inside a window maps to a distinct slot.

use tracing::warn;

/// Per-SN table sized to one window
#[derive(Debug)]
pub struct SnTable<T> {
    slots: Vec<Option<(u32, T)>>,
    len: usize,
}

impl<T> SnTable<T> {
    /// Create an empty table with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "SN table needs at least one slot");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, len: 0 }
    }

    fn index(&self, sn: u32) -> usize {
        sn as usize % self.slots.len()
    }

    /// Number of present entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no entry is present
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether an entry for exactly `sn` is present
    pub fn contains(&self, sn: u32) -> bool {
        matches!(&self.slots[self.index(sn)], Some((s, _)) if *s == sn)
    }

    /// Entry for `sn`
    pub fn get(&self, sn: u32) -> Option<&T> {
        match &self.slots[self.index(sn)] {
            Some((s, value)) if *s == sn => Some(value),
            _ => None,
        }
    }

    /// Mutable entry for `sn`
    pub fn get_mut(&mut self, sn: u32) -> Option<&mut T> {
        let idx = self.index(sn);
        match &mut self.slots[idx] {
            Some((s, value)) if *s == sn => Some(value),
            _ => None,
        }
    }

    /// Entry for `sn`, created with `f` when absent
    ///
    /// An entry of another SN occupying the slot has fallen out of the
    /// window and is replaced.
    pub fn get_or_insert_with<F: FnOnce() -> T>(&mut self, sn: u32, f: F) -> &mut T {
        let idx = self.index(sn);
        let slot = &mut self.slots[idx];
        if let Some((stale, _)) = slot {
            if *stale != sn {
                warn!("Replacing stale SN={} in slot of SN={}", stale, sn);
                *slot = None;
                self.len -= 1;
            }
        }
        if slot.is_none() {
            self.len += 1;
        }
        &mut slot.get_or_insert_with(|| (sn, f())).1
    }

    /// Insert `value` for `sn`, returning the entry previously held for that SN
    pub fn insert(&mut self, sn: u32, value: T) -> Option<T> {
        let previous = self.remove(sn);
        let idx = self.index(sn);
        if let Some((stale, _)) = self.slots[idx].take() {
            warn!("Replacing stale SN={} in slot of SN={}", stale, sn);
            self.len -= 1;
        }
        self.slots[idx] = Some((sn, value));
        self.len += 1;
        previous
    }

    /// Remove and return the entry for `sn`
    pub fn remove(&mut self, sn: u32) -> Option<T> {
        let idx = self.index(sn);
        if !matches!(&self.slots[idx], Some((s, _)) if *s == sn) {
            return None;
        }
        self.len -= 1;
        self.slots[idx].take().map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut table = SnTable::new(32);
        assert!(table.is_empty());
        table.insert(5, "five");
        table.insert(63, "sixty-three");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(5), Some(&"five"));
        assert!(table.contains(63));
        // 37 shares the slot of 5 but is a different SN
        assert!(!table.contains(37));
        assert_eq!(table.remove(37), None);
        assert_eq!(table.remove(5), Some("five"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_get_or_insert_replaces_stale_slot() {
        let mut table: SnTable<Vec<u8>> = SnTable::new(4);
        table.get_or_insert_with(1, Vec::new).push(1);
        table.get_or_insert_with(1, Vec::new).push(2);
        assert_eq!(table.get(1).unwrap(), &vec![1, 2]);

        table.get_or_insert_with(5, Vec::new).push(9);
        assert!(!table.contains(1));
        assert_eq!(table.get(5).unwrap(), &vec![9]);
        assert_eq!(table.len(), 1);

        assert_eq!(table.remove(5), Some(vec![9]));
        assert!(table.is_empty());
    }
}
