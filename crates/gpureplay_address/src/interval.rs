//! Address ranges and the ordered start index used for containment lookups.

use gpureplay_core::{GpuAddress, ObjectKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A half-open address range `[start, start + size)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    /// First address of the range
    pub start: GpuAddress,
    /// Length in bytes
    pub size: u64,
}

impl AddressRange {
    /// Create a new range
    #[must_use]
    pub const fn new(start: GpuAddress, size: u64) -> Self {
        Self { start, size }
    }

    /// One past the last address (saturating)
    #[must_use]
    pub const fn end(&self) -> GpuAddress {
        self.start.saturating_add(self.size)
    }

    /// Check if an address is within this range
    #[must_use]
    pub const fn contains(&self, addr: GpuAddress) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Check if another range intersects this one
    #[must_use]
    pub const fn overlaps(&self, other: &AddressRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Offset of `addr` from the start of the range
    #[must_use]
    pub fn offset_of(&self, addr: GpuAddress) -> Option<u64> {
        self.contains(addr).then(|| addr - self.start)
    }
}

/// Ordered index of range starts.
///
/// Several keys may share a start when resources alias. Lookups answer
/// "greatest start <= address"; containment is confirmed by the caller, which
/// owns the sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceIndex {
    starts: BTreeMap<GpuAddress, Vec<ObjectKey>>,
    len: usize,
}

impl SpaceIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` at `start`
    pub fn insert(&mut self, start: GpuAddress, key: ObjectKey) {
        let keys = self.starts.entry(start).or_default();
        if !keys.contains(&key) {
            keys.push(key);
            self.len += 1;
        }
    }

    /// Remove `key` from `start`, returning whether it was present
    pub fn remove(&mut self, start: GpuAddress, key: ObjectKey) -> bool {
        let Some(keys) = self.starts.get_mut(&start) else {
            return false;
        };
        let Some(pos) = keys.iter().position(|k| *k == key) else {
            return false;
        };
        keys.remove(pos);
        if keys.is_empty() {
            self.starts.remove(&start);
        }
        self.len -= 1;
        true
    }

    /// Greatest registered start `<= addr` and the keys registered there
    #[must_use]
    pub fn floor(&self, addr: GpuAddress) -> Option<(GpuAddress, &[ObjectKey])> {
        self.starts
            .range(..=addr)
            .next_back()
            .map(|(start, keys)| (*start, keys.as_slice()))
    }

    /// Number of registered keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_contains() {
        let range = AddressRange::new(0x1000, 0x100);
        assert!(range.contains(0x1000));
        assert!(range.contains(0x10ff));
        assert!(!range.contains(0x1100));
        assert!(!range.contains(0xfff));
    }

    #[test]
    fn test_range_overlaps_half_open() {
        let a = AddressRange::new(0, 128);
        assert!(a.overlaps(&AddressRange::new(64, 128)));
        assert!(!a.overlaps(&AddressRange::new(128, 64)));
        assert!(!a.overlaps(&AddressRange::new(0, 0)));
    }

    #[test]
    fn test_range_end_saturates() {
        let range = AddressRange::new(u64::MAX - 1, 16);
        assert_eq!(range.end(), u64::MAX);
    }

    #[test]
    fn test_index_floor() {
        let mut index = SpaceIndex::new();
        index.insert(0x100, ObjectKey::new(1));
        index.insert(0x200, ObjectKey::new(2));

        assert!(index.floor(0xff).is_none());
        assert_eq!(index.floor(0x100).unwrap().0, 0x100);
        assert_eq!(index.floor(0x1ff).unwrap().1, &[ObjectKey::new(1)]);
        assert_eq!(index.floor(0x5000).unwrap().1, &[ObjectKey::new(2)]);
    }

    #[test]
    fn test_index_shared_start() {
        let mut index = SpaceIndex::new();
        index.insert(0, ObjectKey::new(1));
        index.insert(0, ObjectKey::new(2));
        index.insert(0, ObjectKey::new(2));
        assert_eq!(index.len(), 2);

        assert!(index.remove(0, ObjectKey::new(1)));
        assert!(!index.remove(0, ObjectKey::new(1)));
        assert_eq!(index.floor(0).unwrap().1, &[ObjectKey::new(2)]);

        assert!(index.remove(0, ObjectKey::new(2)));
        assert!(index.is_empty());
        assert!(index.floor(0).is_none());
    }
}
