//! Capture-space to replay-space address translation.
//!
//! The translator keeps two parallel indices: one fed with addresses recorded
//! in the call stream, one fed with addresses the replay driver handed out.
//! Placed resources additionally carry an alias set so addresses shared by
//! several resources resolve deterministically.

use crate::interval::{AddressRange, SpaceIndex};
use gpureplay_core::{CoreError, GpuAddress, ObjectKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, warn};

/// Which address space a lookup targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Space {
    /// Addresses recorded at capture time
    Capture,
    /// Addresses assigned by the replay driver
    Replay,
}

impl Space {
    /// Get string representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Replay => "replay",
        }
    }
}

/// Heap-relative extents of a placed resource in both runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedRange {
    /// Offset within the heap at capture
    pub capture_offset: u64,
    /// Footprint at capture
    pub capture_size: u64,
    /// Offset within the heap at replay
    pub replay_offset: u64,
    /// Footprint at replay
    pub replay_size: u64,
}

impl PlacedRange {
    /// Same offset and size in both runs
    #[must_use]
    pub const fn identical(offset: u64, size: u64) -> Self {
        Self {
            capture_offset: offset,
            capture_size: size,
            replay_offset: offset,
            replay_size: size,
        }
    }

    fn capture(&self) -> AddressRange {
        AddressRange::new(self.capture_offset, self.capture_size)
    }

    fn replay(&self) -> AddressRange {
        AddressRange::new(self.replay_offset, self.replay_size)
    }
}

/// Derived capture/replay address pair of one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMapping {
    /// Start address at capture
    pub capture_address: GpuAddress,
    /// Start address at replay
    pub replay_address: GpuAddress,
    /// Mapped length (the captured footprint)
    pub size: u64,
}

/// Everything the translator knows about one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Interface key
    pub key: ObjectKey,
    /// Owning heap (non-owning back-reference) and heap-relative extents
    pub placement: Option<(ObjectKey, PlacedRange)>,
    /// Absolute range in capture space, if the address is known
    pub capture: Option<AddressRange>,
    /// Absolute range in replay space, if the address is known
    pub replay: Option<AddressRange>,
    /// Alias disambiguator; 0 for the first resource over a region
    pub layer: u32,
    /// Other live placed resources sharing bytes with this one
    pub intersecting: BTreeSet<ObjectKey>,
    /// Creation order, used as the alias tie-break
    pub sequence: u64,
}

impl ResourceInfo {
    /// Owning heap of a placed resource
    #[must_use]
    pub fn heap(&self) -> Option<ObjectKey> {
        self.placement.map(|(heap, _)| heap)
    }

    /// Whether another resource shares bytes with this one
    #[must_use]
    pub fn is_aliased(&self) -> bool {
        !self.intersecting.is_empty()
    }

    /// Range in the requested space
    #[must_use]
    pub fn range(&self, space: Space) -> Option<AddressRange> {
        match space {
            Space::Capture => self.capture,
            Space::Replay => self.replay,
        }
    }

    /// Capture/replay address pair, if both are known
    #[must_use]
    pub fn mapping(&self) -> Option<AddressMapping> {
        let capture = self.capture?;
        let replay = self.replay?;
        Some(AddressMapping {
            capture_address: capture.start,
            replay_address: replay.start,
            size: capture.size,
        })
    }

    fn contains(&self, space: Space, addr: GpuAddress) -> bool {
        self.range(space).is_some_and(|r| r.contains(addr))
    }
}

#[derive(Debug, Clone)]
struct HeapInfo {
    capture_base: Option<GpuAddress>,
    replay_base: Option<GpuAddress>,
    size: u64,
    placed: Vec<ObjectKey>,
}

#[derive(Debug, Default)]
struct TranslatorState {
    resources: HashMap<ObjectKey, ResourceInfo>,
    heaps: HashMap<ObjectKey, HeapInfo>,
    capture: SpaceIndex,
    replay: SpaceIndex,
    released: HashMap<ObjectKey, ResourceInfo>,
    next_sequence: u64,
}

impl TranslatorState {
    fn index_mut(&mut self, space: Space) -> &mut SpaceIndex {
        match space {
            Space::Capture => &mut self.capture,
            Space::Replay => &mut self.replay,
        }
    }

    fn index(&self, space: Space) -> &SpaceIndex {
        match space {
            Space::Capture => &self.capture,
            Space::Replay => &self.replay,
        }
    }

    fn register(&mut self, mut info: ResourceInfo) {
        if self.resources.contains_key(&info.key) {
            debug!(resource = %info.key, "re-registered without release, replacing");
            self.unregister(info.key);
        }
        info.sequence = self.next_sequence;
        self.next_sequence += 1;

        for space in [Space::Capture, Space::Replay] {
            // Zero-sized ranges can never contain an address
            if let Some(range) = info.range(space).filter(|r| r.size > 0) {
                self.index_mut(space).insert(range.start, info.key);
            }
        }
        if let Some((heap, _)) = info.placement {
            for other in &info.intersecting {
                if let Some(other) = self.resources.get_mut(other) {
                    other.intersecting.insert(info.key);
                }
            }
            if let Some(heap) = self.heaps.get_mut(&heap) {
                heap.placed.push(info.key);
            }
        }
        self.released.remove(&info.key);
        self.resources.insert(info.key, info);
    }

    fn unregister(&mut self, key: ObjectKey) -> Option<ResourceInfo> {
        let info = self.resources.remove(&key)?;
        for space in [Space::Capture, Space::Replay] {
            if let Some(range) = info.range(space) {
                self.index_mut(space).remove(range.start, key);
            }
        }
        for other in &info.intersecting {
            if let Some(other) = self.resources.get_mut(other) {
                other.intersecting.remove(&key);
            }
        }
        if let Some(heap) = info.heap().and_then(|heap| self.heaps.get_mut(&heap)) {
            heap.placed.retain(|k| *k != key);
        }
        Some(info)
    }

    fn lookup(&self, space: Space, addr: GpuAddress) -> Option<&ResourceInfo> {
        let (_, keys) = self.index(space).floor(addr)?;

        // A resource starting earlier may still cover addr if it aliases one
        // registered at the floor start, so alias sets are searched too
        let mut seen = BTreeSet::new();
        let mut candidates: Vec<&ResourceInfo> = Vec::new();
        for info in keys.iter().filter_map(|key| self.resources.get(key)) {
            let aliases = info
                .intersecting
                .iter()
                .filter_map(|alias| self.resources.get(alias));
            for candidate in std::iter::once(info).chain(aliases) {
                if seen.insert(candidate.key) && candidate.contains(space, addr) {
                    candidates.push(candidate);
                }
            }
        }

        if candidates.len() > 1 {
            let err = CoreError::OverlapAmbiguity {
                address: addr,
                candidates: candidates.iter().map(|info| info.key).collect(),
            };
            debug!(space = space.as_str(), "{}, most recent wins", err);
        }
        candidates.into_iter().max_by_key(|info| info.sequence)
    }

    fn all_heaps(&self) -> Vec<(ObjectKey, HeapInfo)> {
        self.heaps.iter().map(|(k, h)| (*k, h.clone())).collect()
    }
}

fn placed_range(key: ObjectKey, base: GpuAddress, offset: u64, size: u64) -> Option<AddressRange> {
    match base.checked_add(offset) {
        Some(start) => Some(AddressRange::new(start, size)),
        None => {
            warn!(offset, "{}", CoreError::missing_key("placed address", key));
            None
        }
    }
}

/// Dual-space address translator
#[derive(Debug, Default)]
pub struct AddressTranslator {
    state: Mutex<TranslatorState>,
    dump: OnceLock<Box<AddressTranslator>>,
}

impl AddressTranslator {
    /// Create an empty translator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TranslatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a heap with its base in each space.
    ///
    /// A base is `None` when it could not be probed (the heap denies
    /// buffers); placed resources in that space then have no address.
    pub fn add_heap(
        &self,
        key: ObjectKey,
        capture_base: Option<GpuAddress>,
        replay_base: Option<GpuAddress>,
        size: u64,
    ) {
        let mut state = self.state();
        let placed = state
            .heaps
            .remove(&key)
            .map(|heap| heap.placed)
            .unwrap_or_default();
        state.heaps.insert(
            key,
            HeapInfo {
                capture_base,
                replay_base,
                size,
                placed,
            },
        );
        if let Some(dump) = self.dump.get() {
            dump.add_heap(key, replay_base, replay_base, size);
        }
    }

    /// Register a committed resource
    pub fn add_committed_resource(&self, key: ObjectKey, capture: AddressRange, replay: AddressRange) {
        let mut state = self.state();
        state.register(ResourceInfo {
            key,
            placement: None,
            capture: Some(capture),
            replay: Some(replay),
            layer: 0,
            intersecting: BTreeSet::new(),
            sequence: 0,
        });
        if let Some(dump) = self.dump.get() {
            dump.add_committed_resource(key, replay, replay);
        }
    }

    /// Register a resource placed inside `heap`.
    ///
    /// Every live placed resource of the heap whose extent intersects the new
    /// one, in either space, joins its alias set.
    pub fn add_placed_resource(&self, key: ObjectKey, heap: ObjectKey, range: PlacedRange) {
        let mut state = self.state();
        let Some(heap_info) = state.heaps.get(&heap).cloned() else {
            warn!("{}", CoreError::missing_key("heap", heap));
            return;
        };

        let mut intersecting = BTreeSet::new();
        let mut layer = 0;
        for other_key in heap_info.placed.iter().filter(|k| **k != key) {
            let Some(other) = state.resources.get(other_key) else {
                continue;
            };
            let Some((_, other_range)) = other.placement else {
                continue;
            };
            let capture_overlap = range.capture().overlaps(&other_range.capture());
            let replay_overlap = range.replay().overlaps(&other_range.replay());
            if replay_overlap && !capture_overlap {
                warn!(
                    resource = %key,
                    other = %other_key,
                    heap = %heap,
                    "replay placement overlaps a resource that did not alias it at capture"
                );
            }
            if capture_overlap || replay_overlap {
                intersecting.insert(*other_key);
                layer = layer.max(other.layer + 1);
            }
        }
        if range.capture_offset.saturating_add(range.capture_size) > heap_info.size {
            debug!(resource = %key, heap = %heap, "captured extent exceeds heap size");
        }

        let capture = heap_info
            .capture_base
            .and_then(|base| placed_range(key, base, range.capture_offset, range.capture_size));
        let replay = heap_info
            .replay_base
            .and_then(|base| placed_range(key, base, range.replay_offset, range.replay_size));
        state.register(ResourceInfo {
            key,
            placement: Some((heap, range)),
            capture,
            replay,
            layer,
            intersecting,
            sequence: 0,
        });
        if let Some(dump) = self.dump.get() {
            let mirrored = PlacedRange {
                capture_offset: range.replay_offset,
                capture_size: range.replay_size,
                ..range
            };
            dump.add_placed_resource(key, heap, mirrored);
        }
    }

    /// Live resource whose capture-space range contains `addr`
    #[must_use]
    pub fn get_resource_info_by_capture_address(&self, addr: GpuAddress) -> Option<ResourceInfo> {
        self.state().lookup(Space::Capture, addr).cloned()
    }

    /// Live resource whose replay-space range contains `addr`
    #[must_use]
    pub fn get_resource_info_by_replay_address(&self, addr: GpuAddress) -> Option<ResourceInfo> {
        self.state().lookup(Space::Replay, addr).cloned()
    }

    /// Live resource by key
    #[must_use]
    pub fn resource_info(&self, key: ObjectKey) -> Option<ResourceInfo> {
        self.state().resources.get(&key).cloned()
    }

    /// Last-known state of a destroyed resource
    #[must_use]
    pub fn released_info(&self, key: ObjectKey) -> Option<ResourceInfo> {
        self.state().released.get(&key).cloned()
    }

    /// Map a capture-space address onto the replay address of the same byte
    #[must_use]
    pub fn translate_capture_address(&self, addr: GpuAddress) -> Option<GpuAddress> {
        let state = self.state();
        let info = state.lookup(Space::Capture, addr)?;
        let capture = info.capture?;
        let replay = info.replay?;
        replay.start.checked_add(addr - capture.start)
    }

    /// Base address of a registered heap in `space`
    #[must_use]
    pub fn heap_base(&self, key: ObjectKey, space: Space) -> Option<GpuAddress> {
        let state = self.state();
        let heap = state.heaps.get(&key)?;
        match space {
            Space::Capture => heap.capture_base,
            Space::Replay => heap.replay_base,
        }
    }

    /// Remove `key` from both spaces and from every alias set.
    ///
    /// The last-known state stays readable through [`Self::released_info`].
    pub fn destroy(&self, key: ObjectKey) {
        let mut state = self.state();
        if let Some(mut info) = state.unregister(key) {
            info.intersecting.clear();
            state.released.insert(key, info);
        } else if state.heaps.remove(&key).is_none() {
            debug!(resource = %key, "destroy of untracked key");
        }
        if let Some(dump) = self.dump.get() {
            dump.destroy(key);
        }
    }

    /// Activate the diagnostic lookup mapping replay addresses onto
    /// themselves. It is seeded with everything currently registered and
    /// never consulted by [`Self::translate_capture_address`].
    pub fn enable_dump_lookup(&self) {
        let state = self.state();
        self.dump.get_or_init(|| {
            let dump = AddressTranslator::new();
            for (key, heap) in state.all_heaps() {
                dump.add_heap(key, heap.replay_base, heap.replay_base, heap.size);
            }
            let mut resources: Vec<&ResourceInfo> = state.resources.values().collect();
            resources.sort_by_key(|info| info.sequence);
            for info in resources {
                match (info.placement, info.replay) {
                    (Some((heap, range)), _) => {
                        let mirrored = PlacedRange {
                            capture_offset: range.replay_offset,
                            capture_size: range.replay_size,
                            ..range
                        };
                        dump.add_placed_resource(info.key, heap, mirrored);
                    }
                    (None, Some(replay)) => dump.add_committed_resource(info.key, replay, replay),
                    (None, None) => {}
                }
            }
            Box::new(dump)
        });
    }

    /// Whether the diagnostic lookup is active
    #[must_use]
    pub fn dump_lookup_enabled(&self) -> bool {
        self.dump.get().is_some()
    }

    /// Resolve a replay address through the diagnostic lookup
    #[must_use]
    pub fn resolve_dump_address(&self, addr: GpuAddress) -> Option<GpuAddress> {
        self.dump.get()?.translate_capture_address(addr)
    }

    /// Number of live resources
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().resources.len()
    }

    /// Whether no resource is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CAPTURE_HEAP: GpuAddress = 0x10_0000;
    const REPLAY_HEAP: GpuAddress = 0x7f00_0000;

    fn key(raw: u32) -> ObjectKey {
        ObjectKey::new(raw)
    }

    fn with_heap() -> AddressTranslator {
        let translator = AddressTranslator::new();
        translator.add_heap(key(1), Some(CAPTURE_HEAP), Some(REPLAY_HEAP), 1024);
        translator
    }

    #[test]
    fn test_committed_lookup_both_spaces() {
        let translator = AddressTranslator::new();
        translator.add_committed_resource(
            key(5),
            AddressRange::new(0x1000, 0x100),
            AddressRange::new(0x9000, 0x140),
        );

        let info = translator.get_resource_info_by_capture_address(0x10ff).unwrap();
        assert_eq!(info.key, key(5));
        assert!(translator.get_resource_info_by_capture_address(0x1100).is_none());
        assert!(translator.get_resource_info_by_capture_address(0xfff).is_none());

        // Replay footprint is larger
        let info = translator.get_resource_info_by_replay_address(0x913f).unwrap();
        assert_eq!(info.key, key(5));
        assert_eq!(
            info.mapping(),
            Some(AddressMapping {
                capture_address: 0x1000,
                replay_address: 0x9000,
                size: 0x100,
            })
        );
    }

    #[test]
    fn test_translate_capture_address() {
        let translator = with_heap();
        translator.add_placed_resource(
            key(2),
            key(1),
            PlacedRange {
                capture_offset: 256,
                capture_size: 256,
                replay_offset: 320,
                replay_size: 256,
            },
        );
        assert_eq!(
            translator.translate_capture_address(CAPTURE_HEAP + 256 + 10),
            Some(REPLAY_HEAP + 320 + 10)
        );
        assert_eq!(translator.translate_capture_address(CAPTURE_HEAP), None);
    }

    #[test]
    fn test_intentional_aliasing() {
        let translator = with_heap();
        translator.add_placed_resource(key(2), key(1), PlacedRange::identical(0, 128));
        translator.add_placed_resource(key(3), key(1), PlacedRange::identical(0, 128));

        for addr in [CAPTURE_HEAP, CAPTURE_HEAP + 64, CAPTURE_HEAP + 127] {
            let info = translator.get_resource_info_by_capture_address(addr).unwrap();
            // Most recently created wins
            assert_eq!(info.key, key(3));
            assert_eq!(info.layer, 1);
            assert!(info.intersecting.contains(&key(2)));

            let other = translator.resource_info(key(2)).unwrap();
            assert_eq!(other.layer, 0);
            assert!(other.intersecting.contains(&key(3)));
        }
        assert!(translator.get_resource_info_by_capture_address(CAPTURE_HEAP + 128).is_none());
    }

    #[test]
    fn test_alias_starting_earlier_resolves() {
        let translator = with_heap();
        translator.add_placed_resource(key(2), key(1), PlacedRange::identical(0, 512));
        translator.add_placed_resource(key(3), key(1), PlacedRange::identical(128, 64));

        // Floor start is key 3 which does not cover the address, key 2 does
        let info = translator.get_resource_info_by_capture_address(CAPTURE_HEAP + 300).unwrap();
        assert_eq!(info.key, key(2));
        let info = translator.get_resource_info_by_capture_address(CAPTURE_HEAP + 130).unwrap();
        assert_eq!(info.key, key(3));
    }

    #[test]
    fn test_non_overlapping_not_aliased() {
        let translator = with_heap();
        translator.add_placed_resource(key(2), key(1), PlacedRange::identical(0, 256));
        translator.add_placed_resource(key(3), key(1), PlacedRange::identical(256, 256));
        assert!(!translator.resource_info(key(2)).unwrap().is_aliased());
        assert!(!translator.resource_info(key(3)).unwrap().is_aliased());
    }

    #[test]
    fn test_destroy_removes_from_alias_sets() {
        let translator = with_heap();
        translator.add_placed_resource(key(2), key(1), PlacedRange::identical(0, 128));
        translator.add_placed_resource(key(3), key(1), PlacedRange::identical(64, 128));
        translator.destroy(key(3));

        assert!(translator.resource_info(key(3)).is_none());
        assert!(!translator.resource_info(key(2)).unwrap().is_aliased());
        let released = translator.released_info(key(3)).unwrap();
        assert_eq!(released.capture, Some(AddressRange::new(CAPTURE_HEAP + 64, 128)));
        assert_eq!(
            translator.get_resource_info_by_capture_address(CAPTURE_HEAP + 100).unwrap().key,
            key(2)
        );
        // Released keys do not count for new placements
        translator.add_placed_resource(key(4), key(1), PlacedRange::identical(512, 64));
        assert_eq!(translator.resource_info(key(4)).unwrap().layer, 0);
    }

    #[test]
    fn test_heap_without_capture_base() {
        let translator = AddressTranslator::new();
        translator.add_heap(key(1), None, Some(REPLAY_HEAP), 1024);
        translator.add_placed_resource(key(2), key(1), PlacedRange::identical(0, 64));
        let info = translator.resource_info(key(2)).unwrap();
        assert!(info.capture.is_none());
        assert_eq!(info.replay, Some(AddressRange::new(REPLAY_HEAP, 64)));
        assert!(translator.get_resource_info_by_replay_address(REPLAY_HEAP + 8).is_some());
    }

    #[test]
    fn test_heap_base_per_space() {
        let translator = with_heap();
        assert_eq!(translator.heap_base(key(1), Space::Capture), Some(CAPTURE_HEAP));
        assert_eq!(translator.heap_base(key(1), Space::Replay), Some(REPLAY_HEAP));
        assert_eq!(translator.heap_base(key(9), Space::Replay), None);
        translator.destroy(key(1));
        assert_eq!(translator.heap_base(key(1), Space::Replay), None);
    }

    #[test]
    fn test_address_overflow_is_untracked() {
        let translator = AddressTranslator::new();
        translator.add_heap(key(1), Some(u64::MAX - 16), Some(REPLAY_HEAP), 1024);
        translator.add_placed_resource(key(2), key(1), PlacedRange::identical(64, 64));
        let info = translator.resource_info(key(2)).unwrap();
        assert!(info.capture.is_none());
        assert_eq!(info.replay, Some(AddressRange::new(REPLAY_HEAP + 64, 64)));

        translator.add_committed_resource(
            key(3),
            AddressRange::new(0x1000, 0x100),
            AddressRange::new(u64::MAX - 16, 0x100),
        );
        assert_eq!(translator.translate_capture_address(0x1004), Some(u64::MAX - 12));
        assert_eq!(translator.translate_capture_address(0x1080), None);
    }

    #[test]
    fn test_placed_in_unknown_heap_ignored() {
        let translator = AddressTranslator::new();
        translator.add_placed_resource(key(2), key(9), PlacedRange::identical(0, 64));
        assert!(translator.is_empty());
    }

    #[test]
    fn test_dump_lookup_isolated() {
        let translator = with_heap();
        translator.add_placed_resource(
            key(2),
            key(1),
            PlacedRange {
                capture_offset: 0,
                capture_size: 64,
                replay_offset: 128,
                replay_size: 64,
            },
        );
        assert!(!translator.dump_lookup_enabled());
        assert_eq!(translator.resolve_dump_address(REPLAY_HEAP + 130), None);

        translator.enable_dump_lookup();
        translator.add_committed_resource(
            key(3),
            AddressRange::new(0x1000, 16),
            AddressRange::new(0x2000, 16),
        );

        assert_eq!(translator.resolve_dump_address(REPLAY_HEAP + 130), Some(REPLAY_HEAP + 130));
        assert_eq!(translator.resolve_dump_address(0x2004), Some(0x2004));
        assert_eq!(translator.resolve_dump_address(0x1004), None);
        // Primary translation unaffected
        assert_eq!(translator.translate_capture_address(0x1004), Some(0x2004));
        assert_eq!(translator.translate_capture_address(CAPTURE_HEAP + 2), Some(REPLAY_HEAP + 130));

        translator.destroy(key(3));
        assert_eq!(translator.resolve_dump_address(0x2004), None);
    }

    proptest! {
        #[test]
        fn prop_capture_round_trip(
            sizes in proptest::collection::vec(1u64..4096, 1..16),
            pick in any::<proptest::sample::Index>(),
            frac in 0.0f64..1.0
        ) {
            let translator = AddressTranslator::new();
            let mut capture = 0x1_0000u64;
            let mut replay = 0x80_0000u64;
            for (i, size) in sizes.iter().enumerate() {
                translator.add_committed_resource(
                    key(i as u32 + 1),
                    AddressRange::new(capture, *size),
                    AddressRange::new(replay, *size + 64),
                );
                capture += size.next_multiple_of(256);
                replay += (size + 64).next_multiple_of(4096);
            }

            let i = pick.index(sizes.len());
            let info = translator.resource_info(key(i as u32 + 1)).unwrap();
            let range = info.capture.unwrap();
            let offset = ((range.size as f64) * frac) as u64 % range.size;

            let found = translator.get_resource_info_by_capture_address(range.start + offset).unwrap();
            prop_assert_eq!(found.key, info.key);
            prop_assert_eq!(found.capture.unwrap().offset_of(range.start + offset), Some(offset));
        }
    }
}
