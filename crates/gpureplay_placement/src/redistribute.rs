//! Forward-only redistribution of resources inside one heap.
//!
//! When the replay driver reports larger footprints than the capture did,
//! resources that followed a grown one get pushed forward just far enough to
//! stop overlapping, keeping their relative order and their alignment.
//! Markers whose recorded intervals overlap are intentional aliases and move
//! as one block.

use gpureplay_core::{combine_alignment, heap_aligned_offset};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One resource inside a heap, as seen by the redistribution algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    /// Recorded start offset
    pub start: u64,
    /// Footprint when the start was recorded
    pub recorded_size: u64,
    /// Live footprint
    pub size: u64,
    /// Placement alignment
    pub alignment: u64,
    /// Already created; cannot move
    #[serde(default)]
    pub fixed: bool,
}

impl Marker {
    /// Create a movable marker whose live size equals its recorded size
    #[must_use]
    pub const fn new(start: u64, size: u64, alignment: u64) -> Self {
        Self {
            start,
            recorded_size: size,
            size,
            alignment,
            fixed: false,
        }
    }

    /// Set the live size
    #[must_use]
    pub const fn with_live_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Pin the marker in place
    #[must_use]
    pub const fn fixed(mut self) -> Self {
        self.fixed = true;
        self
    }

    /// End of the live footprint
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    /// End of the recorded footprint
    #[must_use]
    pub const fn recorded_end(&self) -> u64 {
        self.start.saturating_add(self.recorded_size)
    }

    /// Live footprint exceeds the recorded one
    #[must_use]
    pub const fn grew(&self) -> bool {
        self.size > self.recorded_size
    }

    /// The marker as it was recorded
    #[must_use]
    pub const fn as_recorded(&self) -> Self {
        Self {
            size: self.recorded_size,
            ..*self
        }
    }
}

/// Half-open overlap test on `[start, start + size)`
#[must_use]
pub fn markers_overlap(a: &Marker, b: &Marker) -> bool {
    a.size > 0 && b.size > 0 && a.start < b.end() && b.start < a.end()
}

/// First marker after `grown` that starts inside its growth region
///
/// `markers` must be sorted by start. The growth region is
/// `[recorded_end, end)` of the grown marker; markers starting before the
/// recorded end alias the grown marker and are not reported.
#[must_use]
pub fn find_first_marker_in_increment_zone(markers: &[Marker], grown: usize) -> Option<usize> {
    let marker = markers.get(grown)?;
    if !marker.grew() {
        return None;
    }
    let zone_start = marker.recorded_end();
    let zone_end = marker.end();
    markers
        .iter()
        .enumerate()
        .skip(grown + 1)
        .take_while(|(_, m)| m.start < zone_end)
        .find(|(_, m)| m.start >= zone_start)
        .map(|(index, _)| index)
}

/// Result of a redistribution pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redistribution {
    /// New start per marker, in input order
    pub starts: Vec<u64>,
    /// End of the furthest live footprint
    pub end: u64,
    /// Fixed markers that would have had to move, in input order
    pub conflicts: Vec<usize>,
}

impl Redistribution {
    /// Number of markers whose start changed
    #[must_use]
    pub fn moved(&self, markers: &[Marker]) -> usize {
        self.starts
            .iter()
            .zip(markers)
            .filter(|(start, marker)| **start != marker.start)
            .count()
    }

    /// Layout needs more than `heap_size` bytes
    #[must_use]
    pub const fn exceeds(&self, heap_size: u64) -> bool {
        self.end > heap_size
    }

    /// Heap size able to hold the layout
    #[must_use]
    pub fn required_heap_size(&self, heap_alignment: u64) -> u64 {
        heap_aligned_offset(heap_alignment, self.end)
    }
}

/// Compute new starts for `markers` so that grown footprints stop overlapping
/// their successors
///
/// Markers keep their relative order and alignment and only ever move
/// forward. Fixed markers never move; a fixed marker that would need to is
/// reported in [`Redistribution::conflicts`].
#[must_use]
pub fn redistribute_resources(markers: &[Marker]) -> Redistribution {
    let mut order: Vec<usize> = (0..markers.len()).collect();
    order.sort_by_key(|&index| (markers[index].start, index));
    let sorted: Vec<Marker> = order.iter().map(|&index| markers[index]).collect();

    let mut starts: Vec<u64> = markers.iter().map(|m| m.start).collect();
    let mut conflicts = Vec::new();

    let needs_shift = (0..sorted.len())
        .any(|index| find_first_marker_in_increment_zone(&sorted, index).is_some());
    if needs_shift {
        let mut frontier = 0u64;
        let mut cursor = 0;
        while cursor < sorted.len() {
            // Chain recorded overlaps into one alias group
            let mut group_end = cursor + 1;
            let mut recorded = sorted[cursor].as_recorded();
            while group_end < sorted.len()
                && (markers_overlap(&recorded, &sorted[group_end].as_recorded())
                    || (recorded.size > 0 && sorted[group_end].start == recorded.start))
            {
                let next = sorted[group_end];
                let end = recorded.recorded_end().max(next.recorded_end());
                recorded.recorded_size = end - recorded.start;
                recorded.size = recorded.recorded_size;
                group_end += 1;
            }
            let group = cursor..group_end;

            let group_start = sorted[cursor].start;
            let alignment = group
                .clone()
                .fold(1, |acc, i| combine_alignment(acc, sorted[i].alignment));
            // Align the new start, not the distance: recorded starts need not
            // satisfy the live alignment
            let mut shift = if frontier > group_start {
                heap_aligned_offset(alignment, frontier) - group_start
            } else {
                0
            };
            if shift > 0 && group.clone().any(|i| sorted[i].fixed) {
                debug!(start = group_start, shift, "fixed marker cannot move");
                conflicts.extend(group.clone().map(|i| order[i]));
                shift = 0;
            }

            for i in group {
                let new_start = sorted[i].start.saturating_add(shift);
                starts[order[i]] = new_start;
                frontier = frontier.max(new_start.saturating_add(sorted[i].size));
            }
            cursor = group_end;
        }
        conflicts.sort_unstable();
    }

    let end = starts
        .iter()
        .zip(markers)
        .map(|(start, marker)| start.saturating_add(marker.size))
        .max()
        .unwrap_or(0);

    Redistribution {
        starts,
        end,
        conflicts,
    }
}

/// Redistribute and log when the layout no longer fits the heap
#[must_use]
pub fn redistribute_in_heap(markers: &[Marker], heap_size: u64) -> Redistribution {
    let result = redistribute_resources(markers);
    if result.exceeds(heap_size) {
        warn!(
            heap_size,
            required = result.end,
            "redistributed layout exceeds heap, heap grows next run"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_growth_pushes_successor() {
        // R1 [0,256) grows to 320, R2 [256,512) follows
        let markers = [
            Marker::new(0, 256, 64).with_live_size(320),
            Marker::new(256, 256, 64),
        ];
        let result = redistribute_resources(&markers);
        assert_eq!(result.starts, vec![0, 320]);
        assert_eq!(result.end, 576);
        assert!(!result.exceeds(1024));
        assert!(result.conflicts.is_empty());
        assert_eq!(result.moved(&markers), 1);
    }

    #[test]
    fn test_gap_absorbs_growth() {
        let markers = [
            Marker::new(0, 256, 64).with_live_size(300),
            Marker::new(512, 256, 64),
        ];
        let result = redistribute_resources(&markers);
        assert_eq!(result.starts, vec![0, 512]);
        assert_eq!(result.moved(&markers), 0);
    }

    #[test]
    fn test_shift_cascades_forward() {
        let markers = [
            Marker::new(0, 256, 256).with_live_size(512),
            Marker::new(256, 256, 256),
            Marker::new(512, 256, 256),
            Marker::new(1024, 256, 256),
        ];
        let result = redistribute_resources(&markers);
        assert_eq!(result.starts, vec![0, 512, 768, 1024]);
    }

    #[test]
    fn test_shift_respects_alignment() {
        let markers = [
            Marker::new(0, 256, 64).with_live_size(300),
            Marker::new(4096, 64, 64),
            Marker::new(256, 256, 256),
        ];
        let result = redistribute_resources(&markers);
        // Input order is kept in the output
        assert_eq!(result.starts, vec![0, 4096, 512]);
    }

    #[test]
    fn test_shift_aligns_start_to_live_alignment() {
        // R2 was recorded at 256 but the replay driver wants 512-byte alignment
        let markers = [
            Marker::new(0, 256, 64).with_live_size(320),
            Marker::new(256, 256, 512),
        ];
        let result = redistribute_resources(&markers);
        assert_eq!(result.starts, vec![0, 512]);
        assert_eq!(result.end, 768);
    }

    #[test]
    fn test_alias_group_start_aligned_to_all_members() {
        let markers = [
            Marker::new(0, 192, 64).with_live_size(320),
            Marker::new(192, 256, 256),
            Marker::new(192, 128, 64),
        ];
        let result = redistribute_resources(&markers);
        assert_eq!(result.starts, vec![0, 512, 512]);
    }

    #[test]
    fn test_input_order_independent() {
        let forward = [
            Marker::new(0, 256, 64).with_live_size(320),
            Marker::new(256, 256, 64),
        ];
        let backward = [forward[1], forward[0]];
        let result = redistribute_resources(&backward);
        assert_eq!(result.starts, vec![320, 0]);
    }

    #[test]
    fn test_aliases_move_together() {
        let markers = [
            Marker::new(0, 256, 64).with_live_size(320),
            Marker::new(256, 128, 64),
            Marker::new(256, 128, 64),
            Marker::new(320, 64, 64),
        ];
        let result = redistribute_resources(&markers);
        assert_eq!(result.starts, vec![0, 320, 320, 384]);
    }

    #[test]
    fn test_fixed_marker_conflict() {
        let markers = [
            Marker::new(0, 256, 64).with_live_size(320),
            Marker::new(256, 256, 64).fixed(),
            Marker::new(512, 256, 64),
        ];
        let result = redistribute_resources(&markers);
        assert_eq!(result.starts[1], 256);
        assert_eq!(result.conflicts, vec![1]);
        // Successors still clear the fixed marker
        assert_eq!(result.starts[2], 512);
    }

    #[test]
    fn test_fixed_predecessor_pushes_new_marker() {
        let markers = [
            Marker::new(0, 256, 64).with_live_size(320).fixed(),
            Marker::new(256, 256, 64),
        ];
        let result = redistribute_resources(&markers);
        assert_eq!(result.starts, vec![0, 320]);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_heap_growth_flag() {
        let markers = [
            Marker::new(0, 512, 64).with_live_size(640),
            Marker::new(512, 512, 64),
        ];
        let result = redistribute_in_heap(&markers, 1024);
        assert!(result.exceeds(1024));
        assert_eq!(result.end, 1152);
        assert_eq!(result.required_heap_size(1024), 2048);
    }

    #[test]
    fn test_empty() {
        let result = redistribute_resources(&[]);
        assert!(result.starts.is_empty());
        assert_eq!(result.end, 0);
    }

    #[test]
    fn test_markers_overlap_half_open() {
        let a = Marker::new(0, 256, 64);
        assert!(markers_overlap(&a, &Marker::new(255, 1, 1)));
        assert!(!markers_overlap(&a, &Marker::new(256, 64, 64)));
        assert!(!markers_overlap(&a, &Marker::new(128, 0, 64)));
    }

    #[test]
    fn test_increment_zone() {
        let markers = [
            Marker::new(0, 256, 64).with_live_size(400),
            Marker::new(128, 64, 64),
            Marker::new(384, 64, 64),
            Marker::new(448, 64, 64),
        ];
        assert_eq!(find_first_marker_in_increment_zone(&markers, 0), Some(2));
        assert_eq!(find_first_marker_in_increment_zone(&markers, 1), None);
        assert_eq!(find_first_marker_in_increment_zone(&markers, 9), None);
    }

    fn layout() -> impl Strategy<Value = Vec<Marker>> {
        prop::collection::vec((0u64..4, 1u64..8, 0u64..6, 0u32..3, any::<bool>()), 0..24)
            .prop_map(|specs| {
                let mut cursor = 0;
                specs
                    .into_iter()
                    .map(|(gap, size, growth, align_pow, fixed)| {
                        // Recorded starts only honor the capture alignment of 64
                        let alignment = 64u64 << align_pow;
                        let start = cursor + gap * 64;
                        cursor = start + size * 64;
                        let mut marker =
                            Marker::new(start, size * 64, alignment).with_live_size(size * 64 + growth * 32);
                        marker.fixed = fixed;
                        marker
                    })
                    .collect()
            })
    }

    fn movable(markers: Vec<Marker>) -> Vec<Marker> {
        markers
            .into_iter()
            .map(|mut m| {
                m.fixed = false;
                m
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_movable_layout_is_valid(markers in layout().prop_map(movable)) {
            let result = redistribute_resources(&markers);
            prop_assert!(result.conflicts.is_empty());
            for (i, marker) in markers.iter().enumerate() {
                let start = result.starts[i];
                prop_assert!(start >= marker.start);
                if start != marker.start {
                    prop_assert_eq!(start % marker.alignment, 0);
                }
                if markers.get(i + 1).is_some() {
                    prop_assert!(result.starts[i + 1] >= start + marker.size);
                }
            }
            let end = markers.iter().zip(&result.starts).map(|(m, s)| s + m.size).max().unwrap_or(0);
            prop_assert_eq!(result.end, end);
        }

        #[test]
        fn prop_no_growth_is_identity(markers in layout()) {
            let markers: Vec<Marker> = markers.into_iter().map(|m| m.with_live_size(m.recorded_size)).collect();
            let result = redistribute_resources(&markers);
            prop_assert_eq!(result.moved(&markers), 0);
            prop_assert!(result.conflicts.is_empty());
        }

        #[test]
        fn prop_moves_only_after_growth(markers in layout().prop_map(movable)) {
            let result = redistribute_resources(&markers);
            let first_grown = markers.iter().position(Marker::grew).unwrap_or(markers.len());
            let untouched = (first_grown + 1).min(markers.len());
            for i in 0..untouched {
                prop_assert_eq!(result.starts[i], markers[i].start);
            }
        }

        #[test]
        fn prop_fixed_never_move(markers in layout()) {
            let result = redistribute_resources(&markers);
            for (i, marker) in markers.iter().enumerate() {
                if marker.fixed {
                    prop_assert_eq!(result.starts[i], marker.start);
                }
                prop_assert!(result.starts[i] >= marker.start);
            }
        }

        #[test]
        fn prop_deterministic(markers in layout()) {
            prop_assert_eq!(redistribute_resources(&markers), redistribute_resources(&markers));
        }
    }
}
