//! Heap placement reconciliation across replay runs.
//!
//! Replay drivers may report larger footprints or stricter alignments than
//! the capture driver did, so captured offsets inside a heap can make
//! resources overlap. The reconciler rewrites offsets in-run where it can,
//! computes a canonical layout when a heap closes, and persists it so the
//! next run starts from offsets that already fit.

use crate::record::{PLACEMENT_FILE_NAME, PlacementRecord};
use crate::redistribute::{Marker, markers_overlap, redistribute_in_heap, redistribute_resources};
use crate::store::{LogStats, PlacementLog};
use gpureplay_core::{
    AllocationInfo, CoreError, DescriptionSnapshot, GpuDevice, HeapDesc, ObjectKey, ResourceDesc,
    is_aligned,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, error, info, warn};

/// Reconciler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Placement log location
    pub placement_file: PathBuf,
    /// Hooks are never called concurrently
    pub single_threaded: bool,
    /// Scan for unexpected overlaps after every placed creation
    pub portability_checks: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            placement_file: PathBuf::from(PLACEMENT_FILE_NAME),
            single_threaded: false,
            portability_checks: false,
        }
    }
}

/// A placed resource creation about to be issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedResourceCreate {
    /// Owning heap
    pub heap: ObjectKey,
    /// Resource being created
    pub resource: ObjectKey,
    /// Offset recorded in the capture
    pub capture_offset: u64,
    /// Offset to issue; rewritten by the reconciler
    pub offset: u64,
    /// Creation descriptor
    pub desc: ResourceDesc,
    /// Footprint the capture driver reported
    pub captured: AllocationInfo,
}

impl PlacedResourceCreate {
    /// Create a request at the captured offset
    #[must_use]
    pub fn new(
        heap: ObjectKey,
        resource: ObjectKey,
        offset: u64,
        desc: ResourceDesc,
        captured: AllocationInfo,
    ) -> Self {
        Self {
            heap,
            resource,
            capture_offset: offset,
            offset,
            desc,
            captured,
        }
    }
}

/// Reconciler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerStats {
    /// Heap creations whose size was raised
    pub heaps_resized: u64,
    /// Offsets taken from the placement log
    pub offsets_from_log: u64,
    /// Offsets shifted in-run
    pub offsets_shifted: u64,
    /// Shifts that could not be applied this run
    pub deferred_shifts: u64,
    /// Log records ignored because the descriptor changed
    pub stale_records: u64,
    /// Heaps whose canonical layout outgrew them
    pub heaps_flagged: u64,
    /// Resources dropped from persistence
    pub dropped: u64,
    /// Unexpected overlaps found by portability checks
    pub overlap_errors: u64,
    /// Records written to the log
    pub records_written: u64,
}

#[derive(Debug, Clone, Copy)]
struct LivePlacement {
    capture_offset: u64,
    offset: u64,
    captured_size: u64,
    size: u64,
    alignment: u64,
    description: DescriptionSnapshot,
    released: bool,
}

impl LivePlacement {
    fn current_marker(&self) -> Marker {
        Marker {
            start: self.offset,
            recorded_size: self.captured_size,
            size: self.size,
            alignment: self.alignment,
            fixed: true,
        }
    }

    fn captured_marker(&self) -> Marker {
        Marker {
            start: self.capture_offset,
            recorded_size: self.captured_size,
            size: self.size,
            alignment: self.alignment,
            fixed: false,
        }
    }
}

#[derive(Debug)]
struct LiveHeap {
    size: u64,
    alignment: u64,
    placements: IndexMap<ObjectKey, LivePlacement>,
}

#[derive(Debug)]
struct ReconcilerState {
    log: PlacementLog,
    heaps: HashMap<ObjectKey, LiveHeap>,
    owners: HashMap<ObjectKey, ObjectKey>,
    pending: IndexMap<ObjectKey, Vec<PlacementRecord>>,
    written: HashSet<ObjectKey>,
    dropped: HashSet<(ObjectKey, ObjectKey)>,
    stats: ReconcilerStats,
}

impl ReconcilerState {
    fn store_placement_entry(&mut self, heap: ObjectKey, record: PlacementRecord) -> bool {
        if self.written.contains(&heap) {
            debug!(heap = %heap, resource = %record.resource_key, "heap already written this run");
            return false;
        }
        self.pending.entry(heap).or_default().push(record);
        true
    }

    fn drop_resource(&mut self, heap: ObjectKey, resource: ObjectKey) {
        if self.dropped.insert((heap, resource)) {
            self.stats.dropped += 1;
        }
    }

    /// Canonical layout of a closing heap
    fn queue_canonical_records(&mut self, heap: ObjectKey, live: &LiveHeap) {
        let placements: Vec<(ObjectKey, LivePlacement)> = live
            .placements
            .iter()
            .filter(|(resource, _)| !self.dropped.contains(&(heap, **resource)))
            .map(|(resource, placement)| (*resource, *placement))
            .collect();
        let markers: Vec<Marker> = placements
            .iter()
            .map(|(_, placement)| placement.captured_marker())
            .collect();
        let layout = redistribute_in_heap(&markers, live.size);
        if layout.exceeds(live.size) {
            self.stats.heaps_flagged += 1;
            warn!(
                heap = %heap,
                size = live.size,
                next_run = layout.required_heap_size(live.alignment),
                "heap will be grown next run"
            );
        }
        for ((resource, placement), start) in placements.iter().zip(&layout.starts) {
            let record = PlacementRecord {
                heap_key: heap,
                resource_key: *resource,
                capture_offset: placement.capture_offset,
                current_offset: *start,
                size: placement.size,
                alignment: placement.alignment,
                description: placement.description,
            };
            self.store_placement_entry(heap, record);
        }
    }

    fn flush_heap(&mut self, heap: ObjectKey) -> usize {
        let records = self.pending.shift_remove(&heap).unwrap_or_default();
        self.written.insert(heap);
        match self.log.append(&records) {
            Ok(written) => {
                self.stats.records_written += written as u64;
                written
            }
            Err(err) => {
                error!(heap = %heap, error = %err, "failed to persist placement data");
                0
            }
        }
    }
}

/// Reconciles placed resource offsets with the persisted canonical layout
#[derive(Debug)]
pub struct HeapPlacementReconciler {
    state: Mutex<ReconcilerState>,
    single_threaded: bool,
    portability_checks: bool,
}

impl HeapPlacementReconciler {
    /// Create a reconciler, loading the placement log
    #[must_use]
    pub fn new(config: &ReconcilerConfig) -> Self {
        let state = ReconcilerState {
            log: PlacementLog::open(&config.placement_file),
            heaps: HashMap::new(),
            owners: HashMap::new(),
            pending: IndexMap::new(),
            written: HashSet::new(),
            dropped: HashSet::new(),
            stats: ReconcilerStats::default(),
        };
        Self {
            state: Mutex::new(state),
            single_threaded: config.single_threaded,
            portability_checks: config.portability_checks,
        }
    }

    fn state(&self) -> MutexGuard<'_, ReconcilerState> {
        if !self.single_threaded {
            return self.state.lock().unwrap_or_else(PoisonError::into_inner);
        }
        match self.state.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                error!("placement hook entered concurrently in single-threaded mode");
                self.state.lock().unwrap_or_else(PoisonError::into_inner)
            }
        }
    }

    /// Raise a heap creation to its canonical size
    ///
    /// Returns `true` if `desc` was rewritten.
    pub fn on_pre_create_heap(&self, heap: ObjectKey, desc: &mut HeapDesc) -> bool {
        let mut state = self.state();
        let Some(canonical) = state
            .log
            .heap(heap)
            .map(|placements| placements.canonical_size(desc.effective_alignment()))
        else {
            return false;
        };
        if canonical <= desc.size {
            return false;
        }
        info!(heap = %heap, requested = desc.size, canonical, "growing heap to canonical size");
        desc.size = canonical;
        state.stats.heaps_resized += 1;
        true
    }

    /// Track a created heap
    pub fn on_post_create_heap(&self, heap: ObjectKey, desc: &HeapDesc) {
        let mut state = self.state();
        let live = LiveHeap {
            size: desc.size,
            alignment: desc.effective_alignment(),
            placements: IndexMap::new(),
        };
        if state.heaps.insert(heap, live).is_some() {
            warn!(heap = %heap, "heap key reused while still live");
        }
    }

    /// Choose the offset for a placed resource creation
    ///
    /// Uses the canonical offset when the log has a matching record, then
    /// shifts past already created resources of the heap that grew. A shift
    /// that does not fit the heap is left for the next run.
    pub fn on_pre_create_placed_resource(
        &self,
        create: &mut PlacedResourceCreate,
        device: &dyn GpuDevice,
    ) {
        let mut state = self.state();
        let mut requested = create.offset;
        if let Some(record) = state.log.record(create.heap, create.resource).copied() {
            if record.description == create.desc.snapshot() {
                if record.current_offset != requested {
                    debug!(
                        heap = %create.heap,
                        resource = %create.resource,
                        captured = requested,
                        canonical = record.current_offset,
                        "using canonical offset"
                    );
                }
                requested = record.current_offset;
                state.stats.offsets_from_log += 1;
            } else {
                warn!(
                    heap = %create.heap,
                    resource = %create.resource,
                    "placement record describes another resource, ignoring it"
                );
                state.stats.stale_records += 1;
            }
        }
        create.offset = requested;

        let Some(heap) = state.heaps.get(&create.heap) else {
            return;
        };
        let heap_size = heap.size;
        let info = device.allocation_info(&create.desc);
        let mut markers: Vec<Marker> = heap
            .placements
            .values()
            .filter(|p| !p.released)
            .map(LivePlacement::current_marker)
            .collect();
        let new_index = markers.len();
        let marker = Marker {
            start: requested,
            recorded_size: create.captured.size,
            size: info.size,
            alignment: info.alignment,
            fixed: false,
        };
        markers.push(marker);
        let layout = redistribute_resources(&markers);
        let candidate = layout.starts[new_index];
        let fits = candidate.saturating_add(info.size) <= heap_size;
        // Conflicts between already created resources do not concern this one
        let moved = Marker {
            start: candidate,
            ..marker
        };
        let recorded = marker.as_recorded();
        let blocked = layout.conflicts.contains(&new_index)
            || markers[..new_index].iter().any(|created| {
                markers_overlap(&moved, created)
                    && !markers_overlap(&recorded, &created.as_recorded())
            });

        if blocked {
            warn!(
                heap = %create.heap,
                resource = %create.resource,
                offset = requested,
                "grown resource overlaps created resources, deferring to next run"
            );
            state.stats.deferred_shifts += 1;
        } else if candidate != requested && fits {
            debug!(
                heap = %create.heap,
                resource = %create.resource,
                from = requested,
                to = candidate,
                "shifted past grown resource"
            );
            create.offset = candidate;
            state.stats.offsets_shifted += 1;
        } else if candidate != requested {
            warn!(
                heap = %create.heap,
                resource = %create.resource,
                offset = requested,
                needed = candidate,
                heap_size,
                "shifted offset exceeds heap, deferring to next run"
            );
            state.stats.deferred_shifts += 1;
        }
    }

    /// Validate and record a placed creation
    ///
    /// `created` is `false` when the driver rejected the creation. Violations
    /// are logged and the resource is left out of the persisted layout.
    pub fn on_post_create_placed_resource(
        &self,
        create: &PlacedResourceCreate,
        device: &dyn GpuDevice,
        created: bool,
    ) {
        let mut state = self.state();
        if !created {
            warn!(heap = %create.heap, resource = %create.resource, "placed creation failed");
            state.drop_resource(create.heap, create.resource);
            return;
        }

        let info = device.allocation_info(&create.desc);
        let Some(heap) = state.heaps.get(&create.heap) else {
            warn!(heap = %create.heap, resource = %create.resource, "placed in untracked heap");
            return;
        };
        let heap_size = heap.size;

        let reason = if !is_aligned(info.alignment, create.offset) {
            Some(format!("offset {} not aligned to {}", create.offset, info.alignment))
        } else if create.offset.saturating_add(info.size) > heap_size {
            Some(format!(
                "[{}, {}) exceeds heap size {}",
                create.offset,
                create.offset.saturating_add(info.size),
                heap_size
            ))
        } else {
            None
        };
        if let Some(reason) = reason {
            let err = CoreError::PlacementViolation {
                heap: create.heap,
                resource: create.resource,
                reason,
            };
            error!(error = %err, "placed resource left out of placement data");
            state.drop_resource(create.heap, create.resource);
            return;
        }

        let placement = LivePlacement {
            capture_offset: create.capture_offset,
            offset: create.offset,
            captured_size: create.captured.size,
            size: info.size,
            alignment: info.alignment,
            description: create.desc.snapshot(),
            released: false,
        };
        state.dropped.remove(&(create.heap, create.resource));
        state.owners.insert(create.resource, create.heap);

        let mut overlaps = Vec::new();
        if let Some(heap) = state.heaps.get_mut(&create.heap) {
            if self.portability_checks {
                let current = placement.current_marker();
                let captured = placement.captured_marker().as_recorded();
                overlaps = heap
                    .placements
                    .iter()
                    .filter(|(key, other)| **key != create.resource && !other.released)
                    .filter(|(_, other)| markers_overlap(&current, &other.current_marker()))
                    .filter(|(_, other)| {
                        !markers_overlap(&captured, &other.captured_marker().as_recorded())
                    })
                    .map(|(key, _)| *key)
                    .collect();
            }
            heap.placements.insert(create.resource, placement);
        }
        for other in &overlaps {
            error!(
                heap = %create.heap,
                resource = %create.resource,
                other = %other,
                "unexpected overlap between non-aliased resources"
            );
        }
        state.stats.overlap_errors += overlaps.len() as u64;
    }

    /// Note that a placed resource was released
    ///
    /// The placement keeps its slot in the heap's persisted layout but no
    /// longer constrains later creations this run.
    pub fn on_resource_released(&self, resource: ObjectKey) {
        let mut state = self.state();
        let Some(heap) = state.owners.remove(&resource) else {
            return;
        };
        if let Some(placement) = state
            .heaps
            .get_mut(&heap)
            .and_then(|live| live.placements.get_mut(&resource))
        {
            placement.released = true;
        }
    }

    /// Queue one record for the heap's next flush
    ///
    /// Returns `false` if the heap was already written this run.
    pub fn store_placement_entry(&self, heap: ObjectKey, record: PlacementRecord) -> bool {
        self.state().store_placement_entry(heap, record)
    }

    /// Compute and persist the canonical layout of a closing heap
    ///
    /// Returns the number of records written.
    pub fn on_heap_released(&self, heap: ObjectKey) -> usize {
        let mut state = self.state();
        let Some(live) = state.heaps.remove(&heap) else {
            return 0;
        };
        for resource in live.placements.keys() {
            state.owners.remove(resource);
        }
        state.queue_canonical_records(heap, &live);
        state.flush_heap(heap)
    }

    /// Close every live heap and persist everything queued
    ///
    /// Returns the number of records written.
    pub fn flush(&self) -> usize {
        let mut state = self.state();
        let mut heaps: Vec<ObjectKey> = state.heaps.keys().copied().collect();
        heaps.sort_unstable();
        for heap in &heaps {
            if let Some(live) = state.heaps.remove(heap) {
                state.queue_canonical_records(*heap, &live);
            }
        }
        state.owners.clear();

        let pending: Vec<ObjectKey> = state.pending.keys().copied().collect();
        pending
            .into_iter()
            .map(|heap| state.flush_heap(heap))
            .sum()
    }

    /// Persisted canonical offset for `(heap, resource)`
    #[must_use]
    pub fn canonical_offset(&self, heap: ObjectKey, resource: ObjectKey) -> Option<u64> {
        self.state()
            .log
            .record(heap, resource)
            .map(|record| record.current_offset)
    }

    /// Persisted canonical size of `heap`
    #[must_use]
    pub fn canonical_heap_size(&self, heap: ObjectKey, alignment: u64) -> Option<u64> {
        self.state()
            .log
            .heap(heap)
            .map(|placements| placements.canonical_size(alignment))
    }

    /// Resource is excluded from persistence
    #[must_use]
    pub fn is_dropped(&self, heap: ObjectKey, resource: ObjectKey) -> bool {
        self.state().dropped.contains(&(heap, resource))
    }

    /// Reconciler statistics
    #[must_use]
    pub fn stats(&self) -> ReconcilerStats {
        self.state().stats.clone()
    }

    /// Placement log statistics
    #[must_use]
    pub fn log_stats(&self) -> LogStats {
        self.state().log.stats().clone()
    }
}
