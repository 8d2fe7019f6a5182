//! Replay-side session.
//!
//! Owns the dual-space address translator and, when enabled, the heap
//! placement reconciler. The interception layer calls the hooks around each
//! real driver call; [`ReplaySession::replay`] drives a recorded stream
//! through the same hooks.

use crate::config::SessionConfig;
use crate::trace::{CallEvent, CallTrace};
use gpureplay_address::{AddressRange, AddressTranslator, PlacedRange, Space};
use gpureplay_core::{CallExecutor, CoreError, GpuAddress, HeapDesc, ObjectKey, ResourceDesc};
use gpureplay_placement::{HeapPlacementReconciler, PlacedResourceCreate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Where a placed resource ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementOutcome {
    /// Owning heap
    pub heap: ObjectKey,
    /// Placed resource
    pub resource: ObjectKey,
    /// Offset recorded in the capture
    pub capture_offset: u64,
    /// Offset issued at replay
    pub offset: u64,
    /// Driver accepted the creation
    pub created: bool,
}

/// A captured address and its replay counterpart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    /// Capture-space address
    pub capture_address: GpuAddress,
    /// Replay-space address, if the byte is tracked
    pub replay_address: Option<GpuAddress>,
}

/// Summary of one replayed stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Events processed
    pub events: usize,
    /// Heaps created
    pub heaps: usize,
    /// Committed resources created
    pub committed: usize,
    /// Placed resources created
    pub placed: usize,
    /// Releases processed
    pub released: usize,
    /// Driver calls that failed
    pub failures: usize,
    /// Placed creations in stream order
    pub placements: Vec<PlacementOutcome>,
    /// Address translations in stream order
    pub translations: Vec<Translation>,
}

impl ReplayReport {
    /// Offset issued for `resource`
    #[must_use]
    pub fn offset_of(&self, resource: ObjectKey) -> Option<u64> {
        self.placements
            .iter()
            .rev()
            .find(|p| p.resource == resource)
            .map(|p| p.offset)
    }
}

/// One replay run
#[derive(Debug)]
pub struct ReplaySession<D: CallExecutor> {
    config: SessionConfig,
    device: Arc<D>,
    translator: AddressTranslator,
    reconciler: Option<HeapPlacementReconciler>,
    heaps: Mutex<HashSet<ObjectKey>>,
    released_warned: AtomicBool,
}

impl<D: CallExecutor> ReplaySession<D> {
    /// Create a session over `device`
    ///
    /// Loads the placement log when reconciliation is enabled.
    #[must_use]
    pub fn new(device: Arc<D>, config: SessionConfig) -> Self {
        let translator = AddressTranslator::new();
        if config.dump_lookup {
            translator.enable_dump_lookup();
        }
        let reconciler = config
            .placement_reconciliation
            .then(|| HeapPlacementReconciler::new(&config.reconciler_config()));
        Self {
            config,
            device,
            translator,
            reconciler,
            heaps: Mutex::new(HashSet::new()),
            released_warned: AtomicBool::new(false),
        }
    }

    fn heaps(&self) -> MutexGuard<'_, HashSet<ObjectKey>> {
        self.heaps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replay driver
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Address translator
    #[must_use]
    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    /// Placement reconciler, if enabled
    #[must_use]
    pub fn reconciler(&self) -> Option<&HeapPlacementReconciler> {
        self.reconciler.as_ref()
    }

    /// Before a heap creation: may raise its size
    pub fn on_pre_create_heap(&self, key: ObjectKey, desc: &mut HeapDesc) {
        if let Some(reconciler) = &self.reconciler {
            reconciler.on_pre_create_heap(key, desc);
        }
    }

    /// After a heap creation
    pub fn on_post_create_heap(
        &self,
        key: ObjectKey,
        desc: &HeapDesc,
        capture_base: Option<GpuAddress>,
    ) {
        self.heaps().insert(key);
        if let Some(reconciler) = &self.reconciler {
            reconciler.on_post_create_heap(key, desc);
        }
        let replay_base = if desc.deny_buffers {
            None
        } else {
            self.device.probe_heap_base(key)
        };
        self.translator
            .add_heap(key, capture_base, replay_base, desc.size);
    }

    /// Before a placed creation: may rewrite `create.offset`
    pub fn on_pre_create_placed_resource(&self, create: &mut PlacedResourceCreate) {
        if let Some(reconciler) = &self.reconciler {
            reconciler.on_pre_create_placed_resource(create, &*self.device);
        }
    }

    /// After a placed creation
    pub fn on_post_create_placed_resource(&self, create: &PlacedResourceCreate, created: bool) {
        if let Some(reconciler) = &self.reconciler {
            reconciler.on_post_create_placed_resource(create, &*self.device, created);
        }
        if !created {
            return;
        }
        let live = self.device.allocation_info(&create.desc);
        self.translator.add_placed_resource(
            create.resource,
            create.heap,
            PlacedRange {
                capture_offset: create.capture_offset,
                capture_size: create.captured.size,
                replay_offset: create.offset,
                replay_size: live.size,
            },
        );
    }

    /// After a committed creation
    pub fn on_create_committed_resource(
        &self,
        key: ObjectKey,
        desc: &ResourceDesc,
        capture_address: Option<GpuAddress>,
    ) {
        if !desc.is_buffer() {
            return;
        }
        match (capture_address, self.device.resource_address(key)) {
            (Some(capture), Some(replay)) => self.translator.add_committed_resource(
                key,
                AddressRange::new(capture, desc.width),
                AddressRange::new(replay, desc.width),
            ),
            (capture, replay) => {
                debug!(resource = %key, ?capture, ?replay, "committed buffer missing an address");
            }
        }
    }

    /// A heap or resource is being released
    pub fn destroy_interface(&self, key: ObjectKey) {
        let was_heap = self.heaps().remove(&key);
        if let Some(reconciler) = &self.reconciler {
            if was_heap {
                reconciler.on_heap_released(key);
            } else {
                reconciler.on_resource_released(key);
            }
        }
        self.translator.destroy(key);
    }

    /// Replay address of byte `offset` within `key`
    ///
    /// Heaps resolve to their probed base. A released placed resource still
    /// resolves to its last address; the first such lookup of the session
    /// logs a warning.
    #[must_use]
    pub fn get_address(&self, key: ObjectKey, offset: u64) -> GpuAddress {
        if key.is_null() {
            return 0;
        }
        let base = if let Some(info) = self.translator.resource_info(key) {
            info.replay.map(|range| range.start)
        } else if let Some(base) = self.translator.heap_base(key, Space::Replay) {
            Some(base)
        } else {
            let released = self
                .translator
                .released_info(key)
                .filter(|info| info.placement.is_some())
                .and_then(|info| info.replay);
            if released.is_some() && !self.released_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    resource = %key,
                    "address requested for a released placed resource, using last known address"
                );
            }
            released.map(|range| range.start)
        };
        match base.and_then(|base| base.checked_add(offset)) {
            Some(address) => address,
            None => {
                error!(offset, "{}", CoreError::missing_key("replay address", key));
                0
            }
        }
    }

    /// Replay address of the byte at capture address `addr`
    #[must_use]
    pub fn translate_capture_address(&self, addr: GpuAddress) -> Option<GpuAddress> {
        self.translator.translate_capture_address(addr)
    }

    /// Persist placement data for every heap still open
    ///
    /// Returns the number of records written.
    pub fn finish(&self) -> usize {
        let written = self.reconciler.as_ref().map_or(0, HeapPlacementReconciler::flush);
        info!(records = written, "replay session finished");
        written
    }

    /// Drive a recorded stream through the driver and the hooks
    pub fn replay(&self, trace: &CallTrace) -> ReplayReport {
        let mut report = ReplayReport::default();
        for event in trace.reader() {
            self.process_event(&mut report, event);
        }
        debug!(
            events = report.events,
            placed = report.placed,
            failures = report.failures,
            "replayed call trace"
        );
        report
    }

    fn process_event(&self, report: &mut ReplayReport, event: CallEvent) {
        report.events += 1;
        match event {
            CallEvent::CreateHeap {
                key,
                mut desc,
                capture_base,
            } => {
                self.on_pre_create_heap(key, &mut desc);
                match self.device.create_heap(key, &desc) {
                    Ok(()) => {
                        self.on_post_create_heap(key, &desc, capture_base);
                        report.heaps += 1;
                    }
                    Err(err) => {
                        warn!(heap = %key, error = %err, "heap creation failed");
                        report.failures += 1;
                    }
                }
            }
            CallEvent::CreateCommittedResource {
                key,
                desc,
                capture_address,
            } => match self.device.create_committed_resource(key, &desc) {
                Ok(()) => {
                    self.on_create_committed_resource(key, &desc, capture_address);
                    report.committed += 1;
                }
                Err(err) => {
                    warn!(resource = %key, error = %err, "committed creation failed");
                    report.failures += 1;
                }
            },
            CallEvent::CreatePlacedResource {
                key,
                heap,
                offset,
                desc,
                captured,
            } => {
                let mut create = PlacedResourceCreate::new(heap, key, offset, desc, captured);
                self.on_pre_create_placed_resource(&mut create);
                let created = match self
                    .device
                    .create_placed_resource(key, heap, create.offset, &desc)
                {
                    Ok(()) => {
                        report.placed += 1;
                        true
                    }
                    Err(err) => {
                        warn!(resource = %key, heap = %heap, error = %err, "placed creation failed");
                        report.failures += 1;
                        false
                    }
                };
                self.on_post_create_placed_resource(&create, created);
                report.placements.push(PlacementOutcome {
                    heap,
                    resource: key,
                    capture_offset: offset,
                    offset: create.offset,
                    created,
                });
            }
            CallEvent::Release { key } => {
                self.destroy_interface(key);
                self.device.release(key);
                report.released += 1;
            }
            CallEvent::TranslateAddress { capture_address } => {
                report.translations.push(Translation {
                    capture_address,
                    replay_address: self.translate_capture_address(capture_address),
                });
            }
        }
    }
}
