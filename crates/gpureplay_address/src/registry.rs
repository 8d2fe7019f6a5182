//! Single address-space bookkeeping.
//!
//! Used on its own during capture, where one driver assigns every address.
//! All state lives behind one mutex; no I/O happens while it is held.

use crate::interval::{AddressRange, SpaceIndex};
use gpureplay_core::{CoreError, GpuAddress, GpuDevice, HeapDesc, ObjectKey, ResourceDesc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

/// Recorded linear address of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRecord {
    /// Address range of the resource
    pub range: AddressRange,
    /// Owning heap for placed resources
    pub heap: Option<ObjectKey>,
}

#[derive(Debug, Default)]
struct RegistryState {
    resources: HashMap<ObjectKey, AddressRecord>,
    heaps: HashMap<ObjectKey, AddressRange>,
    by_start: SpaceIndex,
    released: HashMap<ObjectKey, GpuAddress>,
}

impl RegistryState {
    fn insert_resource(&mut self, key: ObjectKey, record: AddressRecord) {
        if let Some(old) = self.resources.insert(key, record) {
            self.by_start.remove(old.range.start, key);
        }
        self.released.remove(&key);
        self.by_start.insert(record.range.start, key);
    }
}

/// `base + offset`, or 0 when the sum leaves the address space
fn offset_address(key: ObjectKey, base: GpuAddress, offset: u64) -> GpuAddress {
    base.checked_add(offset).unwrap_or_else(|| {
        error!(offset, "{}", CoreError::missing_key("address", key));
        0
    })
}

/// Key to address bookkeeper for one address space
#[derive(Debug, Default)]
pub struct AddressSpaceRegistry {
    state: Mutex<RegistryState>,
    released_warned: AtomicBool,
    released_lookups: AtomicU64,
}

impl AddressSpaceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the address of a committed resource.
    ///
    /// Only buffers carry a linear address; other shapes are ignored.
    pub fn create_resource(&self, key: ObjectKey, desc: &ResourceDesc, device: &dyn GpuDevice) {
        if !desc.is_buffer() {
            return;
        }
        let Some(base) = device.resource_address(key) else {
            warn!(resource = %key, "driver returned no address for committed buffer");
            return;
        };
        let record = AddressRecord {
            range: AddressRange::new(base, desc.width),
            heap: None,
        };
        self.state().insert_resource(key, record);
    }

    /// Record a heap's base address, probed through the device.
    ///
    /// Heaps that deny buffers cannot host the probe and are skipped.
    pub fn create_heap(&self, key: ObjectKey, desc: &HeapDesc, device: &dyn GpuDevice) {
        if desc.deny_buffers {
            debug!(heap = %key, "heap denies buffers, not tracking its address");
            return;
        }
        // Probe outside the lock: it is a driver round trip
        let Some(base) = device.probe_heap_base(key) else {
            warn!(heap = %key, "heap base probe failed");
            return;
        };
        let mut state = self.state();
        state.heaps.insert(key, AddressRange::new(base, desc.size));
        state.released.remove(&key);
    }

    /// Record a placed resource at `offset` inside `heap`.
    ///
    /// No-op when the heap is not tracked (it denies buffers).
    pub fn create_placed_resource(
        &self,
        key: ObjectKey,
        desc: &ResourceDesc,
        heap: ObjectKey,
        offset: u64,
    ) {
        let mut state = self.state();
        let Some(heap_range) = state.heaps.get(&heap).copied() else {
            debug!(resource = %key, heap = %heap, "owning heap untracked, skipping");
            return;
        };
        let Some(start) = heap_range.start.checked_add(offset) else {
            warn!(resource = %key, heap = %heap, offset, "placed offset overflows the address space");
            return;
        };
        let size = if desc.is_buffer() { desc.width } else { 0 };
        let record = AddressRecord {
            range: AddressRange::new(start, size),
            heap: Some(heap),
        };
        state.insert_resource(key, record);
    }

    /// Address of byte `offset` within the object named by `key`.
    ///
    /// `ObjectKey::NULL` yields 0 without touching any map. Placed resources
    /// that were already destroyed still resolve to their last-known address;
    /// the first such lookup logs a warning, later ones stay silent.
    pub fn get_address(&self, key: ObjectKey, offset: u64) -> GpuAddress {
        if key.is_null() {
            return 0;
        }
        let base = {
            let state = self.state();
            if let Some(record) = state.resources.get(&key) {
                return offset_address(key, record.range.start, offset);
            }
            if let Some(heap) = state.heaps.get(&key) {
                return offset_address(key, heap.start, offset);
            }
            state.released.get(&key).copied()
        };
        match base {
            Some(base) => {
                self.released_lookups.fetch_add(1, Ordering::Relaxed);
                if !self.released_warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        resource = %key,
                        "address requested for a released placed resource, using last known address"
                    );
                }
                offset_address(key, base, offset)
            }
            None => {
                error!("{}", CoreError::missing_key("address", key));
                0
            }
        }
    }

    /// Find the resource whose range contains `addr` and the offset within it
    #[must_use]
    pub fn resolve(&self, addr: GpuAddress) -> Option<(ObjectKey, u64)> {
        let state = self.state();
        let (_, keys) = state.by_start.floor(addr)?;
        keys.iter().rev().find_map(|key| {
            let record = state.resources.get(key)?;
            record.range.offset_of(addr).map(|offset| (*key, offset))
        })
    }

    /// Forget `key`. Placed resources keep their base in the released table.
    pub fn destroy(&self, key: ObjectKey) {
        let mut state = self.state();
        if let Some(record) = state.resources.remove(&key) {
            state.by_start.remove(record.range.start, key);
            if record.heap.is_some() {
                state.released.insert(key, record.range.start);
            }
        } else {
            state.heaps.remove(&key);
        }
    }

    /// Recorded address of a live resource
    #[must_use]
    pub fn record(&self, key: ObjectKey) -> Option<AddressRecord> {
        self.state().resources.get(&key).copied()
    }

    /// Probed base of a tracked heap
    #[must_use]
    pub fn heap_base(&self, key: ObjectKey) -> Option<GpuAddress> {
        self.state().heaps.get(&key).map(|range| range.start)
    }

    /// Number of lookups served from the released table
    #[must_use]
    pub fn released_lookups(&self) -> u64 {
        self.released_lookups.load(Ordering::Relaxed)
    }

    /// Number of live resources with an address
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().resources.len()
    }

    /// Whether no resource is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
