//! A deterministic in-memory GPU device.
//!
//! Addresses are handed out by a bump allocator, so the same sequence of
//! calls against the same [`SimConfig`] always yields the same addresses.

use crate::config::SimConfig;
use gpureplay_core::{
    AllocationInfo, CallExecutor, CoreError, CoreResult, GpuAddress, GpuDevice, HeapDesc,
    ObjectKey, ResourceDesc, ResourceDimension, heap_aligned_offset, is_aligned,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct SimHeap {
    base: GpuAddress,
    desc: HeapDesc,
}

#[derive(Debug, Clone, Copy)]
struct SimResource {
    address: GpuAddress,
    is_buffer: bool,
}

#[derive(Debug)]
struct SimState {
    next_address: GpuAddress,
    heaps: HashMap<ObjectKey, SimHeap>,
    resources: HashMap<ObjectKey, SimResource>,
    probes: u64,
}

impl SimState {
    fn allocate(&mut self, size: u64, alignment: u64) -> GpuAddress {
        let address = heap_aligned_offset(alignment, self.next_address);
        self.next_address = address.saturating_add(size.max(1));
        address
    }
}

/// Simulated device implementing the driver seam
#[derive(Debug)]
pub struct SimulatedDevice {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    /// Create a device with default behavior
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    /// Create with custom configuration
    #[must_use]
    pub fn with_config(config: SimConfig) -> Self {
        let state = SimState {
            next_address: config.address_base,
            heaps: HashMap::new(),
            resources: HashMap::new(),
            probes: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Base address of a live heap
    #[must_use]
    pub fn heap_base(&self, heap: ObjectKey) -> Option<GpuAddress> {
        self.state().heaps.get(&heap).map(|h| h.base)
    }

    /// Size of a live heap as created
    #[must_use]
    pub fn heap_size(&self, heap: ObjectKey) -> Option<u64> {
        self.state().heaps.get(&heap).map(|h| h.desc.size)
    }

    /// Number of heap base probes served
    #[must_use]
    pub fn probe_count(&self) -> u64 {
        self.state().probes
    }

    /// Number of live resources
    #[must_use]
    pub fn live_resources(&self) -> usize {
        self.state().resources.len()
    }

    fn raw_size(&self, desc: &ResourceDesc) -> u64 {
        let depth = u64::from(desc.depth_or_array_size);
        let texels = match desc.dimension {
            ResourceDimension::Buffer => return desc.width,
            ResourceDimension::Texture1D => desc.width.saturating_mul(depth),
            ResourceDimension::Texture2D | ResourceDimension::Texture3D => desc
                .width
                .saturating_mul(u64::from(desc.height))
                .saturating_mul(depth),
        };
        let base = texels
            .saturating_mul(self.config.bytes_per_texel)
            .saturating_mul(u64::from(desc.sample_count.max(1)));
        // A full mip chain adds roughly a third
        if desc.mip_levels > 1 { base.saturating_add(base / 3) } else { base }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for SimulatedDevice {
    fn resource_address(&self, key: ObjectKey) -> Option<GpuAddress> {
        self.state()
            .resources
            .get(&key)
            .filter(|r| r.is_buffer)
            .map(|r| r.address)
    }

    fn probe_heap_base(&self, heap: ObjectKey) -> Option<GpuAddress> {
        let mut state = self.state();
        let sim_heap = state.heaps.get(&heap).copied()?;
        if sim_heap.desc.deny_buffers {
            return None;
        }
        // A driver answers with the address of a zero-footprint buffer placed
        // at offset 0; the simulation knows the base and hands it out directly
        state.probes += 1;
        trace!(heap = %heap, base = sim_heap.base, "heap base probe");
        Some(sim_heap.base)
    }

    fn allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo {
        let default_alignment = if desc.is_buffer() {
            self.config.buffer_alignment
        } else {
            self.config.texture_alignment
        };
        let alignment = desc.alignment.max(default_alignment).max(1);
        let size = match self.config.size_overrides.get(&desc.width) {
            Some(size) => *size,
            None => self.raw_size(desc).saturating_add(self.config.padding),
        };
        AllocationInfo::new(heap_aligned_offset(alignment, size), alignment)
    }
}

impl CallExecutor for SimulatedDevice {
    fn create_heap(&self, key: ObjectKey, desc: &HeapDesc) -> CoreResult<()> {
        let alignment = desc
            .effective_alignment()
            .max(self.config.allocation_granularity);
        let mut state = self.state();
        let base = state.allocate(desc.size, alignment);
        state.heaps.insert(key, SimHeap { base, desc: *desc });
        Ok(())
    }

    fn create_committed_resource(&self, key: ObjectKey, desc: &ResourceDesc) -> CoreResult<()> {
        let info = self.allocation_info(desc);
        let mut state = self.state();
        let address = state.allocate(info.size, self.config.allocation_granularity);
        state.resources.insert(
            key,
            SimResource {
                address,
                is_buffer: desc.is_buffer(),
            },
        );
        Ok(())
    }

    fn create_placed_resource(
        &self,
        key: ObjectKey,
        heap: ObjectKey,
        offset: u64,
        desc: &ResourceDesc,
    ) -> CoreResult<()> {
        let info = self.allocation_info(desc);
        let mut state = self.state();
        let sim_heap = state
            .heaps
            .get(&heap)
            .copied()
            .ok_or_else(|| CoreError::missing_key("device heap", heap))?;

        let violation = |reason: String| CoreError::PlacementViolation {
            heap,
            resource: key,
            reason,
        };
        if desc.is_buffer() && sim_heap.desc.deny_buffers {
            return Err(violation("heap denies buffers".to_string()));
        }
        if !is_aligned(info.alignment, offset) {
            return Err(violation(format!(
                "offset {} not aligned to {}",
                offset, info.alignment
            )));
        }
        if offset.saturating_add(info.size) > sim_heap.desc.size {
            return Err(violation(format!(
                "[{}, {}) exceeds heap size {}",
                offset,
                offset.saturating_add(info.size),
                sim_heap.desc.size
            )));
        }

        state.resources.insert(
            key,
            SimResource {
                address: sim_heap.base.saturating_add(offset),
                is_buffer: desc.is_buffer(),
            },
        );
        Ok(())
    }

    fn release(&self, key: ObjectKey) {
        let mut state = self.state();
        if state.resources.remove(&key).is_none() {
            state.heaps.remove(&key);
        }
    }
}
