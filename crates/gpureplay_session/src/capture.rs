//! Capture-side session.
//!
//! Issues calls against the capture driver, tracks their addresses in a
//! single-space registry and records the stream for later replay.

use crate::trace::{CallEvent, CallTrace};
use gpureplay_address::AddressSpaceRegistry;
use gpureplay_core::{CallExecutor, CoreResult, GpuAddress, HeapDesc, ObjectKey, ResourceDesc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// One capture run
#[derive(Debug)]
pub struct CaptureSession<D: CallExecutor> {
    device: Arc<D>,
    registry: AddressSpaceRegistry,
    events: Mutex<Vec<CallEvent>>,
}

impl<D: CallExecutor> CaptureSession<D> {
    /// Create a session over `device`
    #[must_use]
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            registry: AddressSpaceRegistry::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> MutexGuard<'_, Vec<CallEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture driver
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Address registry
    #[must_use]
    pub fn registry(&self) -> &AddressSpaceRegistry {
        &self.registry
    }

    /// Create a heap and record its base
    ///
    /// # Errors
    ///
    /// Returns error if the driver rejects the heap
    pub fn create_heap(&self, key: ObjectKey, desc: &HeapDesc) -> CoreResult<()> {
        self.device.create_heap(key, desc)?;
        self.registry.create_heap(key, desc, &*self.device);
        let base = self.registry.heap_base(key);
        self.events().push(CallEvent::CreateHeap {
            key,
            desc: *desc,
            capture_base: base,
        });
        Ok(())
    }

    /// Create a committed resource and record its address
    ///
    /// # Errors
    ///
    /// Returns error if the driver rejects the resource
    pub fn create_committed_resource(&self, key: ObjectKey, desc: &ResourceDesc) -> CoreResult<()> {
        self.device.create_committed_resource(key, desc)?;
        self.registry.create_resource(key, desc, &*self.device);
        let address = self.registry.record(key).map(|record| record.range.start);
        self.events().push(CallEvent::CreateCommittedResource {
            key,
            desc: *desc,
            capture_address: address,
        });
        Ok(())
    }

    /// Create a placed resource and record its offset and footprint
    ///
    /// # Errors
    ///
    /// Returns error if the driver rejects the placement
    pub fn create_placed_resource(
        &self,
        key: ObjectKey,
        heap: ObjectKey,
        offset: u64,
        desc: &ResourceDesc,
    ) -> CoreResult<()> {
        self.device.create_placed_resource(key, heap, offset, desc)?;
        self.registry.create_placed_resource(key, desc, heap, offset);
        let captured = self.device.allocation_info(desc);
        self.events().push(CallEvent::CreatePlacedResource {
            key,
            heap,
            offset,
            desc: *desc,
            captured,
        });
        Ok(())
    }

    /// Release a heap or resource
    pub fn release(&self, key: ObjectKey) {
        self.registry.destroy(key);
        self.device.release(key);
        self.events().push(CallEvent::Release { key });
    }

    /// Address of byte `offset` within `key`
    #[must_use]
    pub fn get_address(&self, key: ObjectKey, offset: u64) -> GpuAddress {
        self.registry.get_address(key, offset)
    }

    /// Record that the stream references `addr`
    pub fn reference_address(&self, addr: GpuAddress) {
        if self.registry.resolve(addr).is_none() {
            warn!(address = addr, "referenced address belongs to no tracked object");
        }
        self.events().push(CallEvent::TranslateAddress {
            capture_address: addr,
        });
    }

    /// Recorded stream so far
    #[must_use]
    pub fn trace(&self) -> CallTrace {
        let events = self.events().clone();
        debug!(events = events.len(), "capture trace snapshot");
        CallTrace::new(events)
    }
}
