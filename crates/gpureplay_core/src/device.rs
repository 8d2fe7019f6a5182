//! The seam between this engine and the underlying graphics driver.
//!
//! The engine only needs a handful of diagnostic reads from the driver.
//! Executing the recorded calls themselves belongs to the interception
//! layer; [`CallExecutor`] exists so a recorded stream can be driven end to
//! end against any driver implementation.

use crate::desc::{AllocationInfo, HeapDesc, ResourceDesc};
use crate::error::CoreResult;
use crate::id::{GpuAddress, ObjectKey};

/// Read-only driver queries used by the address and placement engines
pub trait GpuDevice: Send + Sync {
    /// GPU virtual address of a live buffer resource
    fn resource_address(&self, key: ObjectKey) -> Option<GpuAddress>;

    /// Base address of a heap.
    ///
    /// Heaps have no address query of their own. Implementations create a
    /// zero-footprint placed buffer at offset 0, read its address back and
    /// release it again. Returns `None` if the heap denies buffers or is
    /// unknown.
    fn probe_heap_base(&self, heap: ObjectKey) -> Option<GpuAddress>;

    /// Size and alignment the driver would use for a resource
    fn allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo;
}

/// Issues the real creation calls of a recorded stream
pub trait CallExecutor: GpuDevice {
    /// Create a heap
    ///
    /// # Errors
    ///
    /// Returns error if the driver rejects the heap
    fn create_heap(&self, key: ObjectKey, desc: &HeapDesc) -> CoreResult<()>;

    /// Create a committed resource that owns its own allocation
    ///
    /// # Errors
    ///
    /// Returns error if the driver rejects the resource
    fn create_committed_resource(&self, key: ObjectKey, desc: &ResourceDesc) -> CoreResult<()>;

    /// Create a resource at `offset` inside `heap`
    ///
    /// # Errors
    ///
    /// Returns error if the driver rejects the placement
    fn create_placed_resource(
        &self,
        key: ObjectKey,
        heap: ObjectKey,
        offset: u64,
        desc: &ResourceDesc,
    ) -> CoreResult<()>;

    /// Release an interface
    fn release(&self, key: ObjectKey);
}
