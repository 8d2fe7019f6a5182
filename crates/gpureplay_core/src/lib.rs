//! GPUREPLAY Core Types
//!
//! This crate contains pure types and logic with no I/O: interface keys,
//! creation descriptors, alignment math and the driver seam shared by the
//! capture and replay engines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod align;
pub mod desc;
pub mod device;
pub mod error;
pub mod id;

// Re-exports
pub use align::{combine_alignment, heap_aligned_offset, is_aligned, DEFAULT_HEAP_ALIGNMENT};
pub use desc::{AllocationInfo, DescriptionSnapshot, HeapDesc, ResourceDesc, ResourceDimension};
pub use device::{CallExecutor, GpuDevice};
pub use error::{CoreError, CoreResult};
pub use id::{GpuAddress, ObjectKey};
