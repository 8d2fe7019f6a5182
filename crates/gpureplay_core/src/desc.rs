//! Creation descriptors consumed from the call-interception layer.

use crate::align::DEFAULT_HEAP_ALIGNMENT;
use serde::{Deserialize, Serialize};

/// Heap creation descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapDesc {
    /// Requested heap size in bytes
    pub size: u64,
    /// Placement alignment (0 = default 64 KiB)
    pub alignment: u64,
    /// Heap refuses buffer resources
    pub deny_buffers: bool,
}

impl HeapDesc {
    /// Create a heap descriptor with default alignment that accepts buffers
    #[must_use]
    pub const fn new(size: u64) -> Self {
        Self {
            size,
            alignment: 0,
            deny_buffers: false,
        }
    }

    /// Set the placement alignment
    #[must_use]
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Deny buffer resources in this heap
    #[must_use]
    pub const fn deny_buffers(mut self) -> Self {
        self.deny_buffers = true;
        self
    }

    /// Alignment with the default applied
    #[must_use]
    pub const fn effective_alignment(&self) -> u64 {
        if self.alignment == 0 {
            DEFAULT_HEAP_ALIGNMENT
        } else {
            self.alignment
        }
    }
}

/// Resource dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceDimension {
    /// Linear buffer; the only shape with a GPU virtual address
    Buffer,
    /// 1D texture
    Texture1D,
    /// 2D texture
    Texture2D,
    /// 3D texture
    Texture3D,
}

/// Resource creation descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDesc {
    /// Resource dimension
    pub dimension: ResourceDimension,
    /// Width in bytes for buffers, texels otherwise
    pub width: u64,
    /// Height in texels
    pub height: u32,
    /// Depth or array size
    pub depth_or_array_size: u16,
    /// Mip level count
    pub mip_levels: u16,
    /// Opaque format code
    pub format: u32,
    /// MSAA sample count
    pub sample_count: u32,
    /// Application-declared alignment (0 = driver default)
    pub alignment: u64,
}

impl ResourceDesc {
    /// Describe a linear buffer
    #[must_use]
    pub const fn buffer(width: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: 0,
            sample_count: 1,
            alignment: 0,
        }
    }

    /// Describe a 2D texture
    #[must_use]
    pub const fn texture_2d(width: u64, height: u32, format: u32) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            width,
            height,
            depth_or_array_size: 1,
            mip_levels: 1,
            format,
            sample_count: 1,
            alignment: 0,
        }
    }

    /// Set the declared alignment
    #[must_use]
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Whether this resource carries a linear GPU address
    #[must_use]
    pub const fn is_buffer(&self) -> bool {
        matches!(self.dimension, ResourceDimension::Buffer)
    }

    /// Fingerprint of this descriptor for the placement log
    #[must_use]
    pub fn snapshot(&self) -> DescriptionSnapshot {
        DescriptionSnapshot::compute(self)
    }
}

/// Driver answer to an allocation-info query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    /// Footprint in bytes, including driver padding
    pub size: u64,
    /// Required placement alignment
    pub alignment: u64,
}

impl AllocationInfo {
    /// Create allocation info
    #[must_use]
    pub const fn new(size: u64, alignment: u64) -> Self {
        Self { size, alignment }
    }
}

/// Fixed-size fingerprint of a [`ResourceDesc`].
///
/// BLAKE3 over the postcard encoding, so the value is byte-stable across
/// platforms and runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptionSnapshot([u8; 32]);

impl DescriptionSnapshot {
    /// The number of bytes in a snapshot
    pub const LEN: usize = 32;

    /// Compute the snapshot of a descriptor
    #[must_use]
    pub fn compute(desc: &ResourceDesc) -> Self {
        // ResourceDesc has no variable-length fields so encoding cannot fail
        let encoded = postcard::to_allocvec(desc).unwrap_or_default();
        Self(*blake3::hash(&encoded).as_bytes())
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for DescriptionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}
