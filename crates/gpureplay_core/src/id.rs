//! Interface keys for captured API objects.
//!
//! Every heap and resource observed in a call stream is named by the 32-bit
//! key the capture layer assigned to its interface. Key 0 is reserved as the
//! "no object" sentinel.

use serde::{Deserialize, Serialize};

/// Key identifying a captured interface (heap or resource)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjectKey(u32);

impl ObjectKey {
    /// The "no object" sentinel
    pub const NULL: Self = Self(0);

    /// Create from a raw key value
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw key value
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the null sentinel
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Get as little-endian bytes
    #[must_use]
    pub const fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Create from little-endian bytes
    #[must_use]
    pub const fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl From<u32> for ObjectKey {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key_{}", self.0)
    }
}

/// A GPU virtual address
pub type GpuAddress = u64;
