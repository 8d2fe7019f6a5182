//! Simulated driver behavior.

use gpureplay_core::DEFAULT_HEAP_ALIGNMENT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Simulation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// First virtual address handed out
    pub address_base: u64,
    /// Virtual address granularity for heaps and committed resources
    pub allocation_granularity: u64,
    /// Placement alignment for buffers
    pub buffer_alignment: u64,
    /// Placement alignment for textures
    pub texture_alignment: u64,
    /// Bytes of padding added to every footprint
    pub padding: u64,
    /// Exact footprints keyed by descriptor width, overriding the computed one
    pub size_overrides: BTreeMap<u64, u64>,
    /// Bytes per texel for texture footprints
    pub bytes_per_texel: u64,
}

impl SimConfig {
    /// Create a config with driver-like defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            address_base: 0x1_0000_0000,
            allocation_granularity: DEFAULT_HEAP_ALIGNMENT,
            buffer_alignment: DEFAULT_HEAP_ALIGNMENT,
            texture_alignment: DEFAULT_HEAP_ALIGNMENT,
            padding: 0,
            size_overrides: BTreeMap::new(),
            bytes_per_texel: 4,
        }
    }

    /// Set the first address handed out
    #[must_use]
    pub fn with_address_base(mut self, base: u64) -> Self {
        self.address_base = base;
        self
    }

    /// Set buffer placement alignment
    #[must_use]
    pub fn with_buffer_alignment(mut self, alignment: u64) -> Self {
        self.buffer_alignment = alignment;
        self
    }

    /// Pad every footprint
    #[must_use]
    pub fn with_padding(mut self, padding: u64) -> Self {
        self.padding = padding;
        self
    }

    /// Report `size` for every resource of the given width
    #[must_use]
    pub fn with_size_override(mut self, width: u64, size: u64) -> Self {
        self.size_overrides.insert(width, size);
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new()
    }
}
