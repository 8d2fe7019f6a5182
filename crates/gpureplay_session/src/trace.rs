//! Recorded call streams.

use gpureplay_core::{
    AllocationInfo, CoreError, CoreResult, GpuAddress, HeapDesc, ObjectKey, ResourceDesc,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

/// One recorded creation or release call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum CallEvent {
    /// Heap creation
    CreateHeap {
        /// Heap key
        key: ObjectKey,
        /// Creation descriptor
        desc: HeapDesc,
        /// Heap base at capture
        #[serde(default)]
        capture_base: Option<GpuAddress>,
    },
    /// Committed resource creation
    CreateCommittedResource {
        /// Resource key
        key: ObjectKey,
        /// Creation descriptor
        desc: ResourceDesc,
        /// Buffer address at capture
        #[serde(default)]
        capture_address: Option<GpuAddress>,
    },
    /// Placed resource creation
    CreatePlacedResource {
        /// Resource key
        key: ObjectKey,
        /// Owning heap
        heap: ObjectKey,
        /// Offset at capture
        offset: u64,
        /// Creation descriptor
        desc: ResourceDesc,
        /// Footprint reported by the capture driver
        captured: AllocationInfo,
    },
    /// Release of a heap or resource
    Release {
        /// Released key
        key: ObjectKey,
    },
    /// A captured address the stream needs patched
    TranslateAddress {
        /// Capture-space address
        capture_address: GpuAddress,
    },
}

impl CallEvent {
    /// Key the call creates or releases
    #[must_use]
    pub fn key(&self) -> Option<ObjectKey> {
        match self {
            Self::CreateHeap { key, .. }
            | Self::CreateCommittedResource { key, .. }
            | Self::CreatePlacedResource { key, .. }
            | Self::Release { key } => Some(*key),
            Self::TranslateAddress { .. } => None,
        }
    }
}

/// A recorded call stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTrace {
    /// Calls in issue order
    pub events: Vec<CallEvent>,
}

impl CallTrace {
    /// Wrap recorded events
    #[must_use]
    pub fn new(events: Vec<CallEvent>) -> Self {
        Self { events }
    }

    /// Parse a JSON trace
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Encoding {
            reason: format!("call trace: {e}"),
        })
    }

    /// Load a JSON trace file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> CoreResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::Encoding {
            reason: format!("call trace: {e}"),
        })
    }

    /// Reader over the events
    #[must_use]
    pub fn reader(&self) -> TraceReader {
        TraceReader::from_events(self.events.clone())
    }
}

/// Sequential reader over a call stream
#[derive(Debug, Default)]
pub struct TraceReader {
    buffer: VecDeque<CallEvent>,
    position: usize,
    total: usize,
}

impl TraceReader {
    /// Create trace reader from events
    #[must_use]
    pub fn from_events(events: Vec<CallEvent>) -> Self {
        let total = events.len();
        Self {
            buffer: events.into(),
            position: 0,
            total,
        }
    }

    /// Read the next event
    pub fn next_event(&mut self) -> Option<CallEvent> {
        let event = self.buffer.pop_front()?;
        self.position += 1;
        Some(event)
    }

    /// Check if there are more events
    #[must_use]
    pub fn has_more(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Get remaining event count
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    /// Events consumed so far
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get total event count
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for TraceReader {
    type Item = CallEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}
