//! Core error types for GPUREPLAY.
//!
//! None of these errors ever leave a hook entry point: hooks log them and
//! fall back to a best-effort value.

use crate::id::{GpuAddress, ObjectKey};

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Key or address absent from an index
    #[error("{space} lookup miss: {what}")]
    LookupMiss {
        /// Which index was consulted
        space: &'static str,
        /// Key or address that was not found
        what: String,
    },

    /// Computed offset violates alignment or heap bounds
    #[error("placement violation for {resource} in {heap}: {reason}")]
    PlacementViolation {
        /// Owning heap
        heap: ObjectKey,
        /// Offending resource
        resource: ObjectKey,
        /// What was violated
        reason: String,
    },

    /// Placement log missing, truncated or of an unknown layout
    #[error("placement data corrupted: {reason}")]
    PersistenceCorruption {
        /// Why the data was rejected
        reason: String,
    },

    /// Address resolves to several aliasing resources
    #[error("address {address:#x} is shared by {} resources", candidates.len())]
    OverlapAmbiguity {
        /// Address being resolved
        address: GpuAddress,
        /// Every live resource containing the address
        candidates: Vec<ObjectKey>,
    },

    /// IO error
    #[error("IO error: {reason}")]
    Io {
        /// Error message
        reason: String,
    },

    /// Canonical encoding failed
    #[error("encoding error: {reason}")]
    Encoding {
        /// Error message
        reason: String,
    },
}

impl CoreError {
    /// Build a lookup miss for a key
    #[must_use]
    pub fn missing_key(space: &'static str, key: ObjectKey) -> Self {
        Self::LookupMiss {
            space,
            what: key.to_string(),
        }
    }

    /// Build a lookup miss for an address
    #[must_use]
    pub fn missing_address(space: &'static str, address: GpuAddress) -> Self {
        Self::LookupMiss {
            space,
            what: format!("{address:#x}"),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<postcard::Error> for CoreError {
    fn from(err: postcard::Error) -> Self {
        Self::Encoding {
            reason: err.to_string(),
        }
    }
}
