//! GPUREPLAY Heap Placement
//!
//! Keeps placed resources from overlapping when the replay driver reports
//! different footprints than the capture driver did:
//! - forward-only redistribution of one heap's resources
//! - the append-only `resourcePlacementData.dat` log
//! - the reconciler hooks that tie both into heap and resource creation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod reconciler;
pub mod record;
pub mod redistribute;
pub mod store;

pub use reconciler::{HeapPlacementReconciler, PlacedResourceCreate, ReconcilerConfig, ReconcilerStats};
pub use record::{PLACEMENT_FILE_NAME, PlacementRecord};
pub use redistribute::{
    Marker, Redistribution, find_first_marker_in_increment_zone, markers_overlap,
    redistribute_in_heap, redistribute_resources,
};
pub use store::{HeapPlacements, LogStats, PlacementLog, decode_log};
