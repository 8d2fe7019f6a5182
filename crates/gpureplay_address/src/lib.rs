//! GPUREPLAY Address Spaces
//!
//! Linear GPU address bookkeeping for captured and replayed call streams.
//! A single-space registry serves capture; a dual-space translator with alias
//! tracking serves replay.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod interval;
pub mod registry;
pub mod translator;

pub use interval::{AddressRange, SpaceIndex};
pub use registry::{AddressRecord, AddressSpaceRegistry};
pub use translator::{AddressMapping, AddressTranslator, PlacedRange, ResourceInfo, Space};
