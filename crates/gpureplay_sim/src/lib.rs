//! GPUREPLAY Device Simulation
//!
//! A deterministic stand-in for a graphics driver. Tests and the CLI use it
//! to model replay drivers that place and pad resources differently from the
//! capture driver.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod device;

pub use config::SimConfig;
pub use device::SimulatedDevice;
