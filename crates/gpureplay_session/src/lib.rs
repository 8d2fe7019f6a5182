//! GPUREPLAY Sessions
//!
//! Per-run service owners. A [`CaptureSession`] records a call stream and its
//! addresses; a [`ReplaySession`] replays one, translating captured addresses
//! and reconciling heap placements. Sessions are independent values, so one
//! process can run several at once.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capture;
pub mod config;
pub mod replay;
pub mod trace;

pub use capture::CaptureSession;
pub use config::SessionConfig;
pub use replay::{PlacementOutcome, ReplayReport, ReplaySession, Translation};
pub use trace::{CallEvent, CallTrace, TraceReader};
