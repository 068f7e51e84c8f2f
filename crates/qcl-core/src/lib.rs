//! Core types and traits for QCL bring-up and lock-in acquisition.
//!
//! - [`error`]: fault taxonomy shared by every stage
//! - [`capabilities`]: `HardwareLink` and `DetectorLink` device interfaces
//! - [`data`]: configuration values and hardware readings
//! - [`limits`]: default stage timings and the safe operating envelope

pub mod capabilities;
pub mod data;
pub mod error;
pub mod limits;

pub use capabilities::{ConnectionHandle, DetectorHandle, DetectorLink, HardwareLink};
pub use error::{FaultContext, FaultKind, QclError, QclResult};
