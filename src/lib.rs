//! # QCL DAQ
//!
//! Brings a pulsed quantum cascade laser and its TEC online in a fixed,
//! timeout-bounded order, then configures a lock-in amplifier and collects
//! demodulated magnitude samples synchronized to the laser.
//!
//! ## Crate Structure
//!
//! - **`procedures`**: the startup sequencer, the convergence poller every
//!   stage waits on, safe shutdown, and post-startup laser operations.
//! - **`acquisition`**: lock-in configuration and per-cycle sample collection.
//! - **`experiment`**: timed experiments that change laser fields once per
//!   second while collecting.
//! - **`config`**: layered settings (defaults, TOML, environment).
//! - **`logging`**: tracing subscriber setup.
//!
//! Hardware is reached only through the [`HardwareLink`] and [`DetectorLink`]
//! traits from `qcl-core`; `qcl-driver-mock` provides simulated devices.

pub mod acquisition;
pub mod config;
pub mod experiment;
pub mod logging;
pub mod procedures;

pub use qcl_core::{
    ConnectionHandle, DetectorHandle, DetectorLink, FaultKind, HardwareLink, QclError, QclResult,
};
