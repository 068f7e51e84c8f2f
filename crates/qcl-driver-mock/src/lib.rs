//! Mock hardware for qcl-daq
//!
//! Simulated devices for running the bring-up sequence and the acquisition
//! path without a laser controller or lock-in on the bench.
//!
//! # Available Mock Devices
//!
//! - [`MockController`] - QCL and TEC controller; arm, parameter, cool-down,
//!   emission and tune confirmation each arrive after a configurable number
//!   of reads
//! - [`MockLockin`] - lock-in amplifier; device family and options are
//!   configurable, poll responses are scripted or synthesized
//!
//! Both record every call so tests can assert on ordering and on how often
//! the connection was released.

mod mock_controller;
mod mock_lockin;

pub use mock_controller::{ControllerCall, MockController, MockControllerConfig};
pub use mock_lockin::{LockinCall, MockLockin, MockLockinConfig};
