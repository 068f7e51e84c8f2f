//! Hardware capability interfaces
//!
//! The laser controller and the lock-in instrument are reached through two
//! capability traits. Vendor libraries sit behind them; the bring-up
//! sequencer and the acquisition path only ever see these traits.
//!
//! - [`HardwareLink`]: laser and TEC controller (connect, arm, tune, QCL
//!   parameters, emission, diagnostics)
//! - [`DetectorLink`]: lock-in instrument (node writes, subscriptions, polling)
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors; callers classify failures into faults
//! - Takes the connection handle explicitly, so a released handle can not be
//!   passed again (`disconnect` consumes it)

use crate::data::{
    DiagnosticWords, NodeValue, PollResponse, QclParameterSet, WavelengthUnit,
};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

// =============================================================================
// Handles
// =============================================================================

/// Opaque identifier of an open controller connection.
///
/// Not `Clone`: exactly one owner holds it, and [`HardwareLink::disconnect`]
/// takes it by value.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u32);

impl ConnectionHandle {
    /// Wrap a raw handle returned by the controller library.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Opaque identifier of an open lock-in session.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DetectorHandle(u32);

impl DetectorHandle {
    /// Wrap a raw session id returned by the instrument library.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw session id.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

// =============================================================================
// Laser controller
// =============================================================================

/// Capability: Laser and TEC controller
///
/// Setters only stage a value on the controller; the matching `exec_*` call
/// applies it. Confirmation is always read back through the `is_*` queries.
///
/// # Contract
/// - `set_emission(false)`, `set_armed(false)` and their `exec_*` calls are
///   idempotent and safe on a controller that never armed
/// - `disconnect` releases the handle even if it returns an error
#[async_trait]
pub trait HardwareLink: Send + Sync {
    /// Scan for attached controllers.
    async fn search_devices(&self) -> Result<()>;

    /// Number of controllers found by the last scan.
    async fn device_count(&self) -> Result<u16>;

    /// Open a connection to the controller at `device_index`.
    async fn connect(&self, device_index: u16) -> Result<ConnectionHandle>;

    /// Whether the QCL sub-module is installed.
    async fn is_qcl_present(&self, handle: &ConnectionHandle) -> Result<bool>;

    /// Whether the interlock loop is closed.
    async fn verify_interlock(&self, handle: &ConnectionHandle) -> Result<bool>;

    /// Whether the key switch is set.
    async fn verify_key_switch(&self, handle: &ConnectionHandle) -> Result<bool>;

    /// Stage arm (`true`) or disarm (`false`).
    async fn set_armed(&self, handle: &ConnectionHandle, armed: bool) -> Result<()>;

    /// Apply the staged arm state.
    async fn exec_arm(&self, handle: &ConnectionHandle) -> Result<()>;

    /// Armed status bit.
    async fn is_armed(&self, handle: &ConnectionHandle) -> Result<bool>;

    /// Read the current QCL parameters.
    async fn read_qcl_params(&self, handle: &ConnectionHandle) -> Result<QclParameterSet>;

    /// Write QCL parameters.
    async fn write_qcl_params(
        &self,
        handle: &ConnectionHandle,
        params: &QclParameterSet,
    ) -> Result<()>;

    /// Stage a tune target.
    async fn set_tune_target(
        &self,
        handle: &ConnectionHandle,
        unit: WavelengthUnit,
        value: f64,
    ) -> Result<()>;

    /// Apply the staged tune target.
    async fn exec_tune(&self, handle: &ConnectionHandle) -> Result<()>;

    /// Tuned status bit.
    async fn is_tuned(&self, handle: &ConnectionHandle) -> Result<bool>;

    /// TEC temperature-stable status bit.
    async fn is_temp_stable(&self, handle: &ConnectionHandle) -> Result<bool>;

    /// Stage emission on (`true`) or off (`false`).
    async fn set_emission(&self, handle: &ConnectionHandle, on: bool) -> Result<()>;

    /// Apply the staged emission state.
    async fn exec_emission(&self, handle: &ConnectionHandle) -> Result<()>;

    /// Emission status bit.
    async fn is_emitting(&self, handle: &ConnectionHandle) -> Result<bool>;

    /// Status, error and warning words.
    async fn read_diagnostic_words(&self, handle: &ConnectionHandle) -> Result<DiagnosticWords>;

    /// Close the connection.
    async fn disconnect(&self, handle: ConnectionHandle) -> Result<()>;
}

// =============================================================================
// Lock-in instrument
// =============================================================================

/// Capability: Lock-in instrument
///
/// Node paths are absolute (`/<device>/demods/0/rate`) and may contain `*`
/// wildcards, which address every channel of that kind.
#[async_trait]
pub trait DetectorLink: Send + Sync {
    /// Open a session with the instrument's data server.
    async fn connect(&self, address: &str, port: u16) -> Result<DetectorHandle>;

    /// Identify the device to configure (e.g. `dev1234`).
    async fn detect_device(&self, session: &DetectorHandle) -> Result<String>;

    /// Read a string node.
    async fn get_string(&self, session: &DetectorHandle, path: &str) -> Result<String>;

    /// Write a node.
    async fn set_value(&self, session: &DetectorHandle, path: &str, value: NodeValue)
        -> Result<()>;

    /// Subscribe to a streaming node.
    async fn subscribe(&self, session: &DetectorHandle, path: &str) -> Result<()>;

    /// Unsubscribe from a streaming node (`*` clears every subscription).
    async fn unsubscribe(&self, session: &DetectorHandle, path: &str) -> Result<()>;

    /// Block until every preceding write has been applied.
    async fn sync(&self, session: &DetectorHandle) -> Result<()>;

    /// Record subscribed data for `duration`, waiting at most `timeout` for
    /// the data server to answer.
    async fn poll(
        &self,
        session: &DetectorHandle,
        duration: Duration,
        timeout: Duration,
    ) -> Result<PollResponse>;

    /// Timestamp clock frequency of `device` in ticks per second.
    async fn clock_base(&self, session: &DetectorHandle, device: &str) -> Result<f64>;

    /// Close the session.
    async fn disconnect(&self, session: DetectorHandle) -> Result<()>;
}
