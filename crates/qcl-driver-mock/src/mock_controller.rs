//! Mock QCL and TEC controller.
//!
//! Every status bit comes up after a configurable number of reads, so tests
//! can place confirmation at an exact poll iteration. All calls are recorded.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use qcl_core::capabilities::{ConnectionHandle, HardwareLink};
use qcl_core::data::{DiagnosticWords, QclParameterSet, WavelengthUnit};
use serde::{Deserialize, Serialize};

// =============================================================================
// Configuration
// =============================================================================

/// Behaviour of a [`MockController`].
///
/// `Option<u32>` read counts use `None` for "never confirms".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockControllerConfig {
    /// Controllers reported by a device scan (default: 1)
    #[serde(default = "default_device_count")]
    pub device_count: u16,

    /// QCL module installed (default: true)
    #[serde(default = "default_true")]
    pub qcl_present: bool,

    /// Interlock loop closed (default: true)
    #[serde(default = "default_true")]
    pub interlock_closed: bool,

    /// Key switch set (default: true)
    #[serde(default = "default_true")]
    pub key_switch_on: bool,

    /// Armed bit reads true on this read after arming (default: 1)
    #[serde(default = "default_after")]
    pub arm_after_polls: Option<u32>,

    /// Written parameters read back on this read after a write (default: 1)
    #[serde(default = "default_after")]
    pub params_converge_after_reads: Option<u32>,

    /// Temperature-stable bit reads true on this read (default: 1)
    #[serde(default = "default_after")]
    pub temp_stable_after_polls: Option<u32>,

    /// Turn-on attempt on which emission is confirmed (default: 1)
    #[serde(default = "default_after")]
    pub emission_on_attempt: Option<u32>,

    /// Emission bit reads true on this read of the confirming attempt (default: 1)
    #[serde(default = "default_one")]
    pub emission_after_polls: u32,

    /// Tuned bit reads true on this read after a tune (default: 1)
    #[serde(default = "default_after")]
    pub tune_after_polls: Option<u32>,

    /// Reject emission-off, disarm and disconnect (default: false)
    #[serde(default)]
    pub fail_shutdown_commands: bool,

    /// Panic inside the temperature-stable read (default: false)
    #[serde(default)]
    pub panic_on_temp_read: bool,

    /// Diagnostic words reported by the controller
    #[serde(default)]
    pub diagnostics: DiagnosticWords,
}

fn default_device_count() -> u16 {
    1
}

fn default_true() -> bool {
    true
}

fn default_after() -> Option<u32> {
    Some(1)
}

fn default_one() -> u32 {
    1
}

#[allow(clippy::panic)]
fn simulated_panic() -> ! {
    panic!("simulated TEC driver panic")
}

impl Default for MockControllerConfig {
    fn default() -> Self {
        Self {
            device_count: default_device_count(),
            qcl_present: true,
            interlock_closed: true,
            key_switch_on: true,
            arm_after_polls: default_after(),
            params_converge_after_reads: default_after(),
            temp_stable_after_polls: default_after(),
            emission_on_attempt: default_after(),
            emission_after_polls: default_one(),
            tune_after_polls: default_after(),
            fail_shutdown_commands: false,
            panic_on_temp_read: false,
            diagnostics: DiagnosticWords::default(),
        }
    }
}

// =============================================================================
// Call log
// =============================================================================

/// One recorded [`HardwareLink`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCall {
    /// `search_devices`
    SearchDevices,
    /// `device_count`
    DeviceCount,
    /// `connect(index)`
    Connect(u16),
    /// `is_qcl_present`
    IsQclPresent,
    /// `verify_interlock`
    VerifyInterlock,
    /// `verify_key_switch`
    VerifyKeySwitch,
    /// `set_armed(on)`
    SetArmed(bool),
    /// `exec_arm`
    ExecArm,
    /// `is_armed`
    IsArmed,
    /// `read_qcl_params`
    ReadQclParams,
    /// `write_qcl_params(params)`
    WriteQclParams(QclParameterSet),
    /// `set_tune_target(unit, value)`
    SetTuneTarget(WavelengthUnit, f64),
    /// `exec_tune`
    ExecTune,
    /// `is_tuned`
    IsTuned,
    /// `is_temp_stable`
    IsTempStable,
    /// `set_emission(on)`
    SetEmission(bool),
    /// `exec_emission`
    ExecEmission,
    /// `is_emitting`
    IsEmitting,
    /// `read_diagnostic_words`
    ReadDiagnosticWords,
    /// `disconnect(raw handle)`
    Disconnect(u32),
}

// =============================================================================
// MockController
// =============================================================================

#[derive(Debug)]
struct ControllerState {
    calls: Vec<ControllerCall>,
    next_handle: u32,
    open_handle: Option<u32>,
    disconnects: u32,

    staged_arm: bool,
    armed: bool,
    arm_reads: u32,

    params: QclParameterSet,
    pending_params: Option<QclParameterSet>,
    param_reads: u32,

    temp_reads: u32,

    staged_tune: Option<(WavelengthUnit, f64)>,
    tune_target: Option<(WavelengthUnit, f64)>,
    tune_reads: u32,

    staged_emission: bool,
    emission_attempts: u32,
    emission_reads: u32,
    emission_requested: bool,
}

/// Simulated laser controller implementing [`HardwareLink`].
///
/// Operations against a handle that is not open fail, so a reused handle
/// shows up as an error and in the call log.
#[derive(Debug)]
pub struct MockController {
    config: MockControllerConfig,
    state: Mutex<ControllerState>,
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockController {
    /// Controller that confirms every step on the first read.
    pub fn new() -> Self {
        Self::with_config(MockControllerConfig::default())
    }

    /// Controller with the given behaviour.
    pub fn with_config(config: MockControllerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ControllerState {
                calls: Vec::new(),
                next_handle: 1,
                open_handle: None,
                disconnects: 0,
                staged_arm: false,
                armed: false,
                arm_reads: 0,
                params: QclParameterSet {
                    pulse_rate_hz: 0.0,
                    pulse_width_ns: 0.0,
                    current_ma: 0.0,
                    temperature_c: 20.0,
                    slot_id: 1,
                    laser_mode: 0,
                    pulse_mode: 1,
                    source_voltage: 12.0,
                },
                pending_params: None,
                param_reads: 0,
                temp_reads: 0,
                staged_tune: None,
                tune_target: None,
                tune_reads: 0,
                staged_emission: false,
                emission_attempts: 0,
                emission_reads: 0,
                emission_requested: false,
            }),
        }
    }

    /// Behaviour this controller was built with.
    pub fn config(&self) -> &MockControllerConfig {
        &self.config
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<ControllerCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn call_count(&self, pred: impl Fn(&ControllerCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Number of successful disconnects.
    pub fn disconnect_count(&self) -> u32 {
        self.state.lock().disconnects
    }

    /// Number of emission-on commands executed.
    pub fn emission_attempts(&self) -> u32 {
        self.state.lock().emission_attempts
    }

    /// True while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().open_handle.is_some()
    }

    /// Last applied tune target.
    pub fn tune_target(&self) -> Option<(WavelengthUnit, f64)> {
        self.state.lock().tune_target
    }

    fn record(&self, call: ControllerCall) {
        self.state.lock().calls.push(call);
    }

    fn checked(&self, handle: &ConnectionHandle, call: ControllerCall) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.open_handle {
            Some(open) if open == handle.raw() => Ok(()),
            _ => Err(anyhow!("handle {} is not open", handle.raw())),
        }
    }
}

fn confirmed(reads: u32, after: Option<u32>) -> bool {
    after.is_some_and(|n| reads >= n)
}

#[async_trait]
impl HardwareLink for MockController {
    async fn search_devices(&self) -> Result<()> {
        self.record(ControllerCall::SearchDevices);
        Ok(())
    }

    async fn device_count(&self) -> Result<u16> {
        self.record(ControllerCall::DeviceCount);
        Ok(self.config.device_count)
    }

    async fn connect(&self, device_index: u16) -> Result<ConnectionHandle> {
        let mut state = self.state.lock();
        state.calls.push(ControllerCall::Connect(device_index));
        if device_index >= self.config.device_count {
            bail!(
                "no controller at index {} ({} found)",
                device_index,
                self.config.device_count
            );
        }
        if state.open_handle.is_some() {
            bail!("controller already connected");
        }
        let raw = state.next_handle;
        state.next_handle += 1;
        state.open_handle = Some(raw);
        Ok(ConnectionHandle::new(raw))
    }

    async fn is_qcl_present(&self, handle: &ConnectionHandle) -> Result<bool> {
        self.checked(handle, ControllerCall::IsQclPresent)?;
        Ok(self.config.qcl_present)
    }

    async fn verify_interlock(&self, handle: &ConnectionHandle) -> Result<bool> {
        self.checked(handle, ControllerCall::VerifyInterlock)?;
        Ok(self.config.interlock_closed)
    }

    async fn verify_key_switch(&self, handle: &ConnectionHandle) -> Result<bool> {
        self.checked(handle, ControllerCall::VerifyKeySwitch)?;
        Ok(self.config.key_switch_on)
    }

    async fn set_armed(&self, handle: &ConnectionHandle, armed: bool) -> Result<()> {
        self.checked(handle, ControllerCall::SetArmed(armed))?;
        if !armed && self.config.fail_shutdown_commands {
            bail!("disarm rejected");
        }
        self.state.lock().staged_arm = armed;
        Ok(())
    }

    async fn exec_arm(&self, handle: &ConnectionHandle) -> Result<()> {
        self.checked(handle, ControllerCall::ExecArm)?;
        let mut state = self.state.lock();
        state.arm_reads = 0;
        state.armed = state.staged_arm;
        Ok(())
    }

    async fn is_armed(&self, handle: &ConnectionHandle) -> Result<bool> {
        self.checked(handle, ControllerCall::IsArmed)?;
        let mut state = self.state.lock();
        if !state.armed {
            return Ok(false);
        }
        state.arm_reads += 1;
        Ok(confirmed(state.arm_reads, self.config.arm_after_polls))
    }

    async fn read_qcl_params(&self, handle: &ConnectionHandle) -> Result<QclParameterSet> {
        self.checked(handle, ControllerCall::ReadQclParams)?;
        let mut state = self.state.lock();
        if state.pending_params.is_some() {
            state.param_reads += 1;
            if confirmed(state.param_reads, self.config.params_converge_after_reads) {
                if let Some(pending) = state.pending_params.take() {
                    state.params = pending;
                }
            }
        }
        Ok(state.params.clone())
    }

    async fn write_qcl_params(
        &self,
        handle: &ConnectionHandle,
        params: &QclParameterSet,
    ) -> Result<()> {
        self.checked(handle, ControllerCall::WriteQclParams(params.clone()))?;
        let mut state = self.state.lock();
        state.param_reads = 0;
        state.pending_params = Some(params.clone());
        Ok(())
    }

    async fn set_tune_target(
        &self,
        handle: &ConnectionHandle,
        unit: WavelengthUnit,
        value: f64,
    ) -> Result<()> {
        self.checked(handle, ControllerCall::SetTuneTarget(unit, value))?;
        self.state.lock().staged_tune = Some((unit, value));
        Ok(())
    }

    async fn exec_tune(&self, handle: &ConnectionHandle) -> Result<()> {
        self.checked(handle, ControllerCall::ExecTune)?;
        let mut state = self.state.lock();
        state.tune_reads = 0;
        state.tune_target = state.staged_tune;
        Ok(())
    }

    async fn is_tuned(&self, handle: &ConnectionHandle) -> Result<bool> {
        self.checked(handle, ControllerCall::IsTuned)?;
        let mut state = self.state.lock();
        if state.tune_target.is_none() {
            return Ok(false);
        }
        state.tune_reads += 1;
        Ok(confirmed(state.tune_reads, self.config.tune_after_polls))
    }

    async fn is_temp_stable(&self, handle: &ConnectionHandle) -> Result<bool> {
        self.checked(handle, ControllerCall::IsTempStable)?;
        if self.config.panic_on_temp_read {
            simulated_panic();
        }
        let mut state = self.state.lock();
        state.temp_reads += 1;
        Ok(confirmed(state.temp_reads, self.config.temp_stable_after_polls))
    }

    async fn set_emission(&self, handle: &ConnectionHandle, on: bool) -> Result<()> {
        self.checked(handle, ControllerCall::SetEmission(on))?;
        if !on && self.config.fail_shutdown_commands {
            bail!("emission off rejected");
        }
        self.state.lock().staged_emission = on;
        Ok(())
    }

    async fn exec_emission(&self, handle: &ConnectionHandle) -> Result<()> {
        self.checked(handle, ControllerCall::ExecEmission)?;
        let mut state = self.state.lock();
        state.emission_reads = 0;
        state.emission_requested = state.staged_emission;
        if state.staged_emission {
            state.emission_attempts += 1;
        }
        Ok(())
    }

    async fn is_emitting(&self, handle: &ConnectionHandle) -> Result<bool> {
        self.checked(handle, ControllerCall::IsEmitting)?;
        let mut state = self.state.lock();
        if !state.emission_requested || Some(state.emission_attempts) != self.config.emission_on_attempt {
            return Ok(false);
        }
        state.emission_reads += 1;
        Ok(state.emission_reads >= self.config.emission_after_polls)
    }

    async fn read_diagnostic_words(&self, handle: &ConnectionHandle) -> Result<DiagnosticWords> {
        self.checked(handle, ControllerCall::ReadDiagnosticWords)?;
        Ok(self.config.diagnostics)
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<()> {
        self.checked(&handle, ControllerCall::Disconnect(handle.raw()))?;
        let mut state = self.state.lock();
        // The handle is released even when the controller reports an error.
        state.open_handle = None;
        state.armed = false;
        state.emission_requested = false;
        if self.config.fail_shutdown_commands {
            bail!("disconnect reported an error");
        }
        state.disconnects += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_arm_confirms_on_configured_read() {
        let ctrl = MockController::with_config(MockControllerConfig {
            arm_after_polls: Some(3),
            ..Default::default()
        });
        let handle = ctrl.connect(0).await.unwrap();

        // Not armed before exec_arm.
        assert!(!ctrl.is_armed(&handle).await.unwrap());

        ctrl.set_armed(&handle, true).await.unwrap();
        ctrl.exec_arm(&handle).await.unwrap();
        assert!(!ctrl.is_armed(&handle).await.unwrap());
        assert!(!ctrl.is_armed(&handle).await.unwrap());
        assert!(ctrl.is_armed(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_params_echo_after_reads() {
        let ctrl = MockController::with_config(MockControllerConfig {
            params_converge_after_reads: Some(2),
            ..Default::default()
        });
        let handle = ctrl.connect(0).await.unwrap();
        let mut wanted = ctrl.read_qcl_params(&handle).await.unwrap();
        wanted.current_ma = 1500.0;
        ctrl.write_qcl_params(&handle, &wanted).await.unwrap();

        assert!(!ctrl.read_qcl_params(&handle).await.unwrap().converged_with(&wanted));
        assert!(ctrl.read_qcl_params(&handle).await.unwrap().converged_with(&wanted));
    }

    #[tokio::test]
    async fn test_emission_confirms_only_on_configured_attempt() {
        let ctrl = MockController::with_config(MockControllerConfig {
            emission_on_attempt: Some(2),
            ..Default::default()
        });
        let handle = ctrl.connect(0).await.unwrap();

        ctrl.set_emission(&handle, true).await.unwrap();
        ctrl.exec_emission(&handle).await.unwrap();
        assert!(!ctrl.is_emitting(&handle).await.unwrap());

        ctrl.set_emission(&handle, true).await.unwrap();
        ctrl.exec_emission(&handle).await.unwrap();
        assert!(ctrl.is_emitting(&handle).await.unwrap());
        assert_eq!(ctrl.emission_attempts(), 2);
    }

    #[tokio::test]
    async fn test_released_handle_is_rejected() {
        let ctrl = MockController::new();
        let handle = ctrl.connect(0).await.unwrap();
        let stale = ConnectionHandle::new(handle.raw());
        ctrl.disconnect(handle).await.unwrap();

        assert!(ctrl.verify_interlock(&stale).await.is_err());
        assert_eq!(ctrl.disconnect_count(), 1);
        assert!(!ctrl.is_connected());
    }

    #[tokio::test]
    async fn test_connect_past_device_count_fails() {
        let ctrl = MockController::with_config(MockControllerConfig {
            device_count: 0,
            ..Default::default()
        });
        assert!(ctrl.connect(0).await.is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let cfg: MockControllerConfig = toml::from_str(
            r#"
            arm_after_polls = 4
            emission_on_attempt = 2
            interlock_closed = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.arm_after_polls, Some(4));
        assert_eq!(cfg.emission_on_attempt, Some(2));
        assert!(!cfg.interlock_closed);
        assert!(cfg.key_switch_on);
    }
}
