//! Data model shared by the bring-up sequencer, the acquisition path and
//! the device implementations.
//!
//! Configuration types (`LaserConfiguration`, `DetectorConfiguration`) are
//! plain values built once by the caller. Hardware readings
//! (`QclParameterSet`, `DiagnosticWords`, `PollResponse`) are created fresh on
//! every read and never cached.

use crate::error::{QclError, QclResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// =============================================================================
// Laser
// =============================================================================

/// Unit used when commanding a tune target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WavelengthUnit {
    /// Micrometres.
    Microns,
    /// Inverse centimetres.
    Wavenumber,
}

impl WavelengthUnit {
    /// Unit code understood by the controller.
    pub fn code(self) -> u8 {
        match self {
            WavelengthUnit::Microns => 1,
            WavelengthUnit::Wavenumber => 2,
        }
    }
}

/// Static laser operating point supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserConfiguration {
    /// Target wavelength, in `unit`.
    pub wavelength: f64,
    /// Unit of `wavelength`.
    #[serde(default = "default_unit")]
    pub unit: WavelengthUnit,
    /// Drive current in mA.
    pub current_ma: f64,
    /// Pulse width in ns.
    pub pulse_width_ns: f64,
    /// Pulse repetition rate in Hz.
    pub pulse_rate_hz: f64,
    /// TEC target temperature in °C.
    pub temperature_c: f64,
}

fn default_unit() -> WavelengthUnit {
    WavelengthUnit::Wavenumber
}

impl Default for LaserConfiguration {
    fn default() -> Self {
        Self {
            wavelength: 1020.0,
            unit: WavelengthUnit::Wavenumber,
            current_ma: 1500.0,
            pulse_width_ns: 500.0,
            pulse_rate_hz: 100_000.0,
            temperature_c: 17.0,
        }
    }
}

/// Absolute tolerance used when comparing commanded and measured values.
pub const CONVERGENCE_TOLERANCE: f64 = 1e-6;

/// QCL parameters as read from (or written to) the controller.
///
/// The four jointly commanded fields are `pulse_rate_hz`, `pulse_width_ns`,
/// `current_ma` and `temperature_c`. The remaining fields are owned by the
/// controller and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QclParameterSet {
    /// Pulse repetition rate in Hz.
    pub pulse_rate_hz: f64,
    /// Pulse width in ns.
    pub pulse_width_ns: f64,
    /// Drive current in mA.
    pub current_ma: f64,
    /// TEC temperature in °C.
    pub temperature_c: f64,
    /// Controller slot holding the QCL.
    pub slot_id: u8,
    /// Laser mode register.
    pub laser_mode: u8,
    /// Pulse mode register.
    pub pulse_mode: u8,
    /// Source voltage in V.
    pub source_voltage: f64,
}

impl QclParameterSet {
    /// Copy of `self` with the four commanded fields taken from `config`.
    pub fn with_commanded(&self, config: &LaserConfiguration) -> Self {
        Self {
            pulse_rate_hz: config.pulse_rate_hz,
            pulse_width_ns: config.pulse_width_ns,
            current_ma: config.current_ma,
            temperature_c: config.temperature_c,
            ..self.clone()
        }
    }

    /// True when all four commanded fields match `commanded`.
    pub fn converged_with(&self, commanded: &QclParameterSet) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= CONVERGENCE_TOLERANCE;
        close(self.pulse_rate_hz, commanded.pulse_rate_hz)
            && close(self.pulse_width_ns, commanded.pulse_width_ns)
            && close(self.current_ma, commanded.current_ma)
            && close(self.temperature_c, commanded.temperature_c)
    }
}

/// Raw status, error and warning registers of the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticWords {
    /// System status word.
    pub status: u32,
    /// System error word.
    pub error: u32,
    /// System warning word.
    pub warning: u32,
}

// =============================================================================
// Detector
// =============================================================================

/// Lock-in instrument address and demodulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfiguration {
    /// Data server address.
    pub address: String,
    /// Data server port.
    pub port: u16,
    /// Signal input channel.
    pub input_channel: u8,
    /// Demodulator channel sampled during collection.
    pub demod_channel: u8,
    /// Oscillator driving the demodulator.
    pub osc_channel: u8,
    /// Expected oscillator frequency in Hz. The oscillator always runs at
    /// the laser pulse rate; when set, this must equal it.
    #[serde(default)]
    pub osc_frequency_hz: Option<f64>,
    /// Demodulator filter time constant in seconds.
    pub time_constant_s: f64,
    /// Demodulator sample rate in Sa/s.
    pub demod_rate: f64,
    /// Signal input range in V.
    pub input_range_v: f64,
    /// Recording length of one poll.
    #[serde(with = "humantime_serde")]
    pub poll_length: Duration,
    /// Poll timeout.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    /// Settle delay after configuration, in multiples of the time constant.
    pub settle_time_constants: f64,
}

impl Default for DetectorConfiguration {
    fn default() -> Self {
        Self {
            address: "192.168.48.102".to_string(),
            port: 8004,
            input_channel: 0,
            demod_channel: 0,
            osc_channel: 0,
            osc_frequency_hz: None,
            time_constant_s: 1e-2,
            demod_rate: 2e3,
            input_range_v: 2.0,
            poll_length: Duration::from_secs(30),
            poll_timeout: Duration::from_millis(500),
            settle_time_constants: 10.0,
        }
    }
}

impl DetectorConfiguration {
    /// Reject settings the lock-in cannot sample with.
    pub fn validate(&self) -> QclResult<()> {
        if self.time_constant_s <= 0.0 {
            return Err(QclError::Configuration(
                "detector.time_constant_s must be greater than zero".to_string(),
            ));
        }
        if self.demod_rate <= 0.0 {
            return Err(QclError::Configuration(
                "detector.demod_rate must be greater than zero".to_string(),
            ));
        }
        if self.input_range_v <= 0.0 {
            return Err(QclError::Configuration(
                "detector.input_range_v must be greater than zero".to_string(),
            ));
        }
        if self.poll_length.is_zero() {
            return Err(QclError::Configuration(
                "detector.poll_length must be greater than zero".to_string(),
            ));
        }
        if self.settle_time_constants < 0.0 {
            return Err(QclError::Configuration(
                "detector.settle_time_constants must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Check a pinned oscillator frequency against the laser pulse rate.
    pub fn check_reference(&self, pulse_rate_hz: f64) -> QclResult<()> {
        match self.osc_frequency_hz {
            Some(freq) if (freq - pulse_rate_hz).abs() > CONVERGENCE_TOLERANCE => {
                Err(QclError::Configuration(format!(
                    "detector.osc_frequency_hz ({freq}) differs from the laser pulse rate ({pulse_rate_hz})"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Delay between finishing configuration and the first sample.
    pub fn settle_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.time_constant_s * self.settle_time_constants)
            .unwrap_or_default()
    }
}

/// Value written to an instrument node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeValue {
    /// Integer node.
    Int(i64),
    /// Floating-point node.
    Double(f64),
}

impl From<i64> for NodeValue {
    fn from(value: i64) -> Self {
        NodeValue::Int(value)
    }
}

impl From<f64> for NodeValue {
    fn from(value: f64) -> Self {
        NodeValue::Double(value)
    }
}

/// One demodulator sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemodSample {
    /// In-phase component.
    pub x: f64,
    /// Quadrature component.
    pub y: f64,
    /// Raw timestamp in clock ticks.
    pub timestamp: u64,
}

impl DemodSample {
    /// Signal magnitude `sqrt(x² + y²)`.
    pub fn magnitude(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Samples returned for one subscribed node by a single poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DemodSampleBlock {
    /// Samples in acquisition order.
    pub samples: Vec<DemodSample>,
    /// Set when the instrument dropped samples within this block.
    pub data_loss: bool,
}

/// Result of one poll: sample blocks keyed by lower-case node path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollResponse {
    nodes: HashMap<String, DemodSampleBlock>,
}

impl PollResponse {
    /// Empty response (nothing was buffered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block for `path`.
    pub fn with_node(mut self, path: &str, block: DemodSampleBlock) -> Self {
        self.nodes.insert(path.to_ascii_lowercase(), block);
        self
    }

    /// Block for `path`, if present.
    pub fn sample(&self, path: &str) -> Option<&DemodSampleBlock> {
        self.nodes.get(&path.to_ascii_lowercase())
    }

    /// Number of nodes in the response.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the response carries no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// =============================================================================
// Device families
// =============================================================================

/// Known lock-in families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceFamily {
    /// UHF series.
    Uhf,
    /// HF2 series.
    Hf2,
    /// MF series.
    Mf,
}

/// Per-family configuration behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyCapabilities {
    /// Demodulators must be disabled during quiesce.
    pub disable_demods: bool,
    /// Scopes must be disabled during quiesce.
    pub disable_scopes: bool,
    /// The scope trigger channel must be reset during quiesce.
    pub reset_scope_trigger: bool,
    /// The selected demodulator must be enabled explicitly.
    pub explicit_demod_enable: bool,
}

impl DeviceFamily {
    /// Identify the family from the instrument's `features/devtype` string.
    pub fn from_devtype(devtype: &str) -> QclResult<Self> {
        let devtype = devtype.trim().to_ascii_uppercase();
        if devtype.starts_with("UHF") {
            Ok(DeviceFamily::Uhf)
        } else if devtype.starts_with("HF2") {
            Ok(DeviceFamily::Hf2)
        } else if devtype.starts_with("MF") {
            Ok(DeviceFamily::Mf)
        } else {
            Err(QclError::Detector(format!(
                "unrecognized device family '{}'",
                devtype
            )))
        }
    }

    /// Capability table for this family.
    pub fn capabilities(self) -> FamilyCapabilities {
        match self {
            DeviceFamily::Uhf => FamilyCapabilities {
                disable_demods: true,
                disable_scopes: true,
                reset_scope_trigger: false,
                explicit_demod_enable: true,
            },
            DeviceFamily::Hf2 => FamilyCapabilities {
                disable_demods: false,
                disable_scopes: false,
                reset_scope_trigger: true,
                explicit_demod_enable: false,
            },
            DeviceFamily::Mf => FamilyCapabilities {
                disable_demods: false,
                disable_scopes: true,
                reset_scope_trigger: false,
                explicit_demod_enable: false,
            },
        }
    }
}

/// True when the `features/options` string lists `option`.
pub fn has_option(options: &str, option: &str) -> bool {
    options
        .split(|c: char| c.is_whitespace() || c == ',')
        .any(|token| token.eq_ignore_ascii_case(option))
}
