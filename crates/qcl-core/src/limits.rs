//! Default stage timings and the laser's safe operating envelope.
//!
//! This module centralizes:
//! - Poll intervals, timeouts and attempt counts for each bring-up stage
//! - Exclusive bounds on every commandable laser parameter

use crate::data::{LaserConfiguration, WavelengthUnit};
use crate::error::QclError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Stage Timings
// =============================================================================

/// Interval between arm status reads (1 second).
pub const ARM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Time allowed for the armed bit to come up (20 seconds).
pub const ARM_TIMEOUT: Duration = Duration::from_secs(20);

/// Interval between QCL parameter reads (1 second).
pub const PARAMS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Time allowed for all four QCL parameters to read back (5 seconds).
pub const PARAMS_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between TEC status reads (1 second).
pub const COOL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Time allowed for the temperature-stable bit (60 seconds).
pub const COOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Hold after the temperature-stable bit is set (10 seconds).
///
/// The status bit comes up before the QCL has fully settled.
pub const COOL_SETTLE: Duration = Duration::from_secs(10);

/// Interval between emission status reads (5 seconds).
pub const EMISSION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Time allowed per turn-on attempt (30 seconds).
pub const EMISSION_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of turn-on attempts before giving up (3).
pub const EMISSION_MAX_ATTEMPTS: u32 = 3;

/// Interval between tune status reads (1 second).
pub const TUNE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Time allowed for a wavelength tune (50 seconds).
pub const TUNE_TIMEOUT: Duration = Duration::from_secs(50);

// =============================================================================
// Safe Operating Envelope
// =============================================================================

/// Open interval `(min, max)`; both ends are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Exclusive lower bound.
    pub min: f64,
    /// Exclusive upper bound.
    pub max: f64,
}

impl Bounds {
    /// Create bounds.
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// True when `value` lies strictly inside the bounds.
    pub fn contains(&self, value: f64) -> bool {
        value > self.min && value < self.max
    }

    fn check(&self, name: &str, unit: &str, value: f64) -> Result<(), QclError> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(QclError::Configuration(format!(
                "{} {} {} outside safe range ({}, {}) {}",
                name, value, unit, self.min, self.max, unit
            )))
        }
    }
}

/// Bounds for every commandable laser parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterLimits {
    /// Wavenumber in cm-1.
    pub wavenumber: Bounds,
    /// Drive current in mA.
    pub current_ma: Bounds,
    /// Pulse width in ns.
    pub pulse_width_ns: Bounds,
    /// Pulse rate in Hz.
    pub pulse_rate_hz: Bounds,
}

impl Default for ParameterLimits {
    fn default() -> Self {
        Self {
            wavenumber: Bounds::new(900.0, 1300.0),
            current_ma: Bounds::new(1100.0, 1700.0),
            pulse_width_ns: Bounds::new(400.0, 2600.0),
            pulse_rate_hz: Bounds::new(1_000.0, 1_000_000.0),
        }
    }
}

impl ParameterLimits {
    /// Check a tune target. Micron targets are converted to wavenumber.
    pub fn check_wavelength(&self, unit: WavelengthUnit, value: f64) -> Result<(), QclError> {
        let wavenumber = match unit {
            WavelengthUnit::Wavenumber => value,
            WavelengthUnit::Microns if value > 0.0 => 1e4 / value,
            WavelengthUnit::Microns => {
                return Err(QclError::Configuration(format!(
                    "wavelength {} um is not positive",
                    value
                )))
            }
        };
        self.wavenumber.check("wavenumber", "cm-1", wavenumber)
    }

    /// Check a drive current.
    pub fn check_current(&self, current_ma: f64) -> Result<(), QclError> {
        self.current_ma.check("current", "mA", current_ma)
    }

    /// Check a pulse width.
    pub fn check_pulse_width(&self, width_ns: f64) -> Result<(), QclError> {
        self.pulse_width_ns.check("pulse width", "ns", width_ns)
    }

    /// Check a pulse rate.
    pub fn check_pulse_rate(&self, rate_hz: f64) -> Result<(), QclError> {
        self.pulse_rate_hz.check("pulse rate", "Hz", rate_hz)
    }

    /// Check every field of a laser configuration.
    pub fn check(&self, config: &LaserConfiguration) -> Result<(), QclError> {
        self.check_wavelength(config.unit, config.wavelength)?;
        self.check_current(config.current_ma)?;
        self.check_pulse_width(config.pulse_width_ns)?;
        self.check_pulse_rate(config.pulse_rate_hz)
    }
}
