//! Layered configuration using Figment
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. A TOML file (default `config/qcl_daq.toml`)
//! 3. Environment variables prefixed with `QCL_DAQ_`, nested keys split on
//!    `__` (e.g. `QCL_DAQ_DETECTOR__ADDRESS=10.0.0.5`)
//!
//! ```no_run
//! use qcl_daq::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load_from("config/qcl_daq.toml")?;
//! for warning in settings.validate()? {
//!     eprintln!("warning: {warning}");
//! }
//! # Ok(())
//! # }
//! ```

use crate::logging::{self, OutputFormat};
use crate::procedures::StageTimings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use qcl_core::data::{DetectorConfiguration, LaserConfiguration};
use qcl_core::error::{QclError, QclResult};
use qcl_core::limits::ParameterLimits;
use qcl_driver_mock::{MockControllerConfig, MockLockinConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/qcl_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "QCL_DAQ_";

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Laser operating point
    pub laser: LaserConfiguration,
    /// Lock-in settings
    pub detector: DetectorConfiguration,
    /// Stage poll intervals and timeouts
    pub timing: StageTimings,
    /// Safe operating envelope
    pub limits: ParameterLimits,
    /// Simulated devices used by `qcl-daq simulate`
    pub simulation: SimulationSettings,
}

/// Application-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "QCL DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Behaviour of the simulated controller and lock-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Simulated controller
    #[serde(default)]
    pub controller: MockControllerConfig,
    /// Simulated lock-in
    #[serde(default)]
    pub lockin: MockLockinConfig,
    /// Acquisition cycles collected after bring-up
    #[serde(default = "default_cycles")]
    pub cycles: usize,
}

fn default_cycles() -> usize {
    3
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            controller: MockControllerConfig::default(),
            lockin: MockLockinConfig::default(),
            cycles: default_cycles(),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> QclResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file leaves defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> QclResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The layered provider used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check the settings before any hardware is touched.
    ///
    /// Returns non-fatal warnings; errors are returned as
    /// [`QclError::Configuration`].
    pub fn validate(&self) -> QclResult<Vec<String>> {
        logging::parse_log_level(&self.application.log_level).map_err(QclError::Configuration)?;
        self.limits.check(&self.laser)?;
        self.timing.validate().map_err(QclError::Configuration)?;
        self.detector.validate()?;
        self.detector.check_reference(self.laser.pulse_rate_hz)?;

        let detector = &self.detector;
        let mut warnings = Vec::new();
        if detector.settle_time_constants < 5.0 {
            warnings.push(format!(
                "detector.settle_time_constants ({}) is short for a 4th order filter",
                detector.settle_time_constants
            ));
        }
        if self.simulation.cycles == 0 {
            warnings.push("simulation.cycles is 0, simulate collects no data".to_string());
        }
        Ok(warnings)
    }
}
