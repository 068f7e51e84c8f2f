//! Laser bring-up procedures
//!
//! Brings the QCL and its TEC online in a fixed order, then hands over to the
//! lock-in for synchronized detection.
//!
//! # Stages
//!
//! ```text
//! Connect → Arm → SetParameters → CoolTecs → TurnOnLaser → ConnectDetector → InitializeDetector
//! ```
//!
//! Each stage waits on hardware confirmation through a [`ConvergencePoller`]
//! with its own interval and timeout ([`StageTimings`]). No stage is skipped
//! and a failed sequence is never resumed; a retry starts again at Connect.
//!
//! # Failure policy
//!
//! [`StartupSequencer::run`] wraps the whole sequence, not each stage: any
//! fault (or panic) from any stage reaches [`LaserSession::safe_shutdown`]
//! exactly once, and the original fault is then returned to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use qcl_daq::procedures::StartupSequencer;
//!
//! let mut sequencer = StartupSequencer::new(controller, lockin);
//! let mut active = sequencer.run(laser_config, detector_config).await?;
//! let buffer = active.acquisition.collect_cycles(10).await?;
//! active.shutdown().await;
//! ```

pub mod operations;
pub mod poller;
pub mod shutdown;
pub mod startup;

pub use poller::{AttemptOutcome, Converged, ConvergencePoller, PollError};
pub use shutdown::{LaserSession, ShutdownReport, ShutdownSummary};
pub use startup::{ActiveSession, StartupSequencer};

use qcl_core::data::DiagnosticWords;
use qcl_core::limits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Stages
// =============================================================================

/// Bring-up stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Open the controller and verify the QCL module and interlocks.
    Connect,
    /// Arm the laser.
    Arm,
    /// Converge the four QCL parameters.
    SetParameters,
    /// Wait for the TEC temperature-stable bit, then settle.
    CoolTecs,
    /// Command emission and wait for confirmation, with retries.
    TurnOnLaser,
    /// Open the lock-in and identify the device.
    ConnectDetector,
    /// Quiesce and configure the lock-in.
    InitializeDetector,
}

impl Stage {
    /// Every stage in execution order.
    pub const ORDER: [Stage; 7] = [
        Stage::Connect,
        Stage::Arm,
        Stage::SetParameters,
        Stage::CoolTecs,
        Stage::TurnOnLaser,
        Stage::ConnectDetector,
        Stage::InitializeDetector,
    ];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::Connect => "connect",
            Stage::Arm => "arm",
            Stage::SetParameters => "set_parameters",
            Stage::CoolTecs => "cool_tecs",
            Stage::TurnOnLaser => "turn_on_laser",
            Stage::ConnectDetector => "connect_detector",
            Stage::InitializeDetector => "initialize_detector",
        };
        write!(f, "{}", label)
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    /// Stage this result belongs to.
    pub stage: Stage,
    /// Whether the stage completed.
    pub success: bool,
    /// Time spent in the stage.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Diagnostic words read after the last turn-on attempt.
    pub diagnostics: Option<DiagnosticWords>,
}

/// One turn-on attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOnAttempt {
    /// Attempt number (1-based).
    pub attempt: u32,
    /// Whether emission was confirmed in this attempt.
    pub confirmed: bool,
    /// Diagnostic words read after the attempt; `None` if the read failed.
    pub diagnostics: Option<DiagnosticWords>,
}

/// Record of a bring-up run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StartupReport {
    /// Stage results in execution order.
    pub stages: Vec<StageResult>,
    /// Turn-on attempts in order.
    pub turn_on_attempts: Vec<TurnOnAttempt>,
}

impl StartupReport {
    /// Number of turn-on attempts made.
    pub fn attempt_count(&self) -> u32 {
        self.turn_on_attempts.len() as u32
    }

    /// Result for `stage`, if it ran.
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// Sum of all stage durations.
    pub fn total_elapsed(&self) -> Duration {
        self.stages.iter().map(|r| r.elapsed).sum()
    }
}

// =============================================================================
// Timings
// =============================================================================

/// Poll interval and timeout of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollTiming {
    /// Interval between reads.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Time allowed for confirmation.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl PollTiming {
    /// Create a timing.
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Poller for this timing.
    pub fn poller(&self) -> ConvergencePoller {
        ConvergencePoller::new(self.interval, self.timeout)
    }
}

/// Per-stage poll timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    /// Arm confirmation.
    #[serde(default = "default_arm")]
    pub arm: PollTiming,
    /// QCL parameter convergence.
    #[serde(default = "default_params")]
    pub parameters: PollTiming,
    /// TEC temperature-stable confirmation.
    #[serde(default = "default_cool")]
    pub cool: PollTiming,
    /// Hold after the TEC reports stable.
    #[serde(default = "default_cool_settle", with = "humantime_serde")]
    pub cool_settle: Duration,
    /// Emission confirmation, per attempt.
    #[serde(default = "default_emission")]
    pub emission: PollTiming,
    /// Turn-on attempts.
    #[serde(default = "default_emission_attempts")]
    pub emission_attempts: u32,
    /// Wavelength tune confirmation.
    #[serde(default = "default_tune")]
    pub tune: PollTiming,
}

fn default_arm() -> PollTiming {
    PollTiming::new(limits::ARM_POLL_INTERVAL, limits::ARM_TIMEOUT)
}

fn default_params() -> PollTiming {
    PollTiming::new(limits::PARAMS_POLL_INTERVAL, limits::PARAMS_TIMEOUT)
}

fn default_cool() -> PollTiming {
    PollTiming::new(limits::COOL_POLL_INTERVAL, limits::COOL_TIMEOUT)
}

fn default_cool_settle() -> Duration {
    limits::COOL_SETTLE
}

fn default_emission() -> PollTiming {
    PollTiming::new(
        limits::EMISSION_POLL_INTERVAL,
        limits::EMISSION_ATTEMPT_TIMEOUT,
    )
}

fn default_emission_attempts() -> u32 {
    limits::EMISSION_MAX_ATTEMPTS
}

fn default_tune() -> PollTiming {
    PollTiming::new(limits::TUNE_POLL_INTERVAL, limits::TUNE_TIMEOUT)
}

impl Default for StageTimings {
    fn default() -> Self {
        Self {
            arm: default_arm(),
            parameters: default_params(),
            cool: default_cool(),
            cool_settle: default_cool_settle(),
            emission: default_emission(),
            emission_attempts: default_emission_attempts(),
            tune: default_tune(),
        }
    }
}

impl StageTimings {
    /// Reject zero intervals, zero timeouts and zero attempts.
    pub fn validate(&self) -> Result<(), String> {
        let polls = [
            ("arm", &self.arm),
            ("parameters", &self.parameters),
            ("cool", &self.cool),
            ("emission", &self.emission),
            ("tune", &self.tune),
        ];
        for (name, timing) in polls {
            if timing.interval.is_zero() {
                return Err(format!("timing.{name}.interval must be greater than zero"));
            }
            if timing.timeout.is_zero() {
                return Err(format!("timing.{name}.timeout must be greater than zero"));
            }
        }
        if self.emission_attempts == 0 {
            return Err("timing.emission_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_fixed() {
        assert_eq!(Stage::ORDER.first(), Some(&Stage::Connect));
        assert_eq!(Stage::ORDER.last(), Some(&Stage::InitializeDetector));
        assert_eq!(Stage::TurnOnLaser.to_string(), "turn_on_laser");
    }

    #[test]
    fn test_default_timings() {
        let t = StageTimings::default();
        assert_eq!(t.arm.timeout, Duration::from_secs(20));
        assert_eq!(t.parameters.timeout, Duration::from_secs(5));
        assert_eq!(t.cool.timeout, Duration::from_secs(60));
        assert_eq!(t.cool_settle, Duration::from_secs(10));
        assert_eq!(t.emission.interval, Duration::from_secs(5));
        assert_eq!(t.emission_attempts, 3);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_timings_from_toml_use_humantime() {
        let t: StageTimings = toml::from_str(
            r#"
            emission_attempts = 5
            cool_settle = "2s"

            [arm]
            interval = "250ms"
            timeout = "3s"
            "#,
        )
        .unwrap();
        assert_eq!(t.arm.interval, Duration::from_millis(250));
        assert_eq!(t.cool_settle, Duration::from_secs(2));
        assert_eq!(t.emission_attempts, 5);
        // Unspecified stages keep their defaults.
        assert_eq!(t.cool.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let t = StageTimings {
            emission_attempts: 0,
            ..Default::default()
        };
        assert!(t.validate().is_err());
    }
}
