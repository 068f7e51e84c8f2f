//! Fault taxonomy for laser bring-up and synchronized detection.
//!
//! `QclError` is the single error type returned by every bring-up stage,
//! post-startup laser operation and acquisition step. The four hardware
//! fault variants map one-to-one onto the subsystem that failed:
//!
//! - **`Link`**: discovery, connection or safety-interlock verification of the
//!   laser controller failed. Raised before anything is energized.
//! - **`Controller`**: the controller never reported the commanded QCL
//!   parameters back (joint convergence timed out).
//! - **`Laser`**: arming, wavelength tuning, thermal stabilization or emission
//!   confirmation timed out or ran out of attempts.
//! - **`Detector`**: the lock-in instrument could not be reached, identified or
//!   configured.
//!
//! Capability implementations report failures as `anyhow::Error`; call sites
//! classify them with [`FaultContext`] so that the fault kind is decided by the
//! stage that observed the failure, not by the driver.

use thiserror::Error;

// =============================================================================
// Fault Kinds
// =============================================================================

/// Classification of a hardware fault by the subsystem that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Laser controller discovery, connection or interlock verification.
    Link,
    /// QCL parameter convergence.
    Controller,
    /// Arm, tune, cool-down or emission confirmation.
    Laser,
    /// Lock-in connection or configuration.
    Detector,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FaultKind::Link => "link",
            FaultKind::Controller => "controller",
            FaultKind::Laser => "laser",
            FaultKind::Detector => "detector",
        };
        write!(f, "{}", label)
    }
}

impl FaultKind {
    /// Build the error variant for this fault kind.
    pub fn into_error(self, message: impl Into<String>) -> QclError {
        let message = message.into();
        match self {
            FaultKind::Link => QclError::Link(message),
            FaultKind::Controller => QclError::Controller(message),
            FaultKind::Laser => QclError::Laser(message),
            FaultKind::Detector => QclError::Detector(message),
        }
    }
}

/// Convenience alias for results using the bring-up error type.
pub type QclResult<T> = std::result::Result<T, QclError>;

// =============================================================================
// Error Type
// =============================================================================

/// Primary error type for laser bring-up and acquisition.
///
/// # Error Categories
///
/// 1. **Hardware faults** - `Link`, `Controller`, `Laser`, `Detector`
///    - Raised by a bring-up stage, a post-startup laser operation or the
///      acquisition path
///    - The laser session is always shut down before one of these reaches
///      the caller
///    - Recovery: fix the hardware condition and restart the sequence from
///      the Connect stage
///
/// 2. **Configuration errors** - `Config`, `Configuration`
///    - Raised while loading or validating settings, or when a requested
///      parameter lies outside the safe operating envelope
///    - No hardware command has been issued
///
/// 3. **Reporting** - `ShutdownFailed`
///    - Collects the step failures of a safe shutdown for display. Never
///      returned in place of the fault that triggered the shutdown.
#[derive(Error, Debug)]
pub enum QclError {
    /// Controller discovery, connection or interlock verification failed.
    ///
    /// Occurs in the Connect stage when no device answers, the QCL module is
    /// missing, or the interlock loop or key switch is open.
    ///
    /// **Error Type**: Permanent until the physical condition is fixed.
    #[error("Link fault: {0}")]
    Link(String),

    /// The controller did not converge on the commanded QCL parameters.
    ///
    /// Occurs when pulse rate, pulse width, current and temperature are not
    /// all read back equal to the commanded values within the parameter
    /// timeout.
    ///
    /// **Error Type**: Usually transient. Retrying from the Connect stage is
    /// safe.
    #[error("Controller fault: {0}")]
    Controller(String),

    /// Arming, tuning, thermal stabilization or emission confirmation failed.
    ///
    /// **Error Type**: Transient or permanent. Inspect the diagnostic words
    /// recorded for each turn-on attempt.
    #[error("Laser fault: {0}")]
    Laser(String),

    /// The lock-in instrument could not be reached, identified or configured.
    ///
    /// Includes an unrecognized device family, which fails fast rather than
    /// leaving the instrument half configured.
    #[error("Detector fault: {0}")]
    Detector(String),

    /// Semantic configuration error.
    ///
    /// Values that parse but are unusable, such as a laser current outside
    /// the safe operating envelope or a zero poll interval.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// One or more steps of a safe shutdown failed.
    ///
    /// Contains every step failure so the report is complete. Shutdown is
    /// best-effort, so this is surfaced for logging only.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<QclError>),
}

impl QclError {
    /// Hardware fault kind of this error, if it is one.
    pub fn kind(&self) -> Option<FaultKind> {
        match self {
            QclError::Link(_) => Some(FaultKind::Link),
            QclError::Controller(_) => Some(FaultKind::Controller),
            QclError::Laser(_) => Some(FaultKind::Laser),
            QclError::Detector(_) => Some(FaultKind::Detector),
            _ => None,
        }
    }
}

// =============================================================================
// Classification of capability failures
// =============================================================================

/// Classifies `anyhow` failures from a capability call into a [`QclError`].
///
/// ```rust,ignore
/// let armed = link.is_armed(&handle).await.laser_fault("reading arm status")?;
/// ```
pub trait FaultContext<T> {
    /// Map the failure to a fault of the given kind, prefixed with `what`.
    fn fault(self, kind: FaultKind, what: &str) -> QclResult<T>;

    /// Map the failure to a [`QclError::Link`].
    fn link_fault(self, what: &str) -> QclResult<T>
    where
        Self: Sized,
    {
        self.fault(FaultKind::Link, what)
    }

    /// Map the failure to a [`QclError::Controller`].
    fn controller_fault(self, what: &str) -> QclResult<T>
    where
        Self: Sized,
    {
        self.fault(FaultKind::Controller, what)
    }

    /// Map the failure to a [`QclError::Laser`].
    fn laser_fault(self, what: &str) -> QclResult<T>
    where
        Self: Sized,
    {
        self.fault(FaultKind::Laser, what)
    }

    /// Map the failure to a [`QclError::Detector`].
    fn detector_fault(self, what: &str) -> QclResult<T>
    where
        Self: Sized,
    {
        self.fault(FaultKind::Detector, what)
    }
}

impl<T> FaultContext<T> for anyhow::Result<T> {
    fn fault(self, kind: FaultKind, what: &str) -> QclResult<T> {
        self.map_err(|e| kind.into_error(format!("{what}: {e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_error_display() {
        let err = QclError::Laser("emission not confirmed".to_string());
        assert_eq!(err.to_string(), "Laser fault: emission not confirmed");
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = QclError::ShutdownFailed(vec![
            QclError::Laser("emission off rejected".into()),
            QclError::Link("disconnect timed out".into()),
        ]);
        assert_eq!(err.to_string(), "Shutdown failed with 2 error(s)");
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn test_fault_context_classifies_and_keeps_chain() {
        let failed: anyhow::Result<()> =
            Err(anyhow!("socket closed").context("reading interlock"));
        let err = failed.link_fault("connect stage").unwrap_err();

        assert_eq!(err.kind(), Some(FaultKind::Link));
        let text = err.to_string();
        assert!(text.contains("connect stage"), "missing prefix: {text}");
        assert!(text.contains("reading interlock"), "missing context: {text}");
        assert!(text.contains("socket closed"), "missing cause: {text}");
    }

    #[test]
    fn test_fault_kind_round_trip() {
        for kind in [
            FaultKind::Link,
            FaultKind::Controller,
            FaultKind::Laser,
            FaultKind::Detector,
        ] {
            assert_eq!(kind.into_error("x").kind(), Some(kind));
        }
    }
}
