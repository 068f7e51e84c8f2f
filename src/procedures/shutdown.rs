//! Safe shutdown and the owned laser connection.
//!
//! [`LaserSession`] owns the controller's [`ConnectionHandle`]. The only way
//! to release it is [`LaserSession::safe_shutdown`], which commands emission
//! off and disarm before disconnecting. Shutdown is best-effort: every step is
//! attempted, step failures are logged and collected in the
//! [`ShutdownReport`], and nothing is raised. After the first call the handle
//! is gone, so later calls do nothing.
//!
//! Dropping a session that still holds its handle schedules the same
//! shutdown on the current Tokio runtime.

use crate::procedures::StageTimings;
use qcl_core::capabilities::{ConnectionHandle, HardwareLink};
use qcl_core::data::QclParameterSet;
use qcl_core::error::{FaultContext, QclError, QclResult};
use qcl_core::limits::ParameterLimits;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a safe shutdown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// False when the handle had already been released.
    pub executed: bool,
    /// Steps that failed, in order.
    pub errors: Vec<QclError>,
}

impl ShutdownReport {
    /// True when every step succeeded (or nothing had to be done).
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collect the step failures into a single error for display.
    pub fn into_error(self) -> Option<QclError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(QclError::ShutdownFailed(self.errors))
        }
    }
}

/// Serializable summary of a [`ShutdownReport`].
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownSummary {
    /// Whether shutdown ran.
    pub executed: bool,
    /// Step failures as text.
    pub errors: Vec<String>,
}

impl From<&ShutdownReport> for ShutdownSummary {
    fn from(report: &ShutdownReport) -> Self {
        Self {
            executed: report.executed,
            errors: report.errors.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// De-energize and disconnect. Every step runs even if an earlier one fails.
async fn shutdown_steps(link: &dyn HardwareLink, handle: ConnectionHandle) -> Vec<QclError> {
    let mut errors = Vec::new();
    let raw = handle.raw();

    let emission_off = async {
        link.set_emission(&handle, false).await?;
        link.exec_emission(&handle).await
    };
    if let Err(e) = emission_off.await.laser_fault("emission off") {
        warn!(handle = raw, error = %e, "shutdown step failed");
        errors.push(e);
    }

    let disarm = async {
        link.set_armed(&handle, false).await?;
        link.exec_arm(&handle).await
    };
    if let Err(e) = disarm.await.laser_fault("disarm") {
        warn!(handle = raw, error = %e, "shutdown step failed");
        errors.push(e);
    }

    if let Err(e) = link.disconnect(handle).await.link_fault("disconnect") {
        warn!(handle = raw, error = %e, "shutdown step failed");
        errors.push(e);
    }

    errors
}

/// An open, exclusively owned connection to the laser controller.
pub struct LaserSession {
    link: Arc<dyn HardwareLink>,
    handle: Option<ConnectionHandle>,
    emission_confirmed: bool,
    converged: Option<QclParameterSet>,
    pub(crate) timings: StageTimings,
    pub(crate) limits: ParameterLimits,
}

impl std::fmt::Debug for LaserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaserSession")
            .field("handle", &self.handle)
            .field("emission_confirmed", &self.emission_confirmed)
            .field("converged", &self.converged)
            .finish()
    }
}

impl LaserSession {
    /// Take ownership of a freshly opened handle.
    pub fn new(
        link: Arc<dyn HardwareLink>,
        handle: ConnectionHandle,
        timings: StageTimings,
        limits: ParameterLimits,
    ) -> Self {
        Self {
            link,
            handle: Some(handle),
            emission_confirmed: false,
            converged: None,
            timings,
            limits,
        }
    }

    /// True while the handle is held.
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// True once the controller has confirmed emission, until shutdown.
    pub fn laser_on(&self) -> bool {
        self.emission_confirmed
    }

    /// Parameters the controller last converged on.
    pub fn converged_parameters(&self) -> Option<&QclParameterSet> {
        self.converged.as_ref()
    }

    /// Link and handle for issuing commands.
    pub(crate) fn parts(&self) -> QclResult<(&dyn HardwareLink, &ConnectionHandle)> {
        match &self.handle {
            Some(handle) => Ok((self.link.as_ref(), handle)),
            None => Err(QclError::Link("connection already released".to_string())),
        }
    }

    pub(crate) fn set_converged(&mut self, params: QclParameterSet) {
        self.converged = Some(params);
    }

    pub(crate) fn confirm_emission(&mut self) {
        self.emission_confirmed = true;
    }

    /// Command emission off and disarm, then release the connection.
    ///
    /// Never fails; step failures are in the report. Calling it again after
    /// the handle was released does nothing.
    pub async fn safe_shutdown(&mut self) -> ShutdownReport {
        let Some(handle) = self.handle.take() else {
            return ShutdownReport::default();
        };
        self.emission_confirmed = false;

        info!(handle = handle.raw(), "safe shutdown");
        let errors = shutdown_steps(self.link.as_ref(), handle).await;
        if errors.is_empty() {
            info!("laser off and disconnected");
        } else {
            warn!(failures = errors.len(), "safe shutdown finished with errors");
        }

        ShutdownReport {
            executed: true,
            errors,
        }
    }
}

impl Drop for LaserSession {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        warn!(
            handle = handle.raw(),
            "laser session dropped while connected, scheduling shutdown"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let link = Arc::clone(&self.link);
                runtime.spawn(async move {
                    shutdown_steps(link.as_ref(), handle).await;
                });
            }
            Err(_) => {
                tracing::error!("no runtime available, laser left connected");
            }
        }
    }
}
