//! Operations on a laser that is already emitting.
//!
//! Wavelength tuning and parameter updates run on the same [`LaserSession`]
//! that bring-up produced. A requested value outside the safe operating
//! envelope is rejected before any command is sent. A hardware fault shuts
//! the laser down before it is returned, the same as during bring-up.

use crate::procedures::startup::{converge_parameters, poll_fault};
use crate::procedures::{ActiveSession, LaserSession};
use qcl_core::data::{QclParameterSet, WavelengthUnit};
use qcl_core::error::{FaultContext, FaultKind, QclResult};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

/// New values for some of the jointly commanded QCL parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterUpdate {
    /// Pulse rate in Hz.
    pub pulse_rate_hz: Option<f64>,
    /// Pulse width in ns.
    pub pulse_width_ns: Option<f64>,
    /// Drive current in mA.
    pub current_ma: Option<f64>,
    /// TEC temperature in °C.
    pub temperature_c: Option<f64>,
}

impl ParameterUpdate {
    /// Change the pulse rate.
    pub fn pulse_rate(mut self, hz: f64) -> Self {
        self.pulse_rate_hz = Some(hz);
        self
    }

    /// Change the pulse width.
    pub fn pulse_width(mut self, ns: f64) -> Self {
        self.pulse_width_ns = Some(ns);
        self
    }

    /// Change the drive current.
    pub fn current(mut self, ma: f64) -> Self {
        self.current_ma = Some(ma);
        self
    }

    /// Change the TEC temperature.
    pub fn temperature(mut self, c: f64) -> Self {
        self.temperature_c = Some(c);
        self
    }

    /// True when nothing would change.
    pub fn is_empty(&self) -> bool {
        self.pulse_rate_hz.is_none()
            && self.pulse_width_ns.is_none()
            && self.current_ma.is_none()
            && self.temperature_c.is_none()
    }

    fn apply(&self, base: &QclParameterSet) -> QclParameterSet {
        QclParameterSet {
            pulse_rate_hz: self.pulse_rate_hz.unwrap_or(base.pulse_rate_hz),
            pulse_width_ns: self.pulse_width_ns.unwrap_or(base.pulse_width_ns),
            current_ma: self.current_ma.unwrap_or(base.current_ma),
            temperature_c: self.temperature_c.unwrap_or(base.temperature_c),
            ..base.clone()
        }
    }
}

impl LaserSession {
    /// Shut down on a hardware fault, then hand the result back.
    async fn shutdown_on_fault<T>(&mut self, result: QclResult<T>) -> QclResult<T> {
        if let Err(e) = &result {
            if e.kind().is_some() {
                error!(error = %e, "laser operation failed, shutting down");
                self.safe_shutdown().await;
            }
        }
        result
    }

    /// Tune to `value` in `unit` and wait for the tuned bit.
    #[instrument(skip(self), err)]
    pub async fn tune(&mut self, unit: WavelengthUnit, value: f64) -> QclResult<()> {
        self.limits.check_wavelength(unit, value)?;
        let result = self.tune_inner(unit, value).await;
        self.shutdown_on_fault(result).await
    }

    async fn tune_inner(&mut self, unit: WavelengthUnit, value: f64) -> QclResult<()> {
        let timing = self.timings.tune;
        let (link, handle) = self.parts()?;
        link.set_tune_target(handle, unit, value)
            .await
            .laser_fault("tune command")?;
        link.exec_tune(handle).await.laser_fault("tune command")?;

        let tuned = timing
            .poller()
            .poll_until(move || link.is_tuned(handle), |tuned| *tuned)
            .await
            .map_err(|e| poll_fault(FaultKind::Laser, "wavelength not tuned", e))?;
        info!(value, unit_code = unit.code(), elapsed = ?tuned.elapsed, "laser tuned");
        Ok(())
    }

    /// Change some QCL parameters and wait for all four to converge again.
    ///
    /// Unchanged fields keep the values from the last convergence.
    #[instrument(skip(self), err)]
    pub async fn update_parameters(
        &mut self,
        update: ParameterUpdate,
    ) -> QclResult<QclParameterSet> {
        if let Some(rate) = update.pulse_rate_hz {
            self.limits.check_pulse_rate(rate)?;
        }
        if let Some(width) = update.pulse_width_ns {
            self.limits.check_pulse_width(width)?;
        }
        if let Some(current) = update.current_ma {
            self.limits.check_current(current)?;
        }
        let result = self.update_inner(update).await;
        self.shutdown_on_fault(result).await
    }

    async fn update_inner(&mut self, update: ParameterUpdate) -> QclResult<QclParameterSet> {
        let base = match self.converged_parameters() {
            Some(params) => params.clone(),
            None => {
                let (link, handle) = self.parts()?;
                link.read_qcl_params(handle)
                    .await
                    .controller_fault("reading QCL parameters")?
            }
        };
        let timing = self.timings.parameters;
        converge_parameters(self, update.apply(&base), timing).await
    }
}

impl ActiveSession {
    /// Update laser parameters and keep the lock-in reference oscillator on
    /// the new pulse rate.
    ///
    /// The oscillator is rewritten only when the update changes the pulse
    /// rate, using the value read back from the controller. A lock-in fault
    /// shuts the whole session down before it is returned.
    pub async fn update_parameters(
        &mut self,
        update: ParameterUpdate,
    ) -> QclResult<QclParameterSet> {
        let params = self.laser.update_parameters(update).await?;
        if update.pulse_rate_hz.is_some() {
            if let Err(e) = self
                .acquisition
                .set_modulation_frequency(params.pulse_rate_hz)
                .await
            {
                error!(error = %e, "lock-in retune failed, shutting down");
                let report = self.shutdown().await;
                if let Some(shutdown) = report.into_error() {
                    warn!(error = %shutdown, "shutdown after fault was incomplete");
                }
                return Err(e);
            }
        }
        Ok(params)
    }
}
