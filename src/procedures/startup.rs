//! Ordered, timeout-bounded bring-up of the laser and the lock-in.

use crate::acquisition::AcquisitionSession;
use crate::procedures::{
    LaserSession, PollError, PollTiming, ShutdownReport, Stage, StageResult, StageTimings,
    StartupReport, TurnOnAttempt,
};
use futures::FutureExt;
use qcl_core::capabilities::{DetectorLink, HardwareLink};
use qcl_core::data::{DetectorConfiguration, LaserConfiguration, QclParameterSet};
use qcl_core::error::{FaultContext, FaultKind, QclError, QclResult};
use qcl_core::limits::ParameterLimits;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

/// Build a stage fault from a poll failure.
pub(crate) fn poll_fault(kind: FaultKind, what: &str, err: PollError) -> QclError {
    kind.into_error(format!("{what}: {err:#}"))
}

fn require(ok: bool, what: &str) -> QclResult<()> {
    if ok {
        Ok(())
    } else {
        Err(QclError::Link(what.to_string()))
    }
}

/// Run one stage, recording its outcome and duration.
async fn timed<T>(
    report: &mut StartupReport,
    stage: Stage,
    work: impl Future<Output = QclResult<T>>,
) -> QclResult<T> {
    let start = Instant::now();
    info!(%stage, "stage started");
    let result = work.await;
    let elapsed = start.elapsed();

    report.stages.push(StageResult {
        stage,
        success: result.is_ok(),
        elapsed,
        diagnostics: None,
    });
    match &result {
        Ok(_) => info!(%stage, ?elapsed, "stage complete"),
        Err(e) => error!(%stage, ?elapsed, error = %e, "stage failed"),
    }
    result
}

// =============================================================================
// Stages
// =============================================================================

async fn connect<'a>(
    controller: &Arc<dyn HardwareLink>,
    timings: &StageTimings,
    limits: &ParameterLimits,
    slot: &'a mut Option<LaserSession>,
) -> QclResult<&'a mut LaserSession> {
    controller
        .search_devices()
        .await
        .link_fault("searching for controllers")?;
    let count = controller
        .device_count()
        .await
        .link_fault("counting controllers")?;
    if count == 0 {
        return Err(QclError::Link("no controller found".to_string()));
    }

    let index = count - 1;
    let handle = controller
        .connect(index)
        .await
        .link_fault("connecting to controller")?;
    info!(handle = handle.raw(), index, "controller connected");

    // Owned from here on, so a failed check below still reaches shutdown.
    let session = slot.insert(LaserSession::new(
        Arc::clone(controller),
        handle,
        timings.clone(),
        limits.clone(),
    ));

    let (link, handle) = session.parts()?;
    let present = link
        .is_qcl_present(handle)
        .await
        .link_fault("querying QCL module")?;
    require(present, "QCL module not detected")?;
    let interlock = link
        .verify_interlock(handle)
        .await
        .link_fault("reading interlock")?;
    require(interlock, "interlock loop open")?;
    let key_switch = link
        .verify_key_switch(handle)
        .await
        .link_fault("reading key switch")?;
    require(key_switch, "key switch not set")?;

    Ok(session)
}

async fn arm(session: &LaserSession, timing: PollTiming) -> QclResult<()> {
    let (link, handle) = session.parts()?;
    link.set_armed(handle, true).await.laser_fault("arm command")?;
    link.exec_arm(handle).await.laser_fault("arm command")?;

    let armed = timing
        .poller()
        .poll_until(move || link.is_armed(handle), |armed| *armed)
        .await
        .map_err(|e| poll_fault(FaultKind::Laser, "laser not armed", e))?;
    info!(reads = armed.iterations, elapsed = ?armed.elapsed, "laser armed");
    Ok(())
}

/// Write `commanded` and wait until all four QCL fields read back equal.
pub(crate) async fn converge_parameters(
    session: &mut LaserSession,
    commanded: QclParameterSet,
    timing: PollTiming,
) -> QclResult<QclParameterSet> {
    let (link, handle) = session.parts()?;
    link.write_qcl_params(handle, &commanded)
        .await
        .controller_fault("writing QCL parameters")?;

    let converged = timing
        .poller()
        .poll_until(
            move || link.read_qcl_params(handle),
            |read| read.converged_with(&commanded),
        )
        .await
        .map_err(|e| poll_fault(FaultKind::Controller, "QCL parameters not set", e))?;

    let params = converged.state;
    info!(
        pulse_rate_hz = params.pulse_rate_hz,
        pulse_width_ns = params.pulse_width_ns,
        current_ma = params.current_ma,
        temperature_c = params.temperature_c,
        reads = converged.iterations,
        "QCL parameters converged"
    );
    session.set_converged(params.clone());
    Ok(params)
}

async fn set_parameters(
    session: &mut LaserSession,
    laser: &LaserConfiguration,
    timing: PollTiming,
) -> QclResult<QclParameterSet> {
    let (link, handle) = session.parts()?;
    let current = link
        .read_qcl_params(handle)
        .await
        .controller_fault("reading QCL parameters")?;
    converge_parameters(session, current.with_commanded(laser), timing).await
}

async fn cool_tecs(session: &LaserSession, timings: &StageTimings) -> QclResult<()> {
    let (link, handle) = session.parts()?;
    let stable = timings
        .cool
        .poller()
        .poll_until(move || link.is_temp_stable(handle), |stable| *stable)
        .await
        .map_err(|e| poll_fault(FaultKind::Laser, "TECs did not stabilize", e))?;

    info!(
        elapsed = ?stable.elapsed,
        settle = ?timings.cool_settle,
        "TEC temperature stable, settling"
    );
    tokio::time::sleep(timings.cool_settle).await;
    Ok(())
}

async fn turn_on_laser(
    session: &mut LaserSession,
    timings: &StageTimings,
    records: &mut Vec<TurnOnAttempt>,
) -> QclResult<()> {
    let (link, handle) = session.parts()?;
    let outcome = timings
        .emission
        .poller()
        .with_max_attempts(timings.emission_attempts)
        .poll_attempts(
            move |attempt| async move {
                info!(attempt, "commanding emission on");
                link.set_emission(handle, true).await?;
                link.exec_emission(handle).await
            },
            move || link.is_emitting(handle),
            |emitting| *emitting,
            move |attempt, confirmed| async move {
                let diagnostics = match link.read_diagnostic_words(handle).await {
                    Ok(words) => {
                        if confirmed {
                            info!(
                                attempt,
                                status = words.status,
                                error = words.error,
                                warning = words.warning,
                                "emission confirmed"
                            );
                        } else {
                            warn!(
                                attempt,
                                status = words.status,
                                error = words.error,
                                warning = words.warning,
                                "emission not confirmed"
                            );
                        }
                        Some(words)
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "could not read diagnostic words");
                        None
                    }
                };
                TurnOnAttempt {
                    attempt,
                    confirmed,
                    diagnostics,
                }
            },
        )
        .await;

    *records = outcome.records;
    outcome
        .result
        .map_err(|e| poll_fault(FaultKind::Laser, "laser did not turn on", e))?;
    session.confirm_emission();
    Ok(())
}

// =============================================================================
// Sequencer
// =============================================================================

/// A laser that is emitting and a lock-in ready for sampling.
#[derive(Debug)]
pub struct ActiveSession {
    /// Open controller connection.
    pub laser: LaserSession,
    /// Configured lock-in.
    pub acquisition: AcquisitionSession,
    /// What happened during bring-up.
    pub report: StartupReport,
}

impl ActiveSession {
    /// Shut the laser down, then close the lock-in session.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let report = self.laser.safe_shutdown().await;
        self.acquisition.close().await;
        report
    }
}

/// Runs the bring-up stages in order against one controller and one lock-in.
pub struct StartupSequencer {
    controller: Arc<dyn HardwareLink>,
    detector: Arc<dyn DetectorLink>,
    timings: StageTimings,
    limits: ParameterLimits,
}

impl StartupSequencer {
    /// Sequencer with default timings and limits.
    pub fn new(controller: Arc<dyn HardwareLink>, detector: Arc<dyn DetectorLink>) -> Self {
        Self {
            controller,
            detector,
            timings: StageTimings::default(),
            limits: ParameterLimits::default(),
        }
    }

    /// Use these stage timings.
    pub fn with_timings(mut self, timings: StageTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Use this safe operating envelope.
    pub fn with_limits(mut self, limits: ParameterLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Stage timings in use.
    pub fn timings(&self) -> &StageTimings {
        &self.timings
    }

    /// Run every stage in order.
    ///
    /// The stage timings, the laser envelope and the detector settings
    /// (including a pinned oscillator frequency that disagrees with
    /// `laser.pulse_rate_hz`) are checked first; a rejected value returns
    /// [`QclError::Configuration`] before any hardware is touched.
    ///
    /// On a fault from any stage the laser is shut down (and the lock-in
    /// session closed) before the fault is returned. A shutdown step that
    /// fails is logged and does not replace that fault. A panic inside a
    /// stage is handled the same way and then resumed. Takes `&mut self`, so
    /// one sequencer never runs two sequences at once.
    ///
    /// The lock-in reference oscillator is set to the pulse rate read back
    /// from the controller. `laser.wavelength` is only checked against the
    /// envelope here; bring-up does not tune, so the laser emits at whatever
    /// wavelength the controller holds until [`LaserSession::tune`] is
    /// called.
    #[instrument(skip_all, fields(wavelength = laser.wavelength, current_ma = laser.current_ma))]
    pub async fn run(
        &mut self,
        laser: LaserConfiguration,
        detector: DetectorConfiguration,
    ) -> QclResult<ActiveSession> {
        self.timings.validate().map_err(QclError::Configuration)?;
        self.limits.check(&laser)?;
        detector.validate()?;
        detector.check_reference(laser.pulse_rate_hz)?;

        let mut report = StartupReport::default();
        let mut laser_slot = None;
        let mut detector_slot = None;

        let outcome = AssertUnwindSafe(self.run_stages(
            &laser,
            detector,
            &mut laser_slot,
            &mut detector_slot,
            &mut report,
        ))
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(())) => match (laser_slot, detector_slot) {
                (Some(laser), Some(acquisition)) => {
                    info!(total = ?report.total_elapsed(), "bring-up complete");
                    Ok(ActiveSession {
                        laser,
                        acquisition,
                        report,
                    })
                }
                (laser, acquisition) => {
                    abort(laser, acquisition).await;
                    Err(QclError::Detector(
                        "bring-up finished without an open session".to_string(),
                    ))
                }
            },
            Ok(Err(fault)) => {
                error!(error = %fault, "bring-up failed, shutting down");
                abort(laser_slot, detector_slot).await;
                Err(fault)
            }
            Err(panic) => {
                error!("bring-up panicked, shutting down");
                abort(laser_slot, detector_slot).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn run_stages(
        &self,
        laser: &LaserConfiguration,
        detector: DetectorConfiguration,
        laser_slot: &mut Option<LaserSession>,
        detector_slot: &mut Option<AcquisitionSession>,
        report: &mut StartupReport,
    ) -> QclResult<()> {
        let timings = &self.timings;

        let session = timed(
            report,
            Stage::Connect,
            connect(&self.controller, timings, &self.limits, laser_slot),
        )
        .await?;

        timed(report, Stage::Arm, arm(session, timings.arm)).await?;

        let params = timed(
            report,
            Stage::SetParameters,
            set_parameters(session, laser, timings.parameters),
        )
        .await?;

        timed(report, Stage::CoolTecs, cool_tecs(session, timings)).await?;

        let mut attempts = Vec::new();
        let turned_on = timed(
            report,
            Stage::TurnOnLaser,
            turn_on_laser(session, timings, &mut attempts),
        )
        .await;
        if let Some(result) = report.stages.last_mut() {
            result.diagnostics = attempts.last().and_then(|a| a.diagnostics);
        }
        report.turn_on_attempts = attempts;
        turned_on?;

        let acquisition = timed(
            report,
            Stage::ConnectDetector,
            AcquisitionSession::connect(Arc::clone(&self.detector), detector),
        )
        .await?;
        let acquisition = detector_slot.insert(acquisition);

        // Demodulate at the pulse rate the controller actually settled on.
        timed(
            report,
            Stage::InitializeDetector,
            acquisition.configure(params.pulse_rate_hz),
        )
        .await?;
        Ok(())
    }
}

async fn abort(laser: Option<LaserSession>, acquisition: Option<AcquisitionSession>) {
    if let Some(mut laser) = laser {
        let report = laser.safe_shutdown().await;
        if let Some(e) = report.into_error() {
            warn!(error = %e, "shutdown after fault was incomplete");
        }
    }
    if let Some(mut acquisition) = acquisition {
        acquisition.close().await;
    }
}
