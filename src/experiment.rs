//! Timed experiments on an active session.
//!
//! An [`Experiment`] runs for a whole number of seconds. Once per second every
//! [`Action`] is asked for the value its laser field should have at that
//! point; changed values are applied through [`LaserSession::tune`] and
//! [`ActiveSession::update_parameters`], which also moves the lock-in
//! reference onto a new pulse rate, then one acquisition cycle is
//! collected. The laser is always shut down at the end, and also when any
//! step faults.
//!
//! ```rust,ignore
//! let experiment = Experiment::builder()
//!     .action(Schedule::new(LaserField::Wavelength).at(3, 1100.0))
//!     .duration(Duration::from_secs(5))
//!     .build()?;
//! let buffer = experiment.run(&mut active).await?;
//! ```
//!
//! [`LaserSession::tune`]: crate::procedures::LaserSession::tune

use crate::acquisition::AcquisitionBuffer;
use crate::procedures::operations::ParameterUpdate;
use crate::procedures::ActiveSession;
use qcl_core::data::WavelengthUnit;
use qcl_core::error::{QclError, QclResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Time between experiment ticks.
pub const TICK: Duration = Duration::from_secs(1);

/// Longest experiment accepted (exclusive).
pub const MAX_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

/// Laser field an action drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaserField {
    /// Tuned wavelength, in the experiment's unit.
    Wavelength,
    /// Pulse width in ns.
    PulseWidth,
    /// Pulse rate in Hz.
    PulseRate,
    /// Drive current in mA.
    Current,
}

/// Something that sets one laser field over the course of an experiment.
pub trait Action: Send + Sync {
    /// Field this action drives.
    fn field(&self) -> LaserField;

    /// Value for the field at `elapsed` whole seconds, or `None` to leave it.
    fn value_at(&self, elapsed: u64) -> Option<f64>;
}

/// Table-driven action: the field takes a value at each listed second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Field driven by this schedule.
    pub field: LaserField,
    /// Value to apply at each second.
    #[serde(default)]
    pub steps: BTreeMap<u64, f64>,
}

impl Schedule {
    /// Empty schedule for `field`.
    pub fn new(field: LaserField) -> Self {
        Self {
            field,
            steps: BTreeMap::new(),
        }
    }

    /// Set `value` at `second`.
    pub fn at(mut self, second: u64, value: f64) -> Self {
        self.steps.insert(second, value);
        self
    }
}

impl Action for Schedule {
    fn field(&self) -> LaserField {
        self.field
    }

    fn value_at(&self, elapsed: u64) -> Option<f64> {
        self.steps.get(&elapsed).copied()
    }
}

/// Builder for [`Experiment`].
#[derive(Default)]
pub struct ExperimentBuilder {
    actions: Vec<Box<dyn Action>>,
    duration: Option<Duration>,
    unit: Option<WavelengthUnit>,
}

impl ExperimentBuilder {
    /// Add an action.
    pub fn action(mut self, action: impl Action + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    /// Add several boxed actions.
    pub fn actions(mut self, actions: impl IntoIterator<Item = Box<dyn Action>>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Total run time; whole seconds are used.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Unit of wavelength action values (default: wavenumber).
    pub fn unit(mut self, unit: WavelengthUnit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Validate and build.
    ///
    /// Needs at least one action and a duration of at least one second and
    /// under two hours.
    pub fn build(self) -> QclResult<Experiment> {
        if self.actions.is_empty() {
            return Err(QclError::Configuration(
                "experiment needs at least one action".to_string(),
            ));
        }
        let duration = self.duration.ok_or_else(|| {
            QclError::Configuration("experiment duration not set".to_string())
        })?;
        if duration.as_secs() == 0 || duration >= MAX_DURATION {
            return Err(QclError::Configuration(format!(
                "experiment duration {duration:?} must be between 1 s and 2 h"
            )));
        }
        Ok(Experiment {
            actions: self.actions,
            ticks: duration.as_secs(),
            unit: self.unit.unwrap_or(WavelengthUnit::Wavenumber),
        })
    }
}

/// A validated, timed experiment.
pub struct Experiment {
    actions: Vec<Box<dyn Action>>,
    ticks: u64,
    unit: WavelengthUnit,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("actions", &self.actions.len())
            .field("ticks", &self.ticks)
            .field("unit", &self.unit)
            .finish()
    }
}

impl Experiment {
    /// Start building an experiment.
    pub fn builder() -> ExperimentBuilder {
        ExperimentBuilder::default()
    }

    /// Number of one-second ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run the experiment, then shut the session down.
    ///
    /// Returns the buffer with one cycle per tick. A fault shuts down the
    /// session before it is returned.
    #[instrument(skip_all, fields(ticks = self.ticks, actions = self.actions.len()))]
    pub async fn run(&self, active: &mut ActiveSession) -> QclResult<AcquisitionBuffer> {
        let mut buffer = AcquisitionBuffer::new();
        let result = self.run_ticks(active, &mut buffer).await;

        if let Err(e) = &result {
            error!(error = %e, cycles = buffer.len(), "experiment failed, shutting down");
        }
        let report = active.shutdown().await;
        if let Some(e) = report.into_error() {
            warn!(error = %e, "shutdown after experiment was incomplete");
        }

        result.map(|()| buffer)
    }

    async fn run_ticks(
        &self,
        active: &mut ActiveSession,
        buffer: &mut AcquisitionBuffer,
    ) -> QclResult<()> {
        let mut applied: Vec<Option<f64>> = vec![None; self.actions.len()];

        for elapsed in 1..=self.ticks {
            tokio::time::sleep(TICK).await;

            let mut update = ParameterUpdate::default();
            let mut wavelength = None;
            for (action, last) in self.actions.iter().zip(applied.iter_mut()) {
                let Some(value) = action.value_at(elapsed) else {
                    continue;
                };
                if *last == Some(value) {
                    continue;
                }
                *last = Some(value);
                match action.field() {
                    LaserField::Wavelength => wavelength = Some(value),
                    LaserField::PulseWidth => update = update.pulse_width(value),
                    LaserField::PulseRate => update = update.pulse_rate(value),
                    LaserField::Current => update = update.current(value),
                }
            }

            if let Some(value) = wavelength {
                info!(elapsed, value, "tuning");
                active.laser.tune(self.unit, value).await?;
            }
            if !update.is_empty() {
                info!(elapsed, ?update, "updating laser parameters");
                active.update_parameters(update).await?;
            }

            let summary = active.acquisition.collect(buffer).await?;
            info!(elapsed, samples = summary.samples, "tick complete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedures::StartupSequencer;
    use qcl_core::data::{DetectorConfiguration, LaserConfiguration};
    use qcl_driver_mock::{ControllerCall, MockController, MockLockin};
    use std::sync::Arc;

    async fn active() -> (Arc<MockController>, ActiveSession) {
        let ctrl = Arc::new(MockController::new());
        let lockin = Arc::new(MockLockin::new());
        let active = StartupSequencer::new(ctrl.clone(), lockin)
            .run(LaserConfiguration::default(), DetectorConfiguration::default())
            .await
            .unwrap();
        (ctrl, active)
    }

    #[test]
    fn test_builder_requires_action() {
        let err = Experiment::builder()
            .duration(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(matches!(err, QclError::Configuration(_)));
    }

    #[test]
    fn test_builder_duration_bounds() {
        let schedule = || Schedule::new(LaserField::Current).at(1, 1400.0);
        assert!(Experiment::builder().action(schedule()).build().is_err());
        assert!(Experiment::builder()
            .action(schedule())
            .duration(Duration::ZERO)
            .build()
            .is_err());
        assert!(Experiment::builder()
            .action(schedule())
            .duration(MAX_DURATION)
            .build()
            .is_err());
        let exp = Experiment::builder()
            .action(schedule())
            .duration(MAX_DURATION - Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(exp.ticks(), 7199);
    }

    #[test]
    fn test_schedule_values() {
        let s = Schedule::new(LaserField::PulseRate).at(2, 50_000.0);
        assert_eq!(s.value_at(1), None);
        assert_eq!(s.value_at(2), Some(50_000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_applies_actions_and_collects_each_tick() {
        let (ctrl, mut active) = active().await;
        let exp = Experiment::builder()
            .action(Schedule::new(LaserField::Wavelength).at(2, 1100.0))
            .action(Schedule::new(LaserField::Current).at(3, 1400.0))
            .duration(Duration::from_secs(4))
            .build()
            .unwrap();

        let buffer = exp.run(&mut active).await.unwrap();

        assert_eq!(buffer.len(), 4);
        assert_eq!(ctrl.tune_target(), Some((WavelengthUnit::Wavenumber, 1100.0)));
        let writes: Vec<_> = ctrl
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ControllerCall::WriteQclParams(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(writes.last().map(|p| p.current_ma), Some(1400.0));
        assert!(!ctrl.is_connected());
        assert_eq!(ctrl.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsafe_action_shuts_down() {
        let (ctrl, mut active) = active().await;
        let exp = Experiment::builder()
            .action(Schedule::new(LaserField::Current).at(2, 5000.0))
            .duration(Duration::from_secs(3))
            .build()
            .unwrap();

        let err = exp.run(&mut active).await.unwrap_err();
        assert!(matches!(err, QclError::Configuration(_)));
        assert!(!ctrl.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_rate_change_retunes_lockin() {
        let ctrl = Arc::new(MockController::new());
        let lockin = Arc::new(MockLockin::new());
        let mut active = StartupSequencer::new(ctrl.clone(), lockin.clone())
            .run(LaserConfiguration::default(), DetectorConfiguration::default())
            .await
            .unwrap();
        assert_eq!(active.acquisition.modulation_frequency(), Some(100_000.0));

        let exp = Experiment::builder()
            .action(Schedule::new(LaserField::PulseRate).at(2, 50_000.0))
            .duration(Duration::from_secs(3))
            .build()
            .unwrap();
        exp.run(&mut active).await.unwrap();

        assert_eq!(
            lockin.value_of("/dev4242/oscs/0/freq"),
            Some(qcl_core::data::NodeValue::Double(50_000.0))
        );
        assert_eq!(active.acquisition.modulation_frequency(), Some(50_000.0));
    }
}
