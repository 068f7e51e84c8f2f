//! Integration tests for the startup sequencer against simulated devices.
//!
//! All tests run in paused Tokio time, so stage timeouts elapse instantly
//! and elapsed durations are exact.

use futures::FutureExt;
use qcl_core::data::{DetectorConfiguration, LaserConfiguration, NodeValue, QclParameterSet};
use qcl_daq::procedures::{Stage, StageTimings, StartupSequencer};
use qcl_daq::QclError;
use qcl_driver_mock::{
    ControllerCall, LockinCall, MockController, MockControllerConfig, MockLockin,
    MockLockinConfig,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_test::traced_test;

fn controller(config: MockControllerConfig) -> Arc<MockController> {
    Arc::new(MockController::with_config(config))
}

fn sequencer(ctrl: &Arc<MockController>, lockin: &Arc<MockLockin>) -> StartupSequencer {
    StartupSequencer::new(ctrl.clone(), lockin.clone())
}

fn emission_off_count(ctrl: &MockController) -> usize {
    ctrl.call_count(|c| matches!(c, ControllerCall::SetEmission(false)))
}

#[tokio::test(start_paused = true)]
async fn test_full_bring_up_records_every_stage() {
    let ctrl = controller(MockControllerConfig::default());
    let lockin = Arc::new(MockLockin::new());

    let mut active = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap();

    let stages: Vec<Stage> = active.report.stages.iter().map(|r| r.stage).collect();
    assert_eq!(stages, Stage::ORDER.to_vec());
    assert!(active.report.stages.iter().all(|r| r.success));
    assert!(active
        .report
        .stage(Stage::TurnOnLaser)
        .and_then(|r| r.diagnostics)
        .is_some());
    assert!(active.laser.laser_on());
    assert_eq!(active.acquisition.device(), "dev4242");

    let report = active.shutdown().await;
    assert!(report.executed && report.is_clean());
    assert_eq!(ctrl.disconnect_count(), 1);
    assert!(lockin.calls().contains(&LockinCall::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn test_connects_to_last_enumerated_controller() {
    let ctrl = controller(MockControllerConfig {
        device_count: 3,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let mut active = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap();
    assert_eq!(ctrl.call_count(|c| *c == ControllerCall::Connect(2)), 1);
    active.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_controller_is_link_fault() {
    let ctrl = controller(MockControllerConfig {
        device_count: 0,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Link(_)), "{err}");
    assert_eq!(ctrl.call_count(|c| matches!(c, ControllerCall::Connect(_))), 0);
    assert_eq!(ctrl.disconnect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_arm_confirms_after_k_polls() {
    let ctrl = controller(MockControllerConfig {
        arm_after_polls: Some(3),
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let mut active = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap();

    assert_eq!(ctrl.call_count(|c| *c == ControllerCall::IsArmed), 3);
    let arm = active.report.stage(Stage::Arm).unwrap();
    assert_eq!(arm.elapsed, Duration::from_secs(2));
    active.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_arm_timeout_is_laser_fault_and_shuts_down_once() {
    let ctrl = controller(MockControllerConfig {
        arm_after_polls: None,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let start = Instant::now();
    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Laser(_)), "{err}");
    assert!(start.elapsed() >= Duration::from_secs(20));
    assert_eq!(emission_off_count(&ctrl), 1);
    assert_eq!(ctrl.disconnect_count(), 1);
    assert!(!ctrl.is_connected());
    // The lock-in was never touched.
    assert!(lockin.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_parameters_converge_jointly() {
    let ctrl = controller(MockControllerConfig {
        params_converge_after_reads: Some(2),
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let mut active = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap();

    let params: &QclParameterSet = active.laser.converged_parameters().unwrap();
    assert_eq!(params.pulse_rate_hz, 100_000.0);
    assert_eq!(params.pulse_width_ns, 500.0);
    assert_eq!(params.current_ma, 1500.0);
    assert_eq!(params.temperature_c, 17.0);
    // Controller-owned fields are written back unchanged.
    assert_eq!(params.slot_id, 1);
    assert_eq!(params.source_voltage, 12.0);

    // One read for the current set, then two convergence reads.
    assert_eq!(ctrl.call_count(|c| *c == ControllerCall::ReadQclParams), 3);
    assert_eq!(
        active.report.stage(Stage::SetParameters).unwrap().elapsed,
        Duration::from_secs(1)
    );
    active.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_parameter_timeout_is_controller_fault() {
    let ctrl = controller(MockControllerConfig {
        params_converge_after_reads: None,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let start = Instant::now();
    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Controller(_)), "{err}");
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(emission_off_count(&ctrl), 1);
    assert_eq!(ctrl.disconnect_count(), 1);
    assert_eq!(ctrl.call_count(|c| *c == ControllerCall::IsTempStable), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cool_waits_for_settle() {
    let ctrl = controller(MockControllerConfig {
        temp_stable_after_polls: Some(4),
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let mut active = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap();

    // Three poll intervals plus the settle hold.
    let cool = active.report.stage(Stage::CoolTecs).unwrap();
    assert_eq!(cool.elapsed, Duration::from_secs(13));
    active.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_emission_confirmed_on_second_attempt() {
    let ctrl = controller(MockControllerConfig {
        emission_on_attempt: Some(2),
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let mut active = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap();

    assert_eq!(active.report.attempt_count(), 2);
    assert!(!active.report.turn_on_attempts[0].confirmed);
    assert!(active.report.turn_on_attempts[1].confirmed);
    assert_eq!(ctrl.emission_attempts(), 2);
    // First attempt ran to its 30 s timeout.
    assert!(active.report.stage(Stage::TurnOnLaser).unwrap().elapsed >= Duration::from_secs(30));
    active.shutdown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_emission_exhaustion_is_laser_fault() {
    let ctrl = controller(MockControllerConfig {
        emission_on_attempt: None,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let start = Instant::now();
    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Laser(_)), "{err}");
    assert_eq!(ctrl.emission_attempts(), 3);
    assert!(start.elapsed() >= Duration::from_secs(90));
    assert_eq!(ctrl.call_count(|c| *c == ControllerCall::ReadDiagnosticWords), 3);
    assert_eq!(emission_off_count(&ctrl), 1);
    assert_eq!(ctrl.disconnect_count(), 1);
    assert!(logs_contain("emission not confirmed"));
}

#[tokio::test(start_paused = true)]
async fn test_open_interlock_never_arms() {
    let ctrl = controller(MockControllerConfig {
        interlock_closed: false,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Link(_)), "{err}");
    assert_eq!(ctrl.call_count(|c| *c == ControllerCall::SetArmed(true)), 0);
    assert_eq!(ctrl.call_count(|c| matches!(c, ControllerCall::Disconnect(_))), 1);
    assert_eq!(ctrl.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_qcl_module_is_link_fault() {
    let ctrl = controller(MockControllerConfig {
        qcl_present: false,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QclError::Link(_)), "{err}");
    assert!(!ctrl.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_detector_fault_shuts_laser_down() {
    let ctrl = controller(MockControllerConfig::default());
    let lockin = Arc::new(MockLockin::with_config(MockLockinConfig {
        refuse_connection: true,
        ..Default::default()
    }));

    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Detector(_)), "{err}");
    assert_eq!(emission_off_count(&ctrl), 1);
    assert_eq!(ctrl.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_lockin_family_closes_both_sessions() {
    let ctrl = controller(MockControllerConfig::default());
    let lockin = Arc::new(MockLockin::with_config(MockLockinConfig {
        devtype: "XYZ".into(),
        ..Default::default()
    }));

    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Detector(_)), "{err}");
    assert_eq!(ctrl.disconnect_count(), 1);
    assert_eq!(lockin.calls().last(), Some(&LockinCall::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn test_unsafe_configuration_sends_nothing() {
    let ctrl = controller(MockControllerConfig::default());
    let lockin = Arc::new(MockLockin::new());
    let laser = LaserConfiguration {
        current_ma: 2000.0,
        ..Default::default()
    };

    let err = sequencer(&ctrl, &lockin)
        .run(laser, DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Configuration(_)), "{err}");
    assert!(ctrl.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_custom_timings_apply() {
    let ctrl = controller(MockControllerConfig {
        arm_after_polls: None,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());
    let mut timings = StageTimings::default();
    timings.arm.interval = Duration::from_millis(100);
    timings.arm.timeout = Duration::from_secs(2);

    let start = Instant::now();
    let err = sequencer(&ctrl, &lockin)
        .with_timings(timings)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Laser(_)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
    assert_eq!(ctrl.call_count(|c| *c == ControllerCall::IsArmed), 21);
}

#[tokio::test(start_paused = true)]
async fn test_cool_timeout_keeps_stage_fault_when_shutdown_fails() {
    let ctrl = controller(MockControllerConfig {
        temp_stable_after_polls: None,
        fail_shutdown_commands: true,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());

    let start = Instant::now();
    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), DetectorConfiguration::default())
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Laser(_)), "{err}");
    assert!(err.to_string().contains("TECs did not stabilize"), "{err}");
    assert!(start.elapsed() >= Duration::from_secs(60));
    assert_eq!(emission_off_count(&ctrl), 1);
    assert_eq!(ctrl.call_count(|c| matches!(c, ControllerCall::Disconnect(_))), 1);
    assert_eq!(ctrl.emission_attempts(), 0);
    assert!(lockin.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_panic_in_stage_shuts_down_then_resumes() {
    let ctrl = controller(MockControllerConfig {
        panic_on_temp_read: true,
        ..Default::default()
    });
    let lockin = Arc::new(MockLockin::new());
    let mut seq = sequencer(&ctrl, &lockin);

    let outcome = AssertUnwindSafe(
        seq.run(LaserConfiguration::default(), DetectorConfiguration::default()),
    )
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(emission_off_count(&ctrl), 1);
    assert_eq!(ctrl.disconnect_count(), 1);
    assert!(!ctrl.is_connected());
    assert!(lockin.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lockin_oscillator_follows_laser_pulse_rate() {
    let ctrl = controller(MockControllerConfig::default());
    let lockin = Arc::new(MockLockin::new());
    let laser = LaserConfiguration {
        pulse_rate_hz: 50_000.0,
        ..Default::default()
    };

    let mut active = sequencer(&ctrl, &lockin)
        .run(laser, DetectorConfiguration::default())
        .await
        .unwrap();

    assert_eq!(
        lockin.value_of("/dev4242/oscs/0/freq"),
        Some(NodeValue::Double(50_000.0))
    );
    assert_eq!(active.acquisition.modulation_frequency(), Some(50_000.0));
    active.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_detector_settings_send_nothing() {
    let ctrl = controller(MockControllerConfig::default());
    let lockin = Arc::new(MockLockin::new());
    let detector = DetectorConfiguration {
        demod_rate: 0.0,
        ..Default::default()
    };

    let err = sequencer(&ctrl, &lockin)
        .run(LaserConfiguration::default(), detector)
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Configuration(_)), "{err}");
    assert!(ctrl.calls().is_empty());
    assert!(lockin.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pinned_oscillator_mismatch_sends_nothing() {
    let ctrl = controller(MockControllerConfig::default());
    let lockin = Arc::new(MockLockin::new());
    let laser = LaserConfiguration {
        pulse_rate_hz: 50_000.0,
        ..Default::default()
    };
    let detector = DetectorConfiguration {
        osc_frequency_hz: Some(100_000.0),
        ..Default::default()
    };

    let err = sequencer(&ctrl, &lockin)
        .run(laser, detector)
        .await
        .unwrap_err();

    assert!(matches!(err, QclError::Configuration(_)), "{err}");
    assert!(ctrl.calls().is_empty());
    assert!(lockin.calls().is_empty());
}
