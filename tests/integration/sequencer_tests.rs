//! Full test runs through the service: simulated sensors, controller and
//! sequencer ticking together.

use blowerdoor::adapters::flash::MemFlash;
use blowerdoor::app::commands::AppCommand;
use blowerdoor::app::events::AppEvent;
use blowerdoor::app::service::BlowerService;
use blowerdoor::config::SystemConfig;
use blowerdoor::control::ControlMode;
use blowerdoor::drivers::dimmer::DutyCell;
use blowerdoor::error::Error;
use blowerdoor::fsm::TestState;
use blowerdoor::sequencer::report::{Direction, TestMode};

use crate::mock_hw::{RecordingSink, Rig};

use TestState::{Completed, Idle, Measuring, Preparing, Stabilizing};

fn configured(points: &[f32]) -> Rig {
    let mut rig = Rig::new();
    let cfg = Rig::quick_config(points);
    rig.service
        .handle_command(AppCommand::SetTestConfig(cfg), 0, &mut rig.sink)
        .unwrap();
    rig
}

fn start(rig: &mut Rig, mode: TestMode) {
    let now = rig.now_ms;
    rig.service
        .handle_command(AppCommand::StartTest(mode), now, &mut rig.sink)
        .unwrap();
}

// ── Single direction ─────────────────────────────────────────

#[test]
fn pressurization_walks_every_point_and_completes() {
    let mut rig = configured(&[10.0, 50.0, 30.0]);
    start(&mut rig, TestMode::Pressurization);
    rig.run_tracking(2_000);

    assert_eq!(rig.service.test_state(), Completed);
    assert_eq!(
        rig.sink.transitions(),
        vec![
            (Idle, Preparing),
            (Preparing, Stabilizing),
            (Stabilizing, Measuring),
            (Measuring, Preparing),
            (Preparing, Stabilizing),
            (Stabilizing, Measuring),
            (Measuring, Preparing),
            (Preparing, Stabilizing),
            (Stabilizing, Measuring),
            (Measuring, Completed),
        ]
    );

    let report = rig.service.latest_report().expect("report stored");
    assert_eq!(report.report_id, 1);
    assert!(report.has_pressurization());
    assert!(!report.has_depressurization());

    let dir = report.direction(Direction::Pressurization).unwrap();
    let targets: Vec<f32> = dir.points.iter().map(|p| p.target_pressure_pa).collect();
    assert_eq!(targets, vec![50.0, 30.0, 10.0]);
    for p in &dir.points {
        assert!(p.valid);
        assert!(p.sample_count > 0);
        assert!((p.avg_pressure_pa - p.target_pressure_pa).abs() < 0.1);
        assert!(p.avg_fan_flow_m3h > 0.0);
    }

    // Flow ∝ (3·ΔP)^0.5 gives a clean power law.
    assert!((dir.summary.exponent_n - 0.5).abs() < 0.01);
    assert!(dir.summary.correlation_r > 0.99);
    assert!(report.mean_summary.valid);
    assert!(report.ach_ref() > 0.0);

    let runtime = rig.service.test_runtime();
    assert!(!runtime.active);
    assert!(runtime.report_ready);
    assert_eq!(runtime.latest_report_id, 1);

    assert_eq!(
        rig.sink.count(|e| matches!(e, AppEvent::ReportCompleted { report_id: 1, valid: true, .. })),
        1
    );
    assert_eq!(rig.sink.count(|e| matches!(e, AppEvent::PersistFailed(_))), 0);
}

#[test]
fn controller_follows_sequencer_and_is_released() {
    let mut rig = configured(&[40.0, 20.0]);
    start(&mut rig, TestMode::Depressurization);
    assert_eq!(rig.service.control_snapshot().mode, ControlMode::AutoTest);
    assert!(rig.service.control_snapshot().relay_enabled);

    rig.set_envelope(0.0);
    rig.tick();
    assert_eq!(rig.service.test_state(), Stabilizing);
    assert_eq!(rig.service.control_snapshot().target_pressure_pa, 40.0);
    // Envelope far below target: auto-hold drives the fan.
    rig.tick();
    assert!(rig.duty.get() > 0);

    rig.run_tracking(2_000);
    assert_eq!(rig.service.test_state(), Completed);
    let control = rig.service.control_snapshot();
    assert_eq!(control.mode, ControlMode::Manual);
    assert!(!control.relay_enabled);
    rig.tick();
    assert_eq!(rig.duty.get(), 0);
}

// ── Both directions ──────────────────────────────────────────

#[test]
fn both_directions_produce_mean_summary() {
    let mut rig = configured(&[60.0, 40.0, 20.0]);
    start(&mut rig, TestMode::Both);
    rig.run_tracking(4_000);

    assert_eq!(rig.service.test_state(), Completed);
    let report = rig.service.latest_report().unwrap();
    assert!(report.has_pressurization());
    assert!(report.has_depressurization());

    let p = report.pressurization.as_ref().unwrap().summary;
    let d = report.depressurization.as_ref().unwrap().summary;
    let mean = report.mean_summary;
    assert!(mean.valid);
    let expected = (p.q_ref_m3h + d.q_ref_m3h) / 2.0;
    assert!((mean.q_ref_m3h - expected).abs() < 1e-3 * expected.max(1.0));
}

// ── Stability gate ───────────────────────────────────────────

#[test]
fn unstable_envelope_never_measures() {
    let mut rig = configured(&[50.0, 25.0]);
    start(&mut rig, TestMode::Pressurization);

    // Pressure stays well outside the tolerance band.
    rig.set_envelope(20.0);
    for _ in 0..200 {
        rig.tick();
    }
    assert_eq!(rig.service.test_state(), Stabilizing);
    assert_eq!(rig.service.test_runtime().active_sample_count, 0);
}

#[test]
fn lost_envelope_sensor_restarts_settle_window() {
    let mut rig = configured(&[50.0, 25.0]);
    start(&mut rig, TestMode::Pressurization);
    rig.set_envelope(50.0);
    rig.tick();
    assert_eq!(rig.service.test_state(), Stabilizing);

    // Almost settled (2 s), then the envelope channel drops out.
    for _ in 0..15 {
        rig.tick();
    }
    rig.envelope_bus.fail_next(u32::MAX);
    rig.tick();
    rig.envelope_bus.fail_next(0);

    // A fresh full settle window is needed before measuring starts.
    for _ in 0..10 {
        rig.tick();
    }
    assert_eq!(rig.service.test_state(), Stabilizing);
    rig.run_tracking(2_000);
    assert_eq!(rig.service.test_state(), Completed);
}

// ── Commands around a run ────────────────────────────────────

#[test]
fn stop_mid_run_aborts_without_report() {
    let mut rig = configured(&[50.0, 25.0]);
    start(&mut rig, TestMode::Both);
    rig.set_envelope(50.0);
    for _ in 0..30 {
        rig.tick();
    }
    assert!(rig.service.test_state().is_running());

    let now = rig.now_ms;
    rig.service
        .handle_command(AppCommand::StopTest, now, &mut rig.sink)
        .unwrap();
    assert_eq!(rig.service.test_state(), TestState::Aborted);
    assert!(rig.service.latest_report().is_none());
    assert!(!rig.service.control_snapshot().relay_enabled);

    // Another run can start after an abort.
    start(&mut rig, TestMode::Pressurization);
    assert_eq!(rig.service.test_state(), Preparing);
    assert_eq!(rig.service.report_snapshot().unwrap().report.report_id, 2);
}

#[test]
fn start_and_config_rejected_while_running() {
    let mut rig = configured(&[50.0, 25.0]);
    start(&mut rig, TestMode::Pressurization);

    let again = rig
        .service
        .handle_command(AppCommand::StartTest(TestMode::Both), 0, &mut rig.sink);
    assert_eq!(again, Err(Error::Busy));

    let cfg = Rig::quick_config(&[70.0, 35.0]);
    let set = rig
        .service
        .handle_command(AppCommand::SetTestConfig(cfg), 0, &mut rig.sink);
    assert_eq!(set, Err(Error::Busy));
    assert_eq!(
        rig.service.test_config().pressure_points_pa.as_slice(),
        &[50.0, 25.0]
    );
    let reset = rig
        .service
        .handle_command(AppCommand::ResetTestConfig, 0, &mut rig.sink);
    assert_eq!(reset, Err(Error::Busy));
}

#[test]
fn report_ids_increase_and_history_is_newest_first() {
    let mut rig = configured(&[40.0, 20.0]);
    for _ in 0..3 {
        start(&mut rig, TestMode::Pressurization);
        rig.run_tracking(2_000);
        assert_eq!(rig.service.test_state(), Completed);
    }
    let ids: Vec<u32> = rig
        .service
        .report_history()
        .iter()
        .map(|r| r.report_id)
        .collect();
    assert_eq!(ids, vec![3, 2, 1]);
}

#[test]
fn status_document_tracks_the_run() {
    let mut rig = configured(&[40.0, 20.0]);
    start(&mut rig, TestMode::Pressurization);
    rig.set_envelope(40.0);
    rig.tick();

    let status = rig.service.status();
    assert_eq!(status.test_state, "stabilizing");
    assert!(status.test.active);
    assert_eq!(status.test.total_points, 2);
    assert!(status.metrics.envelope_sample_valid);

    let json = rig.service.status_json().unwrap();
    assert!(json.contains("\"mode\":\"AutoTest\""));
}

#[test]
fn concurrent_start_stop_keeps_controller_in_step() {
    static DUTY: DutyCell = DutyCell::new();
    let svc = BlowerService::new(SystemConfig::default(), MemFlash::default(), &DUTY);
    let mut sink = RecordingSink::new();
    let cfg = Rig::quick_config(&[50.0, 20.0]);
    svc.handle_command(AppCommand::SetTestConfig(cfg), 0, &mut sink)
        .unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut sink = RecordingSink::new();
            for i in 0..300u32 {
                let outcome =
                    svc.handle_command(AppCommand::StartTest(TestMode::Both), i, &mut sink);
                assert!(matches!(outcome, Ok(()) | Err(Error::Busy)), "{outcome:?}");
            }
        });
        s.spawn(|| {
            let mut sink = RecordingSink::new();
            for i in 0..300u32 {
                svc.handle_command(AppCommand::StopTest, i, &mut sink)
                    .unwrap();
            }
        });
        s.spawn(|| {
            let mut sink = RecordingSink::new();
            for i in 0..300u32 {
                svc.test_tick(i * 10, &mut sink);
            }
        });
    });

    let active = svc.test_runtime().active;
    let c = svc.control_snapshot();
    if active {
        assert_eq!(c.mode, ControlMode::AutoTest);
        assert!(c.relay_enabled);
    } else {
        assert_eq!(c.mode, ControlMode::Manual);
        assert!(!c.relay_enabled);
    }

    // A final start after the dust settles must drive the fan.
    svc.handle_command(AppCommand::StopTest, 5_000, &mut sink)
        .unwrap();
    svc.handle_command(AppCommand::StartTest(TestMode::Both), 5_010, &mut sink)
        .unwrap();
    let c = svc.control_snapshot();
    assert_eq!(c.mode, ControlMode::AutoTest);
    assert!(c.relay_enabled);
}
