//! Operator control commands through the service down to the dimmer duty.

use blowerdoor::app::commands::AppCommand;
use blowerdoor::app::events::AppEvent;
use blowerdoor::control::ControlMode;
use blowerdoor::error::Error;

use crate::mock_hw::Rig;

fn cmd(rig: &mut Rig, command: AppCommand) -> Result<(), Error> {
    let now = rig.now_ms;
    rig.service.handle_command(command, now, &mut rig.sink)
}

#[test]
fn manual_duty_needs_the_relay() {
    let mut rig = Rig::new();
    cmd(&mut rig, AppCommand::SetManualPwm(45)).unwrap();
    rig.tick();
    assert_eq!(rig.duty.get(), 0);

    cmd(&mut rig, AppCommand::SetRelayEnabled(true)).unwrap();
    rig.tick();
    assert_eq!(rig.duty.get(), 45);
    assert_eq!(rig.service.control_snapshot().output_pwm_percent, 45);

    cmd(&mut rig, AppCommand::SetRelayEnabled(false)).unwrap();
    rig.tick();
    assert_eq!(rig.duty.get(), 0);
}

#[test]
fn out_of_range_commands_change_nothing() {
    let mut rig = Rig::new();
    let before = rig.service.control_snapshot();
    assert!(matches!(
        cmd(&mut rig, AppCommand::SetManualPwm(150)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        cmd(&mut rig, AppCommand::SetTargetPressure(250.0)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        cmd(&mut rig, AppCommand::SetTargetPressure(-1.0)),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(rig.service.control_snapshot(), before);
    assert!(rig.sink.count(|e| matches!(e, AppEvent::ControlChanged { .. })) == 0);
}

#[test]
fn auto_hold_boosts_then_regulates() {
    let mut rig = Rig::new();
    cmd(&mut rig, AppCommand::SetTargetPressure(25.0)).unwrap();
    cmd(&mut rig, AppCommand::SetAutoHoldEnabled(true)).unwrap();
    cmd(&mut rig, AppCommand::SetRelayEnabled(true)).unwrap();

    let c = rig.service.control_snapshot();
    assert_eq!(c.mode, ControlMode::SemiAutoTarget);
    assert!(c.auto_hold_enabled);
    assert!(c.startup_boost_active);

    rig.set_envelope(0.0);
    rig.tick();
    assert_eq!(rig.duty.get(), 100, "startup boost runs at full power");

    // Once the envelope overshoots the target the boost ends.
    rig.set_envelope(40.0);
    for _ in 0..10 {
        rig.tick();
    }
    let c = rig.service.control_snapshot();
    assert!(!c.startup_boost_active);
    assert!(c.output_pwm_percent < 100);
}

#[test]
fn invalid_measurement_falls_back_to_manual_duty() {
    let mut rig = Rig::new();
    cmd(&mut rig, AppCommand::SetManualPwm(20)).unwrap();
    cmd(&mut rig, AppCommand::SetMode(ControlMode::SemiAutoTarget)).unwrap();
    cmd(&mut rig, AppCommand::SetRelayEnabled(true)).unwrap();

    rig.envelope_bus.fail_next(u32::MAX);
    rig.tick();
    assert!(!rig.service.metrics_snapshot().envelope_sample_valid);
    assert_eq!(rig.duty.get(), 20);
}

#[test]
fn control_changes_are_announced() {
    let mut rig = Rig::new();
    cmd(&mut rig, AppCommand::SetMode(ControlMode::SemiAutoTarget)).unwrap();
    cmd(&mut rig, AppCommand::SetTargetPressure(35.0)).unwrap();
    cmd(&mut rig, AppCommand::SetAutoHoldEnabled(false)).unwrap();

    let changes: Vec<_> = rig
        .sink
        .events
        .iter()
        .filter_map(|e| match e {
            AppEvent::ControlChanged {
                mode,
                target_pressure_pa,
                ..
            } => Some((*mode, *target_pressure_pa)),
            _ => None,
        })
        .collect();
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[1], (ControlMode::SemiAutoTarget, 35.0));
    assert_eq!(changes[2].0, ControlMode::Manual);
}

#[test]
fn line_feedback_reaches_the_snapshot() {
    let mut rig = Rig::new();
    rig.tick();
    let c = rig.service.control_snapshot();
    assert!(c.line_sync);
    assert_eq!(c.line_frequency_hz, 50.0);
}
