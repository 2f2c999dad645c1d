//! Sensor path: simulated ADP910 buses through the hub into the metrics
//! snapshot.

use blowerdoor::app::commands::AppCommand;
use blowerdoor::app::events::AppEvent;

use crate::mock_hw::{FAN_RATIO, Rig};

#[test]
fn first_tick_initialises_both_channels() {
    let mut rig = Rig::new();
    rig.set_envelope(12.5);
    rig.tick();

    assert_eq!(rig.hub.ready(), (true, true));
    assert_eq!(
        rig.envelope_bus.last_write(),
        Some(vec![0x36, 0x1E]),
        "continuous-measurement command"
    );
    let m = rig.service.metrics_snapshot();
    assert!(m.fan_sample_valid && m.envelope_sample_valid);
    assert_eq!(m.envelope_pressure_pa, 12.5);
    assert_eq!(m.fan_pressure_pa, 12.5 * FAN_RATIO);
    assert_eq!(m.envelope_temperature_c, 19.0);
    assert_eq!(m.fan_temperature_c, 21.0);
    assert_eq!(m.update_sequence, 1);
    assert_eq!(m.last_update_tick_ms, rig.now_ms);
    assert!(m.fan_speed_units > 0.0);
}

#[test]
fn failed_init_backs_off_then_recovers() {
    let mut rig = Rig::new();
    rig.fan_bus.fail_next(u32::MAX);
    rig.set_envelope(20.0);
    rig.tick();
    assert_eq!(rig.hub.ready(), (false, true));
    let m = rig.service.metrics_snapshot();
    assert!(!m.fan_sample_valid);
    assert!(m.envelope_sample_valid);

    rig.fan_bus.fail_next(0);
    for _ in 0..5 {
        rig.tick();
    }
    // Still inside the re-initialisation backoff.
    assert_eq!(rig.hub.ready(), (false, true));

    for _ in 0..10 {
        rig.tick();
    }
    assert_eq!(rig.hub.ready(), (true, true));
    assert!(rig.service.metrics_snapshot().fan_sample_valid);
    assert!(rig.fan_bus.recoveries() >= 2);
}

#[test]
fn corrupt_frame_drops_one_sample_only() {
    let mut rig = Rig::new();
    rig.set_envelope(30.0);
    rig.tick();

    rig.envelope_bus.corrupt_next_frame();
    rig.tick();
    let m = rig.service.metrics_snapshot();
    assert!(!m.envelope_sample_valid);
    // Stale value retained.
    assert_eq!(m.envelope_pressure_pa, 30.0);
    assert_eq!(rig.hub.ready(), (true, true));

    rig.set_envelope(31.0);
    rig.tick();
    let m = rig.service.metrics_snapshot();
    assert!(m.envelope_sample_valid);
    assert_eq!(m.envelope_pressure_pa, 31.0);
}

#[test]
fn zero_offsets_anchor_current_readings() {
    let mut rig = Rig::new();

    // Nothing to anchor before the first sample.
    rig.service
        .handle_command(AppCommand::CaptureZeroOffsets, 0, &mut rig.sink)
        .unwrap();
    assert!(
        rig.sink
            .events
            .contains(&AppEvent::ZeroOffsetsCaptured { captured: false })
    );

    rig.set_envelope(1.5);
    rig.tick();
    let now = rig.now_ms;
    rig.service
        .handle_command(AppCommand::CaptureZeroOffsets, now, &mut rig.sink)
        .unwrap();
    assert!(
        rig.sink
            .events
            .contains(&AppEvent::ZeroOffsetsCaptured { captured: true })
    );
    assert_eq!(rig.service.metrics_snapshot().envelope_pressure_pa, 0.0);

    rig.set_envelope(11.5);
    rig.tick();
    let m = rig.service.metrics_snapshot();
    assert_eq!(m.envelope_pressure_pa, 10.0);
    assert_eq!(m.fan_pressure_pa, 11.5 * FAN_RATIO - 1.5 * FAN_RATIO);
}
