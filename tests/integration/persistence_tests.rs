//! Persisted test state across simulated reboots.

use blowerdoor::adapters::flash::MemFlash;
use blowerdoor::app::commands::AppCommand;
use blowerdoor::app::events::AppEvent;
use blowerdoor::config::TestConfig;
use blowerdoor::error::{Error, FlashError};
use blowerdoor::fsm::TestState;
use blowerdoor::persistence::{Persistence, decode_image};
use blowerdoor::sequencer::report::TestMode;

use crate::mock_hw::{Rig, SharedFlash};

fn complete_run(rig: &mut Rig, points: &[f32]) {
    let cfg = Rig::quick_config(points);
    let now = rig.now_ms;
    rig.service
        .handle_command(AppCommand::SetTestConfig(cfg), now, &mut rig.sink)
        .unwrap();
    rig.service
        .handle_command(AppCommand::StartTest(TestMode::Pressurization), now, &mut rig.sink)
        .unwrap();
    rig.run_tracking(2_000);
    assert_eq!(rig.service.test_state(), TestState::Completed);
}

/// Boot a fresh rig from a copy of `rig`'s flash.
fn reboot(rig: &Rig) -> Rig {
    Rig::with_flash(SharedFlash::new(rig.flash.snapshot()))
}

#[test]
fn blank_flash_boots_with_defaults_and_writes_them() {
    let rig = Rig::new();
    assert_eq!(
        rig.sink.events.first(),
        Some(&AppEvent::Started {
            state: TestState::Idle,
            stored_reports: 0,
            storage_enabled: true,
        })
    );
    assert_eq!(rig.service.test_config(), TestConfig::default());

    let stored = decode_image(rig.flash.snapshot().bytes()).unwrap();
    assert_eq!(stored.config, TestConfig::default());
    assert!(stored.history.is_empty());
}

#[test]
fn reports_and_config_survive_reboot() {
    let mut rig = Rig::new();
    complete_run(&mut rig, &[45.0, 30.0, 15.0]);
    let report = rig.service.latest_report().unwrap();

    let mut after = reboot(&rig);
    assert!(matches!(
        after.sink.events.first(),
        Some(AppEvent::Started { stored_reports: 1, .. })
    ));
    assert_eq!(after.service.latest_report(), Some(report));
    assert_eq!(after.service.test_config(), rig.service.test_config());
    let runtime = after.service.test_runtime();
    assert!(runtime.report_ready);
    assert_eq!(runtime.latest_report_id, 1);

    // Numbering continues after the stored report.
    complete_run(&mut after, &[45.0, 30.0, 15.0]);
    let ids: Vec<u32> = after
        .service
        .report_history()
        .iter()
        .map(|r| r.report_id)
        .collect();
    assert_eq!(ids, vec![2, 1]);
}

#[test]
fn aborted_run_still_consumes_its_id() {
    let mut rig = Rig::new();
    let cfg = Rig::quick_config(&[40.0, 20.0]);
    rig.service
        .handle_command(AppCommand::SetTestConfig(cfg), 0, &mut rig.sink)
        .unwrap();
    rig.service
        .handle_command(AppCommand::StartTest(TestMode::Both), 0, &mut rig.sink)
        .unwrap();
    rig.service
        .handle_command(AppCommand::StopTest, 100, &mut rig.sink)
        .unwrap();
    complete_run(&mut rig, &[40.0, 20.0]);
    assert_eq!(rig.service.latest_report().unwrap().report_id, 2);

    let after = reboot(&rig);
    assert_eq!(after.service.latest_report().unwrap().report_id, 2);
}

#[test]
fn corrupted_image_falls_back_to_defaults() {
    let mut rig = Rig::new();
    complete_run(&mut rig, &[45.0, 30.0, 15.0]);

    let mut damaged = rig.flash.snapshot();
    damaged.corrupt(40, 0x5A);
    let after = Rig::with_flash(SharedFlash::new(damaged));

    assert!(matches!(
        after.sink.events.first(),
        Some(AppEvent::Started {
            stored_reports: 0,
            storage_enabled: true,
            ..
        })
    ));
    assert!(after.service.latest_report().is_none());
    assert_eq!(after.service.test_config(), TestConfig::default());

    // The defaults were written back over the damaged image.
    let reread = Persistence::new(after.flash.snapshot()).unwrap().load().unwrap();
    assert_eq!(reread.config, TestConfig::default());
    assert!(reread.history.is_empty());
}

#[test]
fn flash_write_failure_is_reported() {
    let mut rig = Rig::new();
    rig.flash.with(|f| f.fail_erase(true));

    let cfg = Rig::quick_config(&[60.0, 30.0]);
    let result = rig
        .service
        .handle_command(AppCommand::SetTestConfig(cfg), 0, &mut rig.sink);
    assert_eq!(result, Err(Error::FlashIo(FlashError::Erase(-1))));
    assert!(
        rig.sink
            .events
            .contains(&AppEvent::PersistFailed(Error::FlashIo(FlashError::Erase(-1))))
    );
    // The config is live even though it was not stored.
    assert_eq!(
        rig.service.test_config().pressure_points_pa.as_slice(),
        &[60.0, 30.0]
    );
}

#[test]
fn report_write_failure_keeps_report_in_memory() {
    let mut rig = Rig::new();
    let cfg = Rig::quick_config(&[40.0, 20.0]);
    rig.service
        .handle_command(AppCommand::SetTestConfig(cfg), 0, &mut rig.sink)
        .unwrap();
    rig.flash.with(|f| f.drop_programs(true));
    rig.service
        .handle_command(AppCommand::StartTest(TestMode::Pressurization), 0, &mut rig.sink)
        .unwrap();
    rig.run_tracking(2_000);

    assert_eq!(rig.service.test_state(), TestState::Completed);
    assert_eq!(rig.service.report_history().len(), 1);
    assert!(
        rig.sink
            .events
            .contains(&AppEvent::PersistFailed(Error::FlashIo(FlashError::VerifyFailed)))
    );
}

#[test]
fn unusable_region_disables_storage() {
    let mut rig = Rig::with_flash(SharedFlash::new(MemFlash::new(0, 4096, 256)));
    assert!(matches!(
        rig.sink.events.first(),
        Some(AppEvent::Started {
            storage_enabled: false,
            ..
        })
    ));
    complete_run(&mut rig, &[40.0, 20.0]);
    assert_eq!(rig.service.report_history().len(), 1);
    assert_eq!(rig.sink.count(|e| matches!(e, AppEvent::PersistFailed(_))), 0);
}
