//! Pressure control: the adaptive controller and its shared service.
//!
//! ```text
//!  sensor task ─▶ MetricsSnapshot ─▶ select_pressure ─┐
//!                                                    ▼
//!  HTTP / test ─▶ ControlService (critical-section mutex) ─▶ DutyCell ─▶ ISR
//! ```

pub mod pressure;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::warn;

use crate::app::ports::ControlLink;
use crate::config::{ControlTuning, PressureSource};
use crate::drivers::dimmer::{DutyCell, LineStatus};
use crate::error::Result;
use crate::fsm::context::ControlRequest;
use crate::sensors::MetricsSnapshot;
pub use pressure::{ControlMode, ControlSnapshot, PressureController};

/// Pick the controller input from `metrics`.  `None` when the selected
/// channel(s) carry no valid sample.
pub fn select_pressure(source: PressureSource, metrics: &MetricsSnapshot) -> Option<f32> {
    let fan = metrics.fan_sample_valid.then_some(metrics.fan_pressure_pa);
    let envelope = metrics
        .envelope_sample_valid
        .then_some(metrics.envelope_pressure_pa);

    match source {
        PressureSource::Envelope => envelope,
        PressureSource::Fan => fan,
        PressureSource::AutoMinAbs => match (fan, envelope) {
            (Some(f), Some(e)) => Some(if f.abs() <= e.abs() { f } else { e }),
            (f, e) => e.or(f),
        },
    }
}

/// Process-wide controller.  Every access holds a critical section for the
/// duration of one call; nothing inside does I/O.
pub struct ControlService {
    inner: Mutex<CriticalSectionRawMutex, RefCell<PressureController>>,
    duty: &'static DutyCell,
}

impl ControlService {
    pub fn new(tuning: ControlTuning, duty: &'static DutyCell) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(PressureController::new(tuning))),
            duty,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut PressureController) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn set_manual_pwm(&self, percent: u8) {
        self.with(|c| c.set_manual_pwm(percent));
    }

    pub fn set_mode(&self, mode: ControlMode) {
        self.with(|c| c.set_mode(mode));
    }

    pub fn set_auto_hold(&self, enabled: bool) {
        self.with(|c| c.set_auto_hold(enabled));
    }

    pub fn set_relay(&self, enabled: bool) {
        self.with(|c| c.set_relay(enabled));
    }

    pub fn set_target_pressure(&self, target_pa: f32) -> Result<()> {
        self.with(|c| c.set_target_pressure(target_pa))
    }

    pub fn update_line_feedback(&self, line: LineStatus) {
        self.with(|c| c.update_line_feedback(line.sync, line.frequency_hz));
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        self.with(|c| c.snapshot())
    }

    /// Run one control cycle on `pressure_pa` (`None` = measurement invalid)
    /// and publish the result to the dimmer.
    pub fn step(&self, pressure_pa: Option<f32>, now_ms: u32) -> u8 {
        let out = self.with(|c| c.step(pressure_pa.unwrap_or(0.0), pressure_pa.is_some(), now_ms));
        self.duty.set(out);
        out
    }

    /// Hand control back to the operator: manual mode, relay off, 0 %.
    pub fn release(&self) {
        self.with(|c| {
            c.set_mode(ControlMode::Manual);
            c.set_relay(false);
            c.set_manual_pwm(0);
        });
        self.duty.set(0);
    }

    /// Put the controller into automatic test mode with the relay on.
    pub fn engage_auto_test(&self) {
        self.with(|c| {
            c.set_mode(ControlMode::AutoTest);
            c.set_relay(true);
        });
    }

    pub fn duty(&self) -> u8 {
        self.duty.get()
    }
}

impl ControlLink for ControlService {
    fn apply(&self, request: ControlRequest) {
        match request {
            ControlRequest::EngageAutoTest => self.engage_auto_test(),
            ControlRequest::Target(target_pa) => {
                if let Err(e) = self.set_target_pressure(target_pa) {
                    warn!("CTRL | sequencer target {:.1}Pa rejected: {}", target_pa, e);
                }
            }
            ControlRequest::Release => self.release(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(fan: Option<f32>, env: Option<f32>) -> MetricsSnapshot {
        MetricsSnapshot {
            fan_pressure_pa: fan.unwrap_or(99.0),
            fan_sample_valid: fan.is_some(),
            envelope_pressure_pa: env.unwrap_or(99.0),
            envelope_sample_valid: env.is_some(),
            ..MetricsSnapshot::default()
        }
    }

    #[test]
    fn pressure_source_selection() {
        let both = metrics(Some(-80.0), Some(30.0));
        assert_eq!(select_pressure(PressureSource::Envelope, &both), Some(30.0));
        assert_eq!(select_pressure(PressureSource::Fan, &both), Some(-80.0));
        assert_eq!(select_pressure(PressureSource::AutoMinAbs, &both), Some(30.0));

        let fan_only = metrics(Some(12.0), None);
        assert_eq!(select_pressure(PressureSource::Envelope, &fan_only), None);
        assert_eq!(select_pressure(PressureSource::AutoMinAbs, &fan_only), Some(12.0));

        let env_only = metrics(None, Some(-7.0));
        assert_eq!(select_pressure(PressureSource::Fan, &env_only), None);
        assert_eq!(select_pressure(PressureSource::AutoMinAbs, &env_only), Some(-7.0));

        assert_eq!(select_pressure(PressureSource::AutoMinAbs, &metrics(None, None)), None);
    }

    #[test]
    fn step_publishes_duty() {
        static DUTY: DutyCell = DutyCell::new();
        let svc = ControlService::new(ControlTuning::default(), &DUTY);
        svc.set_relay(true);
        svc.set_manual_pwm(33);
        assert_eq!(svc.step(Some(10.0), 0), 33);
        assert_eq!(svc.duty(), 33);

        svc.release();
        assert_eq!(svc.duty(), 0);
        let s = svc.snapshot();
        assert_eq!(s.mode, ControlMode::Manual);
        assert!(!s.relay_enabled);
        assert_eq!(s.manual_pwm_percent, 0);
    }

    #[test]
    fn engage_auto_test_boosts() {
        static DUTY: DutyCell = DutyCell::new();
        let svc = ControlService::new(ControlTuning::default(), &DUTY);
        svc.engage_auto_test();
        let s = svc.snapshot();
        assert_eq!(s.mode, ControlMode::AutoTest);
        assert!(s.relay_enabled && s.startup_boost_active);
        assert_eq!(svc.step(Some(1.0), 0), 100);
        // Invalid measurement: manual passthrough (0 %).
        assert_eq!(svc.step(None, 100), 0);
    }

    #[test]
    fn rejected_target_leaves_state() {
        static DUTY: DutyCell = DutyCell::new();
        let svc = ControlService::new(ControlTuning::default(), &DUTY);
        assert!(svc.set_target_pressure(500.0).is_err());
        assert_eq!(svc.snapshot().target_pressure_pa, 50.0);
    }

    #[test]
    fn sequencer_requests_map_to_controller() {
        static DUTY: DutyCell = DutyCell::new();
        let svc = ControlService::new(ControlTuning::default(), &DUTY);
        svc.apply(ControlRequest::EngageAutoTest);
        svc.apply(ControlRequest::Target(42.0));
        let s = svc.snapshot();
        assert_eq!(s.mode, ControlMode::AutoTest);
        assert!(s.relay_enabled);
        assert_eq!(s.target_pressure_pa, 42.0);

        svc.apply(ControlRequest::Target(f32::NAN));
        assert_eq!(svc.snapshot().target_pressure_pa, 42.0);

        svc.apply(ControlRequest::Release);
        let s = svc.snapshot();
        assert_eq!(s.mode, ControlMode::Manual);
        assert!(!s.relay_enabled);
    }
}
