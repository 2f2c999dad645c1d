//! Application service, the hexagonal core.
//!
//! [`BlowerService`] owns the three process-wide services (metrics,
//! controller, test sequencer) and is shared by reference between the
//! sensor task, the control task, the test loop and the HTTP boundary.
//! Each service guards itself; nothing here holds a lock across I/O.
//!
//! ```text
//!  SensorHub ──▶ ┌───────────────────────────────┐ ──▶ EventSink
//!                │         BlowerService         │
//!  LineStatus ──▶│ Metrics · Control · TestSeq   │──▶ DutyCell
//!                └───────────────────────────────┘
//!                           │
//!                     FlashRegion
//! ```

use embedded_hal::delay::DelayNs;
use log::info;
use serde::Serialize;

use crate::config::{SystemConfig, TestConfig};
use crate::control::{ControlService, ControlSnapshot, select_pressure};
use crate::drivers::dimmer::{DutyCell, LineStatus};
use crate::error::{Error, Result};
use crate::fsm::TestState;
use crate::sensors::models::{LinearModel, MetricsModel};
use crate::sensors::{MetricsService, MetricsSnapshot, SensorHub};
use crate::sequencer::report::{TestReport, TestRuntime};
use crate::sequencer::{ReportSnapshot, TestEffects, TestService};

use super::commands::AppCommand;
use super::events::AppEvent;
use super::ports::{EventSink, FlashRegion, SensorBus};

/// Everything the status endpoint renders.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDocument {
    pub metrics: MetricsSnapshot,
    pub control: ControlSnapshot,
    pub test: TestRuntime,
    pub test_state: &'static str,
    pub latest_report: Option<TestReport>,
}

// ───────────────────────────────────────────────────────────────
// BlowerService
// ───────────────────────────────────────────────────────────────

pub struct BlowerService<F, M = LinearModel> {
    config: SystemConfig,
    metrics: MetricsService<M>,
    control: ControlService,
    tests: TestService<F>,
}

impl<F: FlashRegion> BlowerService<F, LinearModel> {
    /// Build the service with the linear metrics model from `config`.
    pub fn new(config: SystemConfig, flash: F, duty: &'static DutyCell) -> Self {
        let model = LinearModel::new(config.models);
        Self::with_model(config, model, flash, duty)
    }
}

impl<F: FlashRegion, M: MetricsModel> BlowerService<F, M> {
    pub fn with_model(config: SystemConfig, model: M, flash: F, duty: &'static DutyCell) -> Self {
        Self {
            metrics: MetricsService::new(model),
            control: ControlService::new(config.control, duty),
            tests: TestService::new(flash),
            config,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn start(&self, sink: &mut impl EventSink) {
        let event = AppEvent::Started {
            state: self.tests.state(),
            stored_reports: self.tests.history().len(),
            storage_enabled: self.tests.storage_enabled(),
        };
        sink.emit(&event);
        info!("BlowerService started");
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    // ── Periodic work ─────────────────────────────────────────

    /// Poll both sensors and publish a new metrics snapshot.  The bus I/O
    /// runs before the metrics lock is taken.
    pub fn sensor_tick<B: SensorBus, D: DelayNs>(
        &self,
        hub: &mut SensorHub<B, D>,
        now_ms: u32,
    ) -> MetricsSnapshot {
        let (fan, envelope) = hub.poll(now_ms);
        self.metrics.update(fan, envelope, now_ms);
        self.metrics.snapshot()
    }

    /// One controller step on the configured pressure source.  Returns the
    /// duty written to the dimmer.
    pub fn control_tick(&self, line: LineStatus, now_ms: u32) -> u8 {
        self.control.update_line_feedback(line);
        let metrics = self.metrics.snapshot();
        let pressure = select_pressure(self.config.pressure_source, &metrics);
        self.control.step(pressure, now_ms)
    }

    /// One test sequencer step.
    pub fn test_tick(&self, now_ms: u32, sink: &mut impl EventSink) {
        let metrics = self.metrics.snapshot();
        let control = self.control.snapshot();
        let effects = self.tests.update(&metrics, &control, now_ms, &self.control);
        self.publish(effects, sink);
    }

    // ── Command handling ──────────────────────────────────────

    pub fn handle_command(
        &self,
        cmd: AppCommand,
        now_ms: u32,
        sink: &mut impl EventSink,
    ) -> Result<()> {
        match cmd {
            AppCommand::SetManualPwm(percent) => {
                if percent > 100 {
                    return Err(Error::InvalidArgument("pwm percent above 100"));
                }
                self.control.set_manual_pwm(percent);
            }
            AppCommand::SetMode(mode) => {
                self.control.set_mode(mode);
                self.emit_control(sink);
            }
            AppCommand::SetAutoHoldEnabled(enabled) => {
                self.control.set_auto_hold(enabled);
                self.emit_control(sink);
            }
            AppCommand::SetRelayEnabled(enabled) => {
                self.control.set_relay(enabled);
                self.emit_control(sink);
            }
            AppCommand::SetTargetPressure(target_pa) => {
                self.control.set_target_pressure(target_pa)?;
                self.emit_control(sink);
            }
            AppCommand::CaptureZeroOffsets => {
                let captured = self.metrics.capture_zero_offsets();
                sink.emit(&AppEvent::ZeroOffsetsCaptured { captured });
            }
            AppCommand::SetTestConfig(config) => {
                return self.store_config(self.tests.set_config(&config), sink);
            }
            AppCommand::ResetTestConfig => {
                return self.store_config(self.tests.reset_config(), sink);
            }
            AppCommand::StartTest(mode) => {
                let effects = self.tests.start(mode, now_ms, &self.control)?;
                self.publish(effects, sink);
            }
            AppCommand::StopTest => {
                let effects = self.tests.stop(now_ms, &self.control);
                self.publish(effects, sink);
            }
        }
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn control_snapshot(&self) -> ControlSnapshot {
        self.control.snapshot()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn test_config(&self) -> TestConfig {
        self.tests.config()
    }

    pub fn test_runtime(&self) -> TestRuntime {
        self.tests.runtime()
    }

    pub fn test_state(&self) -> TestState {
        self.tests.state()
    }

    pub fn latest_report(&self) -> Option<TestReport> {
        self.tests.latest_report()
    }

    pub fn report_snapshot(&self) -> Option<ReportSnapshot> {
        self.tests.report_snapshot()
    }

    pub fn report_history(&self) -> Vec<TestReport> {
        self.tests.history()
    }

    pub fn status(&self) -> StatusDocument {
        StatusDocument {
            metrics: self.metrics.snapshot(),
            control: self.control.snapshot(),
            test: self.tests.runtime(),
            test_state: self.tests.state().name(),
            latest_report: self.tests.latest_report(),
        }
    }

    pub fn status_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.status())
    }

    // ── Internal ──────────────────────────────────────────────

    fn emit_control(&self, sink: &mut impl EventSink) {
        let s = self.control.snapshot();
        sink.emit(&AppEvent::ControlChanged {
            mode: s.mode,
            relay_enabled: s.relay_enabled,
            target_pressure_pa: s.target_pressure_pa,
        });
    }

    fn store_config(&self, outcome: Result<()>, sink: &mut impl EventSink) -> Result<()> {
        match outcome {
            Err(e @ Error::FlashIo(_)) => sink.emit(&AppEvent::PersistFailed(e)),
            Err(e) => sink.emit(&AppEvent::ConfigRejected(e)),
            Ok(()) => {}
        }
        outcome
    }

    /// Report sequencer output.  The controller already received the
    /// requests under the test lock; only events are produced here.
    fn publish(&self, effects: TestEffects, sink: &mut impl EventSink) {
        if !effects.requests.is_empty() {
            self.emit_control(sink);
        }

        for &(from, to) in &effects.transitions {
            sink.emit(&AppEvent::TestStateChanged { from, to });
        }

        if let Some(report_id) = effects.completed_report {
            let latest = self.tests.latest_report();
            let (ach_ref_h1, valid) = latest
                .as_ref()
                .filter(|r| r.report_id == report_id)
                .map_or((0.0, false), |r| (r.ach_ref(), r.mean_summary.valid));
            sink.emit(&AppEvent::ReportCompleted {
                report_id,
                ach_ref_h1,
                valid,
            });
        }

        if let Some(Err(e)) = effects.persisted {
            sink.emit(&AppEvent::PersistFailed(e));
        }
    }
}
