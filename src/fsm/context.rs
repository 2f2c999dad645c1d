//! Shared mutable context threaded through every FSM handler.
//!
//! `TestContext` is the blackboard the state handlers read from and write
//! to: the configuration, the report being built, the point accumulators,
//! the inputs of the current tick and the outgoing controller requests.
//! The owning service fills `inputs` before each tick and drains
//! `requests`, `transitions` and `completed_report` after it.

use heapless::Vec;
use log::warn;

use crate::config::TestConfig;
use crate::sensors::MetricsSnapshot;
use crate::sequencer::curve::fan_flow_m3h;
use crate::sequencer::report::{
    Direction, ReportHistory, TestMode, TestPointResult, TestReport, TestRuntime,
};

use super::TestState;

// ---------------------------------------------------------------------------
// Controller requests (written by handlers; applied by the owning service)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlRequest {
    /// Auto-test mode with the relay on.
    EngageAutoTest,
    /// New pressure setpoint in Pa.
    Target(f32),
    /// Manual mode, relay off, 0 %.
    Release,
}

// ---------------------------------------------------------------------------
// Per-tick inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TestInputs {
    pub metrics: MetricsSnapshot,
    pub output_pwm_percent: u8,
    pub now_ms: u32,
}

/// Running sums over one measuring window.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointAccumulator {
    pressure_pa: f32,
    flow_m3h: f32,
    fan_temperature_c: f32,
    envelope_temperature_c: f32,
    pwm_percent: f32,
    samples: u16,
}

impl PointAccumulator {
    pub fn add(&mut self, pressure_pa: f32, flow_m3h: f32, fan_temp_c: f32, env_temp_c: f32, pwm: u8) {
        self.pressure_pa += pressure_pa;
        self.flow_m3h += flow_m3h;
        self.fan_temperature_c += fan_temp_c;
        self.envelope_temperature_c += env_temp_c;
        self.pwm_percent += f32::from(pwm);
        self.samples = self.samples.saturating_add(1);
    }

    pub fn samples(&self) -> u16 {
        self.samples
    }

    /// Averages for a finished point.  Zeros (and `valid = false`) when
    /// nothing was accumulated.
    pub fn finish(&self, target_pa: f32) -> TestPointResult {
        if self.samples == 0 {
            return TestPointResult {
                target_pressure_pa: target_pa,
                ..TestPointResult::default()
            };
        }
        let n = f32::from(self.samples);
        TestPointResult {
            target_pressure_pa: target_pa,
            avg_pressure_pa: self.pressure_pa / n,
            avg_fan_flow_m3h: self.flow_m3h / n,
            avg_fan_temperature_c: self.fan_temperature_c / n,
            avg_envelope_temperature_c: self.envelope_temperature_c / n,
            avg_pwm_percent: self.pwm_percent / n,
            sample_count: self.samples,
            valid: true,
        }
    }
}

// ---------------------------------------------------------------------------
// TestContext
// ---------------------------------------------------------------------------

pub struct TestContext {
    pub config: TestConfig,
    pub runtime: TestRuntime,
    /// Report under construction (or the last one built).
    pub report: TestReport,
    pub history: ReportHistory,
    pub next_report_id: u32,

    pub inputs: TestInputs,
    pub state_entered_ms: u32,

    pub plan: Vec<Direction, 2>,
    pub plan_slot: usize,
    pub stable_since_ms: Option<u32>,
    pub measure_started_ms: Option<u32>,
    pub accumulator: PointAccumulator,

    pub requests: Vec<ControlRequest, 4>,
    pub transitions: Vec<(TestState, TestState), 4>,
    /// Id of a report that completed during the last call.
    pub completed_report: Option<u32>,
}

impl TestContext {
    pub fn new(config: TestConfig) -> Self {
        Self {
            config,
            runtime: TestRuntime::default(),
            report: TestReport::default(),
            history: ReportHistory::default(),
            next_report_id: 1,
            inputs: TestInputs::default(),
            state_entered_ms: 0,
            plan: Vec::new(),
            plan_slot: 0,
            stable_since_ms: None,
            measure_started_ms: None,
            accumulator: PointAccumulator::default(),
            requests: Vec::new(),
            transitions: Vec::new(),
            completed_report: None,
        }
    }

    pub fn request(&mut self, request: ControlRequest) {
        if self.requests.push(request).is_err() {
            warn!("TEST | control request queue full, dropped {:?}", request);
        }
    }

    /// Target of point `idx` in the configured list.
    pub fn point_target(&self, idx: u8) -> Option<f32> {
        self.config.pressure_points_pa.get(usize::from(idx)).copied()
    }

    /// Reset the run state for a new test of `mode` and ask for auto control.
    pub fn begin(&mut self, mode: TestMode, report_id: u32, now_ms: u32) {
        self.report = TestReport {
            report_id,
            reference_pressure_pa: self.config.reference_pressure_pa,
            ..TestReport::default()
        };
        self.plan = mode.plan();
        self.plan_slot = 0;
        self.stable_since_ms = None;
        self.measure_started_ms = None;
        self.accumulator = PointAccumulator::default();
        self.state_entered_ms = now_ms;

        let first = self.point_target(0).unwrap_or(0.0);
        let rt = &mut self.runtime;
        rt.active = true;
        rt.requested_mode = mode;
        rt.current_direction = self.plan.first().copied().unwrap_or_default();
        rt.current_point_index = 0;
        rt.total_points = self.config.point_count() as u8;
        rt.current_target_pressure_pa = first;
        rt.current_measured_pressure_pa = 0.0;
        rt.current_measured_flow_m3h = 0.0;
        rt.state_elapsed_ms = 0;
        rt.active_sample_count = 0;
        rt.reflect_latest(self.history.latest());

        self.request(ControlRequest::EngageAutoTest);
    }

    /// Store this tick's inputs and refresh the live measurement fields.
    pub fn observe(&mut self, inputs: TestInputs) {
        self.inputs = inputs;
        if !self.runtime.active {
            return;
        }
        let m = &inputs.metrics;
        self.runtime.current_measured_pressure_pa = m.envelope_pressure_pa.abs();
        self.runtime.current_measured_flow_m3h = self.fan_flow(m);
    }

    pub fn fan_flow(&self, m: &MetricsSnapshot) -> f32 {
        fan_flow_m3h(&self.config, m.fan_pressure_pa, m.envelope_temperature_c)
    }

    /// Drop everything the service has already consumed.
    pub fn clear_outbox(&mut self) {
        self.requests.clear();
        self.transitions.clear();
        self.completed_report = None;
    }
}
