//! Adaptive pressure controller.
//!
//! Converts a measured envelope pressure into a 0–100 % dimmer duty.
//!
//! ```text
//!  relay off ─────────────────────────────────────────▶ 0 %
//!  manual / invalid sample ───────────────────────────▶ manual %
//!  auto-hold:
//!    startup boost ── 100 % until target approached ──┐
//!                                                     ▼
//!    closed loop:  base (learned FF or last output)
//!                  + kp·g·e + ki·g·∫e + kd·g·ė   (g = adaptive gain scale)
//!                  step-limited, clamped, rounded ───▶ output %
//! ```
//!
//! The gain scale starts at its minimum after every reset and grows while
//! the loop is quiet; each error sign flip shrinks it and decays the
//! integral.  During the learning window the output at settled cycles is
//! averaged into a feed-forward that later serves as the base duty.
//!
//! Every tuning constant is clamped to a sane window at the point of use.

use serde::{Deserialize, Serialize};

use crate::config::ControlTuning;
use crate::error::{Error, Result};

/// Largest target the controller accepts (Pa).
pub const MAX_TARGET_PA: f32 = 200.0;

const DT_EPSILON_S: f32 = 1e-4;
const INTEGRAL_REST_DECAY: f32 = 0.98;

/// Operating mode.  Anything but `Manual` enables auto-hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlMode {
    #[default]
    Manual,
    SemiAutoTarget,
    AutoTest,
}

impl ControlMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::SemiAutoTarget => "semi_auto",
            Self::AutoTest => "auto_test",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "manual" => Some(Self::Manual),
            "semi_auto" => Some(Self::SemiAutoTarget),
            "auto_test" => Some(Self::AutoTest),
            _ => None,
        }
    }

    pub fn auto_hold(self) -> bool {
        self != Self::Manual
    }
}

/// Copy-out view of the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub manual_pwm_percent: u8,
    pub output_pwm_percent: u8,
    pub mode: ControlMode,
    pub auto_hold_enabled: bool,
    pub relay_enabled: bool,
    pub target_pressure_pa: f32,
    pub kp: f32,
    pub kd: f32,
    pub deadband_pa: f32,
    pub max_step_percent: f32,
    pub line_sync: bool,
    pub line_frequency_hz: f32,
    pub gain_scale: f32,
    pub learning_active: bool,
    pub startup_boost_active: bool,
}

// ── Clamped tuning ───────────────────────────────────────────

/// `clamp` that maps NaN to the lower bound.
fn bounded(value: f32, lo: f32, hi: f32) -> f32 {
    if value.is_nan() { lo } else { value.clamp(lo, hi) }
}

fn lerp(from: f32, to: f32, ratio: f32) -> f32 {
    from + (to - from) * ratio.clamp(0.0, 1.0)
}

impl ControlTuning {
    fn gain_min(&self) -> f32 {
        bounded(self.gain_scale_min, 0.05, 1.0)
    }

    fn gain_max(&self) -> f32 {
        let min = self.gain_min();
        bounded(self.gain_scale_max, min, 2.0)
    }

    fn growth(&self) -> f32 {
        bounded(self.gain_growth, 1e-4, 0.05)
    }

    /// Step-size multiplier: `near_step_ratio` at zero error, 1 at the far
    /// threshold and beyond.
    fn step_scale(&self, error_pa: f32) -> f32 {
        let far = self.far_error_pa.max(0.1);
        let near = bounded(self.near_step_ratio, 0.05, 1.0);
        lerp(near, 1.0, error_pa.abs() / far)
    }
}

#[derive(Debug, Clone, Copy)]
struct LastError {
    error_pa: f32,
    tick_ms: u32,
}

/// Controller state and control law.  Not synchronised; the service wraps
/// it in a mutex.
#[derive(Debug, Clone)]
pub struct PressureController {
    tuning: ControlTuning,

    manual_pwm: u8,
    output_pwm: u8,
    mode: ControlMode,
    relay_enabled: bool,
    target_pa: f32,

    integral_pa_s: f32,
    last: Option<LastError>,
    filtered_pa: Option<f32>,
    gain_scale: f32,

    learning_active: bool,
    learning_start_ms: Option<u32>,
    learning_stable_cycles: u16,
    feedforward_pwm: Option<f32>,

    startup_boost_active: bool,
    startup_boost_start_ms: Option<u32>,

    line_sync: bool,
    line_frequency_hz: f32,
}

impl PressureController {
    pub fn new(tuning: ControlTuning) -> Self {
        let target = if tuning.default_target_pa.is_finite() {
            tuning.default_target_pa.clamp(0.0, MAX_TARGET_PA)
        } else {
            0.0
        };
        Self {
            manual_pwm: 0,
            output_pwm: 0,
            mode: ControlMode::Manual,
            relay_enabled: false,
            target_pa: target,
            integral_pa_s: 0.0,
            last: None,
            filtered_pa: None,
            gain_scale: tuning.gain_min(),
            learning_active: true,
            learning_start_ms: None,
            learning_stable_cycles: 0,
            feedforward_pwm: None,
            startup_boost_active: true,
            startup_boost_start_ms: None,
            line_sync: false,
            line_frequency_hz: 0.0,
            tuning,
        }
    }

    pub fn tuning(&self) -> &ControlTuning {
        &self.tuning
    }

    // ── Commands ─────────────────────────────────────────────

    /// Manual duty, clamped to 100.  Takes effect immediately when the
    /// relay is on and auto-hold is off.
    pub fn set_manual_pwm(&mut self, percent: u8) {
        self.manual_pwm = percent.min(100);
        if !self.mode.auto_hold() && self.relay_enabled {
            self.output_pwm = self.manual_pwm;
        }
    }

    pub fn set_mode(&mut self, mode: ControlMode) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        self.reset_pd_state();
        self.startup_boost_active = mode.auto_hold();
        self.startup_boost_start_ms = None;

        if mode.auto_hold() {
            self.output_pwm = self.manual_pwm;
            self.feedforward_pwm = None;
        } else if self.relay_enabled {
            self.output_pwm = self.manual_pwm;
        }
    }

    /// Enabling keeps `AutoTest` if already there, else selects
    /// `SemiAutoTarget`.  Disabling selects `Manual`.
    pub fn set_auto_hold(&mut self, enabled: bool) {
        let mode = match (enabled, self.mode) {
            (false, _) => ControlMode::Manual,
            (true, ControlMode::AutoTest) => ControlMode::AutoTest,
            (true, _) => ControlMode::SemiAutoTarget,
        };
        self.set_mode(mode);
    }

    pub fn set_relay(&mut self, enabled: bool) {
        self.relay_enabled = enabled;
        if !enabled {
            self.output_pwm = 0;
            self.reset_pd_state();
            self.arm_startup_boost();
        } else if !self.mode.auto_hold() {
            self.output_pwm = self.manual_pwm;
        } else {
            self.arm_startup_boost();
            self.feedforward_pwm = None;
        }
    }

    /// Accepts finite targets in `[0, 200]` Pa; anything else is rejected
    /// without touching state.
    pub fn set_target_pressure(&mut self, target_pa: f32) -> Result<()> {
        if target_pa.is_nan() || !(0.0..=MAX_TARGET_PA).contains(&target_pa) {
            return Err(Error::InvalidArgument("target pressure out of range"));
        }
        self.target_pa = target_pa;
        self.reset_pd_state();
        Ok(())
    }

    /// Store externally measured line status.  Diagnostics only.
    pub fn update_line_feedback(&mut self, sync: bool, frequency_hz: f32) {
        self.line_sync = sync;
        self.line_frequency_hz = if frequency_hz >= 0.0 { frequency_hz } else { 0.0 };
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            manual_pwm_percent: self.manual_pwm,
            output_pwm_percent: self.output_pwm,
            mode: self.mode,
            auto_hold_enabled: self.mode.auto_hold(),
            relay_enabled: self.relay_enabled,
            target_pressure_pa: self.target_pa,
            kp: self.tuning.kp,
            kd: self.tuning.kd,
            deadband_pa: self.tuning.deadband_pa,
            max_step_percent: self.tuning.max_step_up,
            line_sync: self.line_sync,
            line_frequency_hz: self.line_frequency_hz,
            gain_scale: self.gain_scale,
            learning_active: self.learning_active,
            startup_boost_active: self.startup_boost_active,
        }
    }

    // ── Control law ──────────────────────────────────────────

    /// One control cycle.  Returns the new output duty.
    pub fn step(&mut self, envelope_pressure_pa: f32, measurement_valid: bool, now_ms: u32) -> u8 {
        if !self.relay_enabled {
            self.output_pwm = 0;
            self.reset_pd_state();
            return 0;
        }

        if !self.mode.auto_hold() || !measurement_valid {
            self.output_pwm = self.manual_pwm;
            self.reset_pd_state();
            self.arm_startup_boost();
            return self.output_pwm;
        }

        let t = self.tuning;
        let filtered = self.filter(envelope_pressure_pa);
        let measured_abs = filtered.abs();
        let mut error = self.target_pa - measured_abs;

        let boost_start = *self.startup_boost_start_ms.get_or_insert(now_ms);
        if self.startup_boost_active {
            let elapsed = now_ms.wrapping_sub(boost_start);
            let reached = measured_abs >= self.target_pa * t.startup_target_ratio;
            let overshoot = measured_abs >= self.target_pa * t.max_overshoot_ratio;
            self.output_pwm = 100;

            if (reached && elapsed >= t.startup_min_hold_ms)
                || overshoot
                || elapsed >= t.startup_full_power_hold_ms
            {
                self.startup_boost_active = false;
                self.reset_pd_terms();
                self.learning_active = true;
                self.learning_start_ms = Some(now_ms);
                self.learning_stable_cycles = 0;
            } else {
                return self.output_pwm;
            }
        }

        if error.abs() < t.deadband_pa {
            error = 0.0;
        }

        let mut dt_s = t.loop_period_ms as f32 / 1000.0;
        let mut derivative = 0.0;
        let last = self.last;
        if let Some(last) = last {
            let elapsed_ms = now_ms.wrapping_sub(last.tick_ms);
            if elapsed_ms != 0 {
                dt_s = elapsed_ms as f32 / 1000.0;
                if dt_s > DT_EPSILON_S {
                    derivative = (error - last.error_pa) / dt_s;
                }
            }
        }
        let dclamp = bounded(t.derivative_clamp.abs(), 0.0, f32::MAX);
        derivative = derivative.clamp(-dclamp, dclamp);

        // Sign flip outside the deadband: back off.
        let flipped = last.is_some_and(|l| error * l.error_pa < 0.0 && error.abs() > t.deadband_pa);
        if flipped {
            self.integral_pa_s *= bounded(t.flip_integral_decay, 0.1, 1.0);
            self.gain_scale -= bounded(t.gain_shrink, 1e-4, 0.2);
            if self.gain_scale < t.gain_min() {
                self.gain_scale = t.gain_min();
            }
            self.learning_stable_cycles = 0;
        }

        if error == 0.0 {
            self.integral_pa_s *= INTEGRAL_REST_DECAY;
        } else {
            let limit = bounded(t.integral_limit, 5.0, 500.0);
            self.integral_pa_s = (self.integral_pa_s + error * dt_s).clamp(-limit, limit);
        }

        self.update_learning(error, derivative, now_ms);

        let base = self.feedforward_pwm.unwrap_or(f32::from(self.output_pwm));
        let scale = t.step_scale(error);
        let mut step_up = t.max_step_up * scale;
        let mut step_down = t.max_step_down * scale;
        if self.learning_active {
            step_up = step_up.min(t.learning_step_up);
            step_down = step_down.min(t.learning_step_down);
        }

        let g = self.gain_scale;
        let mut next = base
            + t.kp * g * error
            + t.ki * g * self.integral_pa_s
            + t.kd * g * derivative;

        let current = f32::from(self.output_pwm);
        if next > current + step_up {
            next = current + step_up;
        } else if next < current - step_down {
            next = current - step_down;
        }

        // NaN from a hostile tuning collapses to 0 here.
        let next = if next.is_nan() { 0.0 } else { next.clamp(0.0, 100.0) };
        self.output_pwm = (next + 0.5) as u8;
        self.last = Some(LastError {
            error_pa: error,
            tick_ms: now_ms,
        });
        self.output_pwm
    }

    // ── Internal ─────────────────────────────────────────────

    fn filter(&mut self, measured_pa: f32) -> f32 {
        let alpha = bounded(self.tuning.filter_alpha, 0.01, 1.0);
        let value = match self.filtered_pa {
            None => measured_pa,
            Some(prev) => prev + alpha * (measured_pa - prev),
        };
        self.filtered_pa = Some(value);
        value
    }

    fn update_learning(&mut self, error_pa: f32, derivative: f32, now_ms: u32) {
        let t = self.tuning;
        let band = bounded(t.learning_band_pa, 0.5, 10.0);
        let max_derivative = bounded(t.learning_max_derivative, 0.5, 20.0);
        let growth = t.growth();
        let in_zone = error_pa.abs() <= band && derivative.abs() <= max_derivative;

        let start = *self.learning_start_ms.get_or_insert(now_ms);

        if self.learning_active {
            if in_zone {
                self.learning_stable_cycles = self.learning_stable_cycles.saturating_add(1);
                let output = f32::from(self.output_pwm);
                self.feedforward_pwm = Some(match self.feedforward_pwm {
                    None => output,
                    Some(ff) => ff + bounded(t.feedforward_alpha, 0.01, 0.5) * (output - ff),
                });
                self.gain_scale += growth * 2.0;
            } else {
                self.learning_stable_cycles = 0;
                self.gain_scale += growth;
            }

            if now_ms.wrapping_sub(start) >= t.learning_window_ms
                || self.learning_stable_cycles >= t.learning_stable_cycles
            {
                self.learning_active = false;
            }
        } else {
            self.gain_scale += growth;
        }

        self.gain_scale = self.gain_scale.clamp(t.gain_min(), t.gain_max());
    }

    fn arm_startup_boost(&mut self) {
        self.startup_boost_active = true;
        self.startup_boost_start_ms = None;
    }

    fn reset_pd_terms(&mut self) {
        self.integral_pa_s = 0.0;
        self.last = None;
    }

    fn reset_pd_state(&mut self) {
        self.reset_pd_terms();
        self.filtered_pa = None;
        self.gain_scale = self.tuning.gain_min();
        self.learning_active = true;
        self.learning_start_ms = None;
        self.learning_stable_cycles = 0;
        self.feedforward_pwm = None;
    }

    #[cfg(test)]
    fn integral(&self) -> f32 {
        self.integral_pa_s
    }
}

impl Default for PressureController {
    fn default() -> Self {
        Self::new(ControlTuning::default())
    }
}
