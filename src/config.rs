//! System configuration parameters
//!
//! All tunable parameters for the blower-door tester.  Controller and board
//! settings are compile-time defaults; [`TestConfig`] is operator-editable
//! and persisted to flash by the test service.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pins;

/// Maximum number of pressure points in one test direction.
pub const MAX_PRESSURE_POINTS: usize = 12;

// ───────────────────────────────────────────────────────────────
// Pressure controller tuning
// ───────────────────────────────────────────────────────────────

/// Every constant of the adaptive pressure control law.
///
/// Values outside their sane window are clamped where they are used, so a
/// bad tuning degrades the loop instead of breaking it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlTuning {
    /// Initial target pressure (Pa).
    pub default_target_pa: f32,
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// |error| below this is treated as zero (Pa).
    pub deadband_pa: f32,
    /// Largest output increase per step (%).
    pub max_step_up: f32,
    /// Largest output decrease per step (%).
    pub max_step_down: f32,
    /// Step caps while the learning window is open (%).
    pub learning_step_up: f32,
    pub learning_step_down: f32,
    /// Exponential smoothing factor for the measured pressure.
    pub filter_alpha: f32,
    /// Derivative magnitude limit (Pa/s).
    pub derivative_clamp: f32,
    /// Symmetric integral accumulator limit (Pa·s).
    pub integral_limit: f32,
    /// Integral multiplier applied on an error sign flip.
    pub flip_integral_decay: f32,
    pub gain_scale_min: f32,
    pub gain_scale_max: f32,
    /// Gain-scale increment per unsettled cycle.
    pub gain_growth: f32,
    /// Gain-scale decrement on an error sign flip.
    pub gain_shrink: f32,
    /// Settle band for learning (Pa).
    pub learning_band_pa: f32,
    /// Max |derivative| for a cycle to count as settled (Pa/s).
    pub learning_max_derivative: f32,
    /// Smoothing factor for the learned feed-forward.
    pub feedforward_alpha: f32,
    /// Learning window length (ms).
    pub learning_window_ms: u32,
    /// Settled cycles that close the learning window early.
    pub learning_stable_cycles: u16,
    /// Fraction of target that counts as "reached" during startup boost.
    pub startup_target_ratio: f32,
    /// Fraction of target that ends startup boost immediately.
    pub max_overshoot_ratio: f32,
    pub startup_min_hold_ms: u32,
    pub startup_full_power_hold_ms: u32,
    /// Error at which the full step size applies (Pa).
    pub far_error_pa: f32,
    /// Step size fraction at zero error.
    pub near_step_ratio: f32,
    pub loop_period_ms: u32,
    /// Zero-cross silence after which the line counts as lost (µs).
    pub line_sync_timeout_us: u32,
}

impl Default for ControlTuning {
    fn default() -> Self {
        Self {
            default_target_pa: 50.0,
            kp: 0.4,
            ki: 0.08,
            kd: 0.05,
            deadband_pa: 0.5,
            max_step_up: 6.0,
            max_step_down: 8.0,
            learning_step_up: 3.0,
            learning_step_down: 4.0,
            filter_alpha: 0.35,
            derivative_clamp: 50.0,
            integral_limit: 200.0,
            flip_integral_decay: 0.5,
            gain_scale_min: 0.3,
            gain_scale_max: 1.0,
            gain_growth: 0.005,
            gain_shrink: 0.05,
            learning_band_pa: 2.0,
            learning_max_derivative: 5.0,
            feedforward_alpha: 0.1,
            learning_window_ms: 20_000,
            learning_stable_cycles: 30,
            startup_target_ratio: 0.9,
            max_overshoot_ratio: 1.05,
            startup_min_hold_ms: 1_500,
            startup_full_power_hold_ms: 8_000,
            far_error_pa: 20.0,
            near_step_ratio: 0.25,
            loop_period_ms: 100,
            line_sync_timeout_us: 100_000,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Dimmer timing
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimmerTiming {
    /// Mains half cycle (50 Hz → 10 ms).
    pub half_cycle_us: u32,
    /// Triac gate trigger pulse width.
    pub gate_pulse_us: u32,
    /// Zero-cross edges closer than this to the previous one are bounce.
    pub debounce_us: u32,
}

impl DimmerTiming {
    /// 50 Hz mains with the board's opto-triac.
    pub const MAINS_50HZ: Self = Self {
        half_cycle_us: 10_000,
        gate_pulse_us: 100,
        debounce_us: 1_500,
    };
}

impl Default for DimmerTiming {
    fn default() -> Self {
        Self::MAINS_50HZ
    }
}

// ───────────────────────────────────────────────────────────────
// Sensors
// ───────────────────────────────────────────────────────────────

/// I2C controller instance a sensor is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum I2cPort {
    I2c0,
    I2c1,
}

impl I2cPort {
    pub const fn index(self) -> i32 {
        match self {
            Self::I2c0 => 0,
            Self::I2c1 => 1,
        }
    }
}

/// Wiring and bus settings for one differential-pressure sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorPortConfig {
    pub port: I2cPort,
    pub address: u8,
    pub sda_pin: u8,
    pub scl_pin: u8,
    pub frequency_hz: u32,
}

impl SensorPortConfig {
    /// Board routing rule: SCL sits on the pin after SDA, and each controller
    /// only reaches its own pin group (I2C0 on SDA ≡ 0 mod 4, I2C1 on SDA ≡ 2
    /// mod 4).
    pub fn validate(&self) -> Result<()> {
        if self.frequency_hz == 0 {
            return Err(Error::InvalidArgument("bus frequency is zero"));
        }
        if u16::from(self.scl_pin) != u16::from(self.sda_pin) + 1 {
            return Err(Error::InvalidArgument("SCL must follow SDA"));
        }
        let group_ok = match self.port {
            I2cPort::I2c0 => self.sda_pin % 4 == 0,
            I2cPort::I2c1 => self.sda_pin % 4 == 2,
        };
        if !group_ok {
            return Err(Error::InvalidArgument("SDA pin not in controller pin group"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub fan: SensorPortConfig,
    pub envelope: SensorPortConfig,
    /// Poll period of the sensor task (ms).
    pub sample_period_ms: u32,
    /// Minimum spacing between initialisation attempts of a failed channel.
    pub init_retry_ms: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            fan: SensorPortConfig {
                port: I2cPort::I2c0,
                address: pins::ADP910_ADDRESS,
                sda_pin: pins::FAN_SENSOR_SDA_GPIO,
                scl_pin: pins::FAN_SENSOR_SCL_GPIO,
                frequency_hz: 100_000,
            },
            envelope: SensorPortConfig {
                port: I2cPort::I2c1,
                address: pins::ADP910_ADDRESS,
                sda_pin: pins::ENVELOPE_SENSOR_SDA_GPIO,
                scl_pin: pins::ENVELOPE_SENSOR_SCL_GPIO,
                frequency_hz: 100_000,
            },
            sample_period_ms: 100,
            init_retry_ms: 1_000,
        }
    }
}

/// Gains of the built-in linear derived-quantity models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub pascal_to_speed_gain: f32,
    pub leakage_gain: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            pascal_to_speed_gain: 1.0,
            leakage_gain: 1.0,
        }
    }
}

/// Which sensor channel feeds the pressure controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PressureSource {
    #[default]
    Envelope,
    Fan,
    /// The valid channel with the smaller absolute pressure.
    AutoMinAbs,
}

// ───────────────────────────────────────────────────────────────
// System configuration
// ───────────────────────────────────────────────────────────────

/// Core system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub control: ControlTuning,
    pub dimmer: DimmerTiming,
    pub sensors: SensorConfig,
    pub models: ModelConfig,
    pub pressure_source: PressureSource,
    /// Period of the test sequencer loop (ms).
    pub test_period_ms: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            control: ControlTuning::default(),
            dimmer: DimmerTiming::default(),
            sensors: SensorConfig::default(),
            models: ModelConfig::default(),
            pressure_source: PressureSource::default(),
            test_period_ms: 200,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Blower-door test configuration
// ───────────────────────────────────────────────────────────────

const MIN_POINT_PA: f32 = 10.0;
const MAX_POINT_PA: f32 = 100.0;
const DEFAULT_MIN_POINTS: u8 = 5;
const DEFAULT_POINTS_PA: [f32; 8] = [65.0, 58.0, 50.0, 42.0, 34.0, 26.0, 18.0, 10.0];
const _: () = assert!(DEFAULT_POINTS_PA.len() <= MAX_PRESSURE_POINTS);

/// Fan calibration: Q = C·ΔP^n (m³/h, Pa) at full aperture, sea-level air.
pub const FAN_FLOW_COEFFICIENT_C: f32 = 150.0;
pub const FAN_FLOW_EXPONENT_N: f32 = 0.5;

/// Operator-editable test setup: building geometry, fan calibration and the
/// pressure schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    pub building_volume_m3: f32,
    pub floor_area_m2: f32,
    pub envelope_area_m2: f32,
    pub building_height_m: f32,
    pub dimensions_uncertainty_pct: f32,
    pub altitude_m: f32,
    pub fan_aperture_cm: f32,
    pub fan_curve_c: f32,
    pub fan_curve_n: f32,
    pub target_tolerance_pa: f32,
    pub settle_time_s: u16,
    pub measure_time_s: u16,
    pub reference_pressure_pa: u8,
    pub min_points_required: u8,
    pub enforce_iso_9972_rules: bool,
    pub pressure_points_pa: Vec<f32, MAX_PRESSURE_POINTS>,
}

impl Default for TestConfig {
    fn default() -> Self {
        let points = Vec::from_slice(&DEFAULT_POINTS_PA).unwrap_or_default();
        Self {
            building_volume_m3: 126.7,
            floor_area_m2: 43.7,
            envelope_area_m2: 168.0,
            building_height_m: 2.9,
            dimensions_uncertainty_pct: 5.0,
            altitude_m: 650.0,
            fan_aperture_cm: 31.0,
            fan_curve_c: FAN_FLOW_COEFFICIENT_C,
            fan_curve_n: FAN_FLOW_EXPONENT_N,
            target_tolerance_pa: 2.0,
            settle_time_s: 8,
            measure_time_s: 10,
            reference_pressure_pa: 50,
            min_points_required: DEFAULT_MIN_POINTS,
            enforce_iso_9972_rules: true,
            pressure_points_pa: points,
        }
    }
}

fn finite_above(value: f32, floor: f32) -> bool {
    value.is_finite() && value > floor
}

impl TestConfig {
    /// Validate every field and return the normalised copy: soft limits
    /// clamped, points sorted descending.  Rejects the whole config on any
    /// hard violation; `self` is never modified.
    pub fn validate_and_normalize(&self) -> Result<Self> {
        let mut cfg = self.clone();

        if !finite_above(cfg.building_volume_m3, 1.0) {
            return Err(Error::InvalidArgument("building volume"));
        }
        if !finite_above(cfg.floor_area_m2, 1.0) {
            return Err(Error::InvalidArgument("floor area"));
        }
        if !finite_above(cfg.envelope_area_m2, 1.0) {
            return Err(Error::InvalidArgument("envelope area"));
        }
        if !finite_above(cfg.building_height_m, 0.5) {
            return Err(Error::InvalidArgument("building height"));
        }
        if !finite_above(cfg.fan_curve_c, 0.0) || !finite_above(cfg.fan_curve_n, 0.0) {
            return Err(Error::InvalidArgument("fan curve"));
        }
        if !cfg.target_tolerance_pa.is_finite() {
            return Err(Error::InvalidArgument("target tolerance"));
        }

        cfg.target_tolerance_pa = cfg.target_tolerance_pa.clamp(0.2, 10.0);
        cfg.settle_time_s = cfg.settle_time_s.clamp(2, 180);
        cfg.measure_time_s = cfg.measure_time_s.clamp(2, 300);
        cfg.fan_aperture_cm = clamp_or(cfg.fan_aperture_cm, 5.0, 60.0);
        cfg.altitude_m = clamp_or(cfg.altitude_m, 0.0, 6000.0);
        cfg.dimensions_uncertainty_pct = clamp_or(cfg.dimensions_uncertainty_pct, 0.0, 100.0);

        if !(10..=100).contains(&cfg.reference_pressure_pa) {
            return Err(Error::InvalidArgument("reference pressure"));
        }
        if cfg.pressure_points_pa.is_empty() {
            return Err(Error::InvalidArgument("no pressure points"));
        }
        if cfg.min_points_required == 0 || usize::from(cfg.min_points_required) > MAX_PRESSURE_POINTS
        {
            cfg.min_points_required = DEFAULT_MIN_POINTS;
        }
        if cfg
            .pressure_points_pa
            .iter()
            .any(|p| !p.is_finite() || *p < MIN_POINT_PA || *p > MAX_POINT_PA)
        {
            return Err(Error::InvalidArgument("pressure point out of range"));
        }

        cfg.pressure_points_pa
            .sort_unstable_by(|a, b| b.total_cmp(a));

        if cfg.enforce_iso_9972_rules && cfg.point_count() < usize::from(cfg.min_points_required) {
            return Err(Error::InvalidArgument("fewer points than ISO minimum"));
        }

        Ok(cfg)
    }

    pub fn point_count(&self) -> usize {
        self.pressure_points_pa.len()
    }

    /// Replace the schedule from a slice.  Fails when it exceeds capacity.
    pub fn set_points(&mut self, points: &[f32]) -> Result<()> {
        self.pressure_points_pa =
            Vec::from_slice(points).map_err(|()| Error::SizeOutOfRange)?;
        Ok(())
    }
}

/// Clamp that maps NaN to the lower bound instead of propagating it.
fn clamp_or(value: f32, lo: f32, hi: f32) -> f32 {
    if value.is_nan() { lo } else { value.clamp(lo, hi) }
}
