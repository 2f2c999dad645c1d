//! Derived-quantity models for the metrics aggregator.
//!
//! A model turns the fan ring pressure into a fan speed figure and combines
//! it with the envelope pressure into a leakage estimate.  Implementations
//! must be pure: same inputs, same outputs, no I/O.

use crate::config::ModelConfig;

/// Pluggable fan-speed and leakage formulas.
pub trait MetricsModel: Send {
    fn fan_speed(&self, fan_pressure_pa: f32) -> f32;
    fn air_leakage(&self, fan_speed: f32, envelope_pressure_pa: f32) -> f32;
}

/// Default model: both quantities proportional to pressure magnitude.
#[derive(Debug, Clone, Copy)]
pub struct LinearModel {
    speed_gain: f32,
    leakage_gain: f32,
}

impl LinearModel {
    /// Non-positive gains fall back to 1.
    pub fn new(config: ModelConfig) -> Self {
        let positive_or_one = |g: f32| if g > 0.0 { g } else { 1.0 };
        Self {
            speed_gain: positive_or_one(config.pascal_to_speed_gain),
            leakage_gain: positive_or_one(config.leakage_gain),
        }
    }
}

impl Default for LinearModel {
    fn default() -> Self {
        Self::new(ModelConfig::default())
    }
}

impl MetricsModel for LinearModel {
    fn fan_speed(&self, fan_pressure_pa: f32) -> f32 {
        fan_pressure_pa.abs() * self.speed_gain
    }

    fn air_leakage(&self, fan_speed: f32, envelope_pressure_pa: f32) -> f32 {
        fan_speed * envelope_pressure_pa.abs() * self.leakage_gain
    }
}
