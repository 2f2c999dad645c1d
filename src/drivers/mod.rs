//! Phase-angle dimmer and task placement helpers.

pub mod dimmer;
pub mod task_pin;
