//! GPIO / peripheral pin assignments for the blower-door controller board.
//!
//! Single source of truth: every driver references this module rather than
//! hard-coding pin numbers.

// ---------------------------------------------------------------------------
// Phase-angle dimmer (core 1)
// ---------------------------------------------------------------------------

/// Digital input from the zero-cross detector opto (rising edge per half cycle).
pub const ZC_GPIO: i32 = 2;
/// Digital output to the triac gate driver opto (active HIGH).
pub const GATE_GPIO: i32 = 3;

// ---------------------------------------------------------------------------
// Differential-pressure sensors (ADP910, I2C)
// ---------------------------------------------------------------------------

/// 7-bit I2C address of the ADP910.
pub const ADP910_ADDRESS: u8 = 0x25;

/// Fan (flow ring) sensor on I2C0.
pub const FAN_SENSOR_SDA_GPIO: u8 = 4;
pub const FAN_SENSOR_SCL_GPIO: u8 = 5;

/// Envelope (indoor/outdoor) sensor on I2C1.
pub const ENVELOPE_SENSOR_SDA_GPIO: u8 = 6;
pub const ENVELOPE_SENSOR_SCL_GPIO: u8 = 7;
