//! Inbound commands to the application service.
//!
//! These are the mutating operations of the HTTP boundary.  Reads go
//! through the query methods on
//! [`BlowerService`](super::service::BlowerService) instead.

use crate::config::TestConfig;
use crate::control::ControlMode;
use crate::sequencer::report::TestMode;

/// Commands that external adapters can send into the application core.
#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    SetManualPwm(u8),
    SetMode(ControlMode),
    SetAutoHoldEnabled(bool),
    SetRelayEnabled(bool),
    SetTargetPressure(f32),

    /// Zero both pressure channels at their current readings.
    CaptureZeroOffsets,

    SetTestConfig(TestConfig),
    ResetTestConfig,

    StartTest(TestMode),
    StopTest,
}
