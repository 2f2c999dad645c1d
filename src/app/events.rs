//! Outbound application events.
//!
//! The [`BlowerService`](super::service::BlowerService) emits these through
//! the [`EventSink`](super::ports::EventSink) port.  Adapters on the other
//! side decide what to do with them.

use crate::control::ControlMode;
use crate::error::Error;
use crate::fsm::TestState;

/// Structured events emitted by the application core.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// The service is up.
    Started {
        state: TestState,
        stored_reports: usize,
        storage_enabled: bool,
    },

    /// The test sequencer moved between states.
    TestStateChanged { from: TestState, to: TestState },

    /// A test finished and its report joined the history.
    ReportCompleted {
        report_id: u32,
        ach_ref_h1: f32,
        valid: bool,
    },

    /// Controller settings changed by a command or the sequencer.
    ControlChanged {
        mode: ControlMode,
        relay_enabled: bool,
        target_pressure_pa: f32,
    },

    /// Writing the persisted image failed.
    PersistFailed(Error),

    /// A test configuration update was refused.
    ConfigRejected(Error),

    /// Zero offsets were requested; `captured` is false when neither
    /// channel had a sample yet.
    ZeroOffsetsCaptured { captured: bool },
}
