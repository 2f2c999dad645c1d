//! Function-pointer finite state machine engine for the leakage test.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  StateTable                                                 │
//! │  ┌─────────────┬───────────┬───────────────────┐            │
//! │  │ TestState   │ on_enter  │ on_update         │            │
//! │  ├─────────────┼───────────┼───────────────────┤            │
//! │  │ Idle        │ -         │ fn(ctx)->Option<> │            │
//! │  │ Preparing   │ -         │ fn(ctx)->Option<> │            │
//! │  │ Stabilizing │ fn(ctx)   │ fn(ctx)->Option<> │            │
//! │  │ Measuring   │ fn(ctx)   │ fn(ctx)->Option<> │            │
//! │  │ Completed   │ fn(ctx)   │ fn(ctx)->Option<> │            │
//! │  │ Aborted     │ fn(ctx)   │ fn(ctx)->Option<> │            │
//! │  │ Error       │ fn(ctx)   │ fn(ctx)->Option<> │            │
//! │  └─────────────┴───────────┴───────────────────┘            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each tick the engine calls `on_update` for the current state.  If it
//! returns `Some(next)`, the engine records the transition in
//! `ctx.transitions` and runs `on_enter` for the next state.  Handlers only
//! touch the [`TestContext`] blackboard; controller commands leave through
//! its request queue.

pub mod context;
pub mod states;

use context::TestContext;
use log::info;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

/// Test sequencer states.
/// Must stay in sync with the table built in [`states::build_state_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TestState {
    #[default]
    Idle = 0,
    Preparing = 1,
    Stabilizing = 2,
    Measuring = 3,
    Completed = 4,
    Aborted = 5,
    Error = 6,
}

impl TestState {
    pub const COUNT: usize = 7;

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Stabilizing => "stabilizing",
            Self::Measuring => "measuring",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }

    /// States in which a test is running.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Preparing | Self::Stabilizing | Self::Measuring)
    }
}

// ---------------------------------------------------------------------------
// Function-pointer type aliases
// ---------------------------------------------------------------------------

/// Signature for `on_enter` actions.
pub type StateActionFn = fn(&mut TestContext);

/// Per-tick handler.  Returns `Some(next)` to trigger a transition.
pub type StateUpdateFn = fn(&mut TestContext) -> Option<TestState>;

/// One row of the state table.
pub struct StateDescriptor {
    pub id: TestState,
    pub name: &'static str,
    pub on_enter: Option<StateActionFn>,
    pub on_update: StateUpdateFn,
}

// ---------------------------------------------------------------------------
// FSM engine
// ---------------------------------------------------------------------------

pub struct Fsm {
    table: [StateDescriptor; TestState::COUNT],
    current: TestState,
}

impl Fsm {
    pub fn new(table: [StateDescriptor; TestState::COUNT], initial: TestState) -> Self {
        Self {
            table,
            current: initial,
        }
    }

    fn row(&self, state: TestState) -> &StateDescriptor {
        &self.table[state as usize]
    }

    /// Run the initial `on_enter`.  Call once before the first `tick()`.
    pub fn start(&mut self, ctx: &mut TestContext) {
        info!("FSM starting in state: {}", self.row(self.current).name);
        ctx.state_entered_ms = ctx.inputs.now_ms;
        ctx.runtime.state = self.current;
        if let Some(enter) = self.row(self.current).on_enter {
            enter(ctx);
        }
    }

    /// Advance by one tick using the inputs already stored in `ctx`.
    pub fn tick(&mut self, ctx: &mut TestContext) {
        ctx.runtime.state_elapsed_ms = ctx.inputs.now_ms.wrapping_sub(ctx.state_entered_ms);
        if let Some(next) = (self.row(self.current).on_update)(ctx) {
            self.transition(next, ctx);
        }
    }

    /// Jump to `next` regardless of what `on_update` would say.  No-op when
    /// already there.
    pub fn force_transition(&mut self, next: TestState, ctx: &mut TestContext) {
        if next != self.current {
            self.transition(next, ctx);
        }
    }

    pub fn current_state(&self) -> TestState {
        self.current
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn transition(&mut self, next: TestState, ctx: &mut TestContext) {
        let from = self.current;
        info!(
            "FSM transition: {} -> {}",
            self.row(from).name,
            self.row(next).name
        );

        self.current = next;
        ctx.state_entered_ms = ctx.inputs.now_ms;
        ctx.runtime.state = next;
        ctx.runtime.state_elapsed_ms = 0;
        ctx.transitions.push((from, next)).ok();

        if let Some(enter) = self.row(next).on_enter {
            enter(ctx);
        }
    }
}
