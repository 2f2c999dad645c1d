//! Port traits: the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ services (domain)
//! ```
//!
//! Driven adapters (sensor bus, flash region, event sinks) and the pressure
//! controller (as seen from the test sequencer) implement these traits.  Drivers and services consume them via generics, so the domain
//! core never touches hardware directly and runs unchanged on the host.

use crate::error::{BusError, FlashError};
use crate::fsm::context::ControlRequest;

// ───────────────────────────────────────────────────────────────
// Sensor bus port (driven adapter: I2C controller)
// ───────────────────────────────────────────────────────────────

/// Blocking I2C master transfers with a per-call timeout.
///
/// Retries are the caller's job; an implementation performs exactly one
/// attempt per call.
pub trait SensorBus {
    /// Write `bytes` to the 7-bit `address`.
    fn write(&mut self, address: u8, bytes: &[u8], timeout_us: u32) -> Result<(), BusError>;

    /// Fill `buf` from the 7-bit `address`.
    fn read(&mut self, address: u8, buf: &mut [u8], timeout_us: u32) -> Result<(), BusError>;

    /// Free a stuck bus (clock out a held SDA, issue STOP) and return the
    /// controller to a usable state.
    fn recover(&mut self);
}

// ───────────────────────────────────────────────────────────────
// Flash region port (driven adapter: NOR partition)
// ───────────────────────────────────────────────────────────────

/// A fixed-size, erase-granular NOR region addressed from offset 0.
///
/// Erase sets bytes to `0xFF`; program may only clear bits.  Offsets and
/// lengths of `erase` must be multiples of [`erase_size`](Self::erase_size),
/// those of `program` multiples of [`page_size`](Self::page_size).
pub trait FlashRegion {
    fn len(&self) -> usize;
    fn erase_size(&self) -> usize;
    fn page_size(&self) -> usize;

    fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError>;
    fn program(&mut self, offset: usize, bytes: &[u8]) -> Result<(), FlashError>;
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), FlashError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ───────────────────────────────────────────────────────────────
// Controller port (driven by the test sequencer)
// ───────────────────────────────────────────────────────────────

/// Receives the sequencer's controller requests.
///
/// Called with the test lock held, so requests from consecutive sequencer
/// calls arrive in the order the sequencer issued them.  Implementations
/// must not call back into the sequencer.
pub trait ControlLink {
    fn apply(&self, request: ControlRequest);
}

/// No controller attached; requests are only recorded in the effects.
impl ControlLink for () {
    fn apply(&self, _request: ControlRequest) {}
}

/// Shared bounds/alignment check for [`FlashRegion`] implementations.
pub fn check_flash_access(
    region_len: usize,
    granule: usize,
    offset: usize,
    len: usize,
) -> Result<(), FlashError> {
    if granule == 0 || offset % granule != 0 || len % granule != 0 {
        return Err(FlashError::Misaligned);
    }
    match offset.checked_add(len) {
        Some(end) if end <= region_len => Ok(()),
        _ => Err(FlashError::OutOfBounds),
    }
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`AppEvent`](super::events::AppEvent)s
/// through this port.  Adapters decide where they go.
pub trait EventSink {
    fn emit(&mut self, event: &super::events::AppEvent);
}
