//! Mock hardware for integration tests.
//!
//! A [`Rig`] is a full [`BlowerService`] wired to two simulated ADP910
//! buses and RAM flash.  Tests keep the bus handles to script pressures and
//! inject faults, and read back every emitted event from the recording sink.

use std::sync::{Arc, Mutex, PoisonError};

use blowerdoor::adapters::flash::MemFlash;
use blowerdoor::adapters::i2c::SimulatedBus;
use blowerdoor::app::events::AppEvent;
use blowerdoor::app::ports::{EventSink, FlashRegion};
use blowerdoor::app::service::BlowerService;
use blowerdoor::config::{SystemConfig, TestConfig};
use blowerdoor::drivers::dimmer::{DutyCell, LineStatus};
use blowerdoor::error::FlashError;
use blowerdoor::fsm::TestState;
use blowerdoor::sensors::SensorHub;
use blowerdoor::sensors::adp910::Adp910;
use embedded_hal::delay::DelayNs;

// ── Delay ─────────────────────────────────────────────────────

/// Delay that returns immediately.
pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

// ── Shared flash ──────────────────────────────────────────────

/// [`MemFlash`] behind a shared handle, so a test can inspect or damage
/// the region after handing a clone to the service.
#[derive(Debug, Clone, Default)]
pub struct SharedFlash(Arc<Mutex<MemFlash>>);

#[allow(dead_code)]
impl SharedFlash {
    pub fn new(flash: MemFlash) -> Self {
        Self(Arc::new(Mutex::new(flash)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MemFlash) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Independent copy of the current contents.
    pub fn snapshot(&self) -> MemFlash {
        self.with(|f| f.clone())
    }
}

impl FlashRegion for SharedFlash {
    fn len(&self) -> usize {
        self.with(|f| f.len())
    }

    fn erase_size(&self) -> usize {
        self.with(|f| f.erase_size())
    }

    fn page_size(&self) -> usize {
        self.with(|f| f.page_size())
    }

    fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError> {
        self.with(|f| f.erase(offset, len))
    }

    fn program(&mut self, offset: usize, bytes: &[u8]) -> Result<(), FlashError> {
        self.with(|f| f.program(offset, bytes))
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        self.with(|f| f.read(offset, buf))
    }
}

// ── Event recorder ────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<AppEvent>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(from, to)` test state change, in order.
    pub fn transitions(&self) -> Vec<(TestState, TestState)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                AppEvent::TestStateChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&AppEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &AppEvent) {
        self.events.push(event.clone());
    }
}

// ── Rig ───────────────────────────────────────────────────────

pub const TICK_MS: u32 = 100;
/// Fan ring pressure per pascal of envelope pressure.
pub const FAN_RATIO: f32 = 3.0;

pub struct Rig {
    pub service: BlowerService<SharedFlash>,
    pub flash: SharedFlash,
    pub hub: SensorHub<SimulatedBus, NoDelay>,
    pub fan_bus: SimulatedBus,
    pub envelope_bus: SimulatedBus,
    pub duty: &'static DutyCell,
    pub sink: RecordingSink,
    pub now_ms: u32,
}

#[allow(dead_code)]
impl Rig {
    pub fn new() -> Self {
        Self::with_flash(SharedFlash::default())
    }

    /// A rig booting from `flash`.  The rig keeps its own handle.
    pub fn with_flash(flash: SharedFlash) -> Self {
        let config = SystemConfig::default();
        let duty: &'static DutyCell = Box::leak(Box::new(DutyCell::new()));
        let fan_bus = SimulatedBus::new(0.0, 21.0);
        let envelope_bus = SimulatedBus::new(0.0, 19.0);
        let hub = SensorHub::new(
            Adp910::new(fan_bus.clone(), NoDelay, config.sensors.fan),
            Adp910::new(envelope_bus.clone(), NoDelay, config.sensors.envelope),
            &config.sensors,
        );
        let service = BlowerService::new(config, flash.clone(), duty);
        let mut sink = RecordingSink::new();
        service.start(&mut sink);
        Self {
            service,
            flash,
            hub,
            fan_bus,
            envelope_bus,
            duty,
            sink,
            now_ms: 0,
        }
    }

    /// Install `points` with ISO rules off and the shortest timings.
    pub fn quick_config(points: &[f32]) -> TestConfig {
        let mut cfg = TestConfig::default();
        cfg.enforce_iso_9972_rules = false;
        cfg.settle_time_s = 2;
        cfg.measure_time_s = 2;
        cfg.set_points(points).expect("points fit");
        cfg
    }

    /// Set the envelope reading and a proportional fan reading.
    pub fn set_envelope(&self, pressure_pa: f32) {
        self.envelope_bus.set_reading(pressure_pa, 19.0);
        self.fan_bus.set_reading(pressure_pa * FAN_RATIO, 21.0);
    }

    /// One pass of every task loop.
    pub fn tick(&mut self) {
        self.now_ms += TICK_MS;
        let line = LineStatus {
            sync: true,
            frequency_hz: 50.0,
        };
        self.service.sensor_tick(&mut self.hub, self.now_ms);
        self.service.control_tick(line, self.now_ms);
        self.service.test_tick(self.now_ms, &mut self.sink);
    }

    /// Tick with the envelope tracking the sequencer's target until the
    /// test stops running or `max_ticks` elapse.
    pub fn run_tracking(&mut self, max_ticks: u32) {
        for _ in 0..max_ticks {
            let target = self.service.test_runtime().current_target_pressure_pa;
            self.set_envelope(target);
            self.tick();
            if !self.service.test_state().is_running() {
                return;
            }
        }
    }
}
