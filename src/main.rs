//! Blower-door tester firmware: main entry point.
//!
//! ```text
//! ┌──────────────────────────── core 0 ────────────────────────────┐
//! │  sensor task ──▶ MetricsService                                │
//! │  control task ─▶ ControlService ──▶ DIMMER_DUTY (atomic) ──────┼──┐
//! │  main thread ──▶ TestService ──▶ PartitionFlash                │  │
//! └────────────────────────────────────────────────────────────────┘  │
//! ┌──────────────────────────── core 1 ────────────────────────────┐  │
//! │  zero-cross GPIO ISR ──▶ gate gptimer alarm ISR ◀──────────────┼──┘
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use std::thread;
use std::time::Duration;

use anyhow::Result;
use esp_idf_hal::delay::Delay;
use log::{error, info};

use blowerdoor::adapters::flash::PartitionFlash;
use blowerdoor::adapters::i2c::IdfI2cBus;
use blowerdoor::adapters::log_sink::LogEventSink;
use blowerdoor::adapters::time::MonotonicClock;
use blowerdoor::app::service::BlowerService;
use blowerdoor::config::SystemConfig;
use blowerdoor::drivers::dimmer::{self, DIMMER_DUTY};
use blowerdoor::drivers::task_pin::{Core, spawn_on_core};
use blowerdoor::sensors::SensorHub;
use blowerdoor::sensors::adp910::Adp910;

const DIMMER_TASK_PRIORITY: u8 = 20;
const CONTROL_TASK_PRIORITY: u8 = 6;
const SENSOR_TASK_PRIORITY: u8 = 5;

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  Blowerdoor v{}                      ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    let config = SystemConfig::default();
    let clock = MonotonicClock::new();

    // ── 2. Services (loads the persisted test state) ──────────
    let service: &'static BlowerService<PartitionFlash> = Box::leak(Box::new(BlowerService::new(
        config.clone(),
        PartitionFlash::open(),
        &DIMMER_DUTY,
    )));
    let mut sink = LogEventSink::new();
    service.start(&mut sink);

    // ── 3. Dimmer interrupts on core 1 ────────────────────────
    let installer = spawn_on_core(Core::App, DIMMER_TASK_PRIORITY, 4, "dimmer\0", dimmer::install)?;
    match installer.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("DIMMER | install failed: {} (output stays off)", e),
        Err(_) => error!("DIMMER | installer panicked (output stays off)"),
    }

    // ── 4. Sensor task on core 0 ──────────────────────────────
    let sensors = config.sensors;
    let fan = Adp910::new(IdfI2cBus::new(sensors.fan)?, Delay::new_default(), sensors.fan);
    let envelope = Adp910::new(
        IdfI2cBus::new(sensors.envelope)?,
        Delay::new_default(),
        sensors.envelope,
    );
    let mut hub = SensorHub::new(fan, envelope, &sensors);
    spawn_on_core(Core::Pro, SENSOR_TASK_PRIORITY, 6, "sensor\0", move || {
        let clock = MonotonicClock::new();
        let period = Duration::from_millis(u64::from(sensors.sample_period_ms));
        loop {
            service.sensor_tick(&mut hub, clock.now_ms());
            thread::sleep(period);
        }
    })?;

    // ── 5. Control task on core 0 ─────────────────────────────
    let tuning = config.control;
    spawn_on_core(Core::Pro, CONTROL_TASK_PRIORITY, 4, "control\0", move || {
        let clock = MonotonicClock::new();
        let period = Duration::from_millis(u64::from(tuning.loop_period_ms));
        loop {
            let line = dimmer::line_status_now(tuning.line_sync_timeout_us);
            service.control_tick(line, clock.now_ms());
            thread::sleep(period);
        }
    })?;

    // ── 6. Test sequencer on the main thread ──────────────────
    info!("System ready. Entering test loop.");
    let period = Duration::from_millis(u64::from(config.test_period_ms));
    loop {
        service.test_tick(clock.now_ms(), &mut sink);
        thread::sleep(period);
    }
}
