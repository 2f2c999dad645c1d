//! Sensor subsystem: the ADP910 driver, the two-channel [`SensorHub`] and
//! the [`MetricsService`] that fuses both channels into one snapshot.
//!
//! ```text
//!  fan ADP910 ──┐                 ┌──────────────────┐
//!               ├─▶ SensorHub ──▶ │ MetricsAggregator │──▶ MetricsSnapshot
//!  env ADP910 ──┘   (no lock)     │   (behind Mutex)  │     (copy-out)
//!                                 └──────────────────┘
//! ```
//!
//! Bus traffic happens in the hub, outside any service lock.  The aggregator
//! only ever sees finished samples.

pub mod adp910;
pub mod models;

use std::sync::{Mutex, PoisonError};

use embedded_hal::delay::DelayNs;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::SensorBus;
use crate::config::SensorConfig;
use crate::error::Error;
use adp910::Adp910;
use models::MetricsModel;

/// One decoded sensor reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureSample {
    pub differential_pressure_pa: f32,
    /// Differential pressure minus the driver's stored zero offset.
    pub corrected_pressure_pa: f32,
    pub temperature_c: f32,
}

/// Point-in-time copy of both channels plus derived quantities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub fan_pressure_pa: f32,
    pub fan_temperature_c: f32,
    pub envelope_pressure_pa: f32,
    pub envelope_temperature_c: f32,
    pub fan_speed_units: f32,
    pub estimated_air_leakage_units: f32,
    pub fan_sample_valid: bool,
    pub envelope_sample_valid: bool,
    pub update_sequence: u32,
    pub last_update_tick_ms: u32,
}

// ═══════════════════════════════════════════════════════════════════════════
//  Metrics aggregation
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default)]
struct ChannelZero {
    last_raw_pa: f32,
    has_raw: bool,
    offset_pa: f32,
}

impl ChannelZero {
    /// Apply a sample; returns the offset-corrected pressure.
    fn accept(&mut self, sample: &PressureSample) -> f32 {
        self.last_raw_pa = sample.corrected_pressure_pa;
        self.has_raw = true;
        sample.corrected_pressure_pa - self.offset_pa
    }
}

/// Fuses the fan and envelope channels.  Not synchronised; wrap it in
/// [`MetricsService`] to share it between tasks.
pub struct MetricsAggregator<M> {
    snapshot: MetricsSnapshot,
    fan: ChannelZero,
    envelope: ChannelZero,
    model: M,
}

impl<M: MetricsModel> MetricsAggregator<M> {
    pub fn new(model: M) -> Self {
        Self {
            snapshot: MetricsSnapshot::default(),
            fan: ChannelZero::default(),
            envelope: ChannelZero::default(),
            model,
        }
    }

    /// Fold in one poll cycle.  A missing sample keeps the stale value but
    /// clears its valid flag.  The sequence advances on every call.
    pub fn update(
        &mut self,
        fan: Option<PressureSample>,
        envelope: Option<PressureSample>,
        now_ms: u32,
    ) {
        let snap = &mut self.snapshot;

        match fan {
            Some(s) => {
                snap.fan_pressure_pa = self.fan.accept(&s);
                snap.fan_temperature_c = s.temperature_c;
                snap.fan_sample_valid = true;
            }
            None => snap.fan_sample_valid = false,
        }

        match envelope {
            Some(s) => {
                snap.envelope_pressure_pa = self.envelope.accept(&s);
                snap.envelope_temperature_c = s.temperature_c;
                snap.envelope_sample_valid = true;
            }
            None => snap.envelope_sample_valid = false,
        }

        self.recompute_derived();
        self.snapshot.update_sequence = self.snapshot.update_sequence.wrapping_add(1);
        self.snapshot.last_update_tick_ms = now_ms;
    }

    /// Take the last valid raw reading of each channel as its new zero.
    /// Returns `true` if at least one channel was anchored.
    pub fn capture_zero_offsets(&mut self) -> bool {
        let mut captured = false;

        if self.snapshot.fan_sample_valid && self.fan.has_raw {
            self.fan.offset_pa = self.fan.last_raw_pa;
            self.snapshot.fan_pressure_pa = 0.0;
            captured = true;
        }
        if self.snapshot.envelope_sample_valid && self.envelope.has_raw {
            self.envelope.offset_pa = self.envelope.last_raw_pa;
            self.snapshot.envelope_pressure_pa = 0.0;
            captured = true;
        }

        if captured {
            self.recompute_derived();
            self.snapshot.update_sequence = self.snapshot.update_sequence.wrapping_add(1);
        }
        captured
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot
    }

    /// Current (fan, envelope) zero offsets.
    pub fn offsets(&self) -> (f32, f32) {
        (self.fan.offset_pa, self.envelope.offset_pa)
    }

    fn recompute_derived(&mut self) {
        let speed = self.model.fan_speed(self.snapshot.fan_pressure_pa);
        self.snapshot.fan_speed_units = speed;
        self.snapshot.estimated_air_leakage_units = self
            .model
            .air_leakage(speed, self.snapshot.envelope_pressure_pa);
    }
}

/// Process-wide metrics instance: one mutex, copy-in/copy-out only.
pub struct MetricsService<M> {
    inner: Mutex<MetricsAggregator<M>>,
}

impl<M: MetricsModel> MetricsService<M> {
    pub fn new(model: M) -> Self {
        Self {
            inner: Mutex::new(MetricsAggregator::new(model)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsAggregator<M>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update(&self, fan: Option<PressureSample>, envelope: Option<PressureSample>, now_ms: u32) {
        self.lock().update(fan, envelope, now_ms);
    }

    pub fn capture_zero_offsets(&self) -> bool {
        self.lock().capture_zero_offsets()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().snapshot()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Sensor hub
// ═══════════════════════════════════════════════════════════════════════════

/// One sensor plus its readiness and re-initialisation backoff.
struct SensorChannel<B, D> {
    label: &'static str,
    driver: Adp910<B, D>,
    ready: bool,
    retry_at_ms: Option<u32>,
}

impl<B: SensorBus, D: DelayNs> SensorChannel<B, D> {
    fn poll(&mut self, now_ms: u32, retry_ms: u32) -> Option<PressureSample> {
        if !self.ready && self.init_due(now_ms) {
            match self.driver.initialize() {
                Ok(()) => {
                    info!("SENSOR | {} ready", self.label);
                    self.ready = true;
                    self.retry_at_ms = None;
                }
                Err(e) => {
                    warn!("SENSOR | {} init failed: {}", self.label, e);
                    self.retry_at_ms = Some(now_ms.wrapping_add(retry_ms));
                }
            }
        }

        if !self.ready {
            return None;
        }

        match self.driver.read_sample() {
            Ok(sample) => Some(sample),
            Err(e @ (Error::Bus(_) | Error::NotReady)) => {
                warn!("SENSOR | {} lost: {}", self.label, e);
                self.ready = false;
                None
            }
            Err(_) => None,
        }
    }

    fn init_due(&self, now_ms: u32) -> bool {
        // Signed distance keeps the comparison valid across tick wrap.
        self.retry_at_ms
            .is_none_or(|at| now_ms.wrapping_sub(at) as i32 >= 0)
    }
}

/// Owns both ADP910 drivers.  Runs in the sensor task, never under a lock.
pub struct SensorHub<B, D> {
    fan: SensorChannel<B, D>,
    envelope: SensorChannel<B, D>,
    init_retry_ms: u32,
}

impl<B: SensorBus, D: DelayNs> SensorHub<B, D> {
    pub fn new(fan: Adp910<B, D>, envelope: Adp910<B, D>, config: &SensorConfig) -> Self {
        Self {
            fan: SensorChannel {
                label: "fan",
                driver: fan,
                ready: false,
                retry_at_ms: None,
            },
            envelope: SensorChannel {
                label: "envelope",
                driver: envelope,
                ready: false,
                retry_at_ms: None,
            },
            init_retry_ms: config.init_retry_ms,
        }
    }

    /// One poll cycle: (re)initialise channels whose backoff expired, then
    /// read every ready channel.  Returns `(fan, envelope)`.
    pub fn poll(&mut self, now_ms: u32) -> (Option<PressureSample>, Option<PressureSample>) {
        let fan = self.fan.poll(now_ms, self.init_retry_ms);
        let envelope = self.envelope.poll(now_ms, self.init_retry_ms);
        (fan, envelope)
    }

    /// `(fan, envelope)` readiness.
    pub fn ready(&self) -> (bool, bool) {
        (self.fan.ready, self.envelope.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::i2c::SimulatedBus;
    use models::LinearModel;

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn sample(p: f32, t: f32) -> PressureSample {
        PressureSample {
            differential_pressure_pa: p,
            corrected_pressure_pa: p,
            temperature_c: t,
        }
    }

    #[test]
    fn sequence_advances_even_without_samples() {
        let mut agg = MetricsAggregator::new(LinearModel::default());
        agg.update(None, None, 10);
        agg.update(None, None, 20);
        let s = agg.snapshot();
        assert_eq!(s.update_sequence, 2);
        assert_eq!(s.last_update_tick_ms, 20);
        assert!(!s.fan_sample_valid && !s.envelope_sample_valid);
    }

    #[test]
    fn invalid_sample_keeps_stale_value() {
        let mut agg = MetricsAggregator::new(LinearModel::default());
        agg.update(Some(sample(12.0, 20.0)), Some(sample(-40.0, 18.0)), 0);
        agg.update(None, Some(sample(-41.0, 18.0)), 100);
        let s = agg.snapshot();
        assert!(!s.fan_sample_valid);
        assert_eq!(s.fan_pressure_pa, 12.0);
        assert!(s.envelope_sample_valid);
        assert_eq!(s.envelope_pressure_pa, -41.0);
        assert_eq!(s.fan_speed_units, 12.0);
        assert_eq!(s.estimated_air_leakage_units, 12.0 * 41.0);
    }

    #[test]
    fn capture_zero_anchors_valid_channels() {
        let mut agg = MetricsAggregator::new(LinearModel::default());
        assert!(!agg.capture_zero_offsets());

        agg.update(Some(sample(1.5, 20.0)), None, 0);
        let seq = agg.snapshot().update_sequence;
        assert!(agg.capture_zero_offsets());
        assert_eq!(agg.offsets(), (1.5, 0.0));
        let s = agg.snapshot();
        assert_eq!(s.fan_pressure_pa, 0.0);
        assert_eq!(s.update_sequence, seq + 1);

        agg.update(Some(sample(11.5, 20.0)), None, 100);
        assert_eq!(agg.snapshot().fan_pressure_pa, 10.0);
    }

    #[test]
    fn service_copies_out() {
        let svc = MetricsService::new(LinearModel::default());
        svc.update(Some(sample(3.0, 20.0)), Some(sample(2.0, 21.0)), 5);
        let mut snap = svc.snapshot();
        snap.fan_pressure_pa = 99.0;
        assert_eq!(svc.snapshot().fan_pressure_pa, 3.0);
    }

    fn hub(fan: &SimulatedBus, env: &SimulatedBus) -> SensorHub<SimulatedBus, NoDelay> {
        let cfg = SensorConfig::default();
        SensorHub::new(
            Adp910::new(fan.clone(), NoDelay, cfg.fan),
            Adp910::new(env.clone(), NoDelay, cfg.envelope),
            &cfg,
        )
    }

    #[test]
    fn hub_reads_both_channels() {
        let fan = SimulatedBus::new(120.0, 22.0);
        let env = SimulatedBus::new(-50.0, 21.0);
        let mut hub = hub(&fan, &env);
        let (f, e) = hub.poll(0);
        assert!((f.unwrap().differential_pressure_pa - 120.0).abs() < 0.02);
        assert!((e.unwrap().differential_pressure_pa + 50.0).abs() < 0.02);
        assert_eq!(hub.ready(), (true, true));
    }

    #[test]
    fn failed_init_backs_off() {
        let fan = SimulatedBus::new(120.0, 22.0);
        let env = SimulatedBus::new(-50.0, 21.0);
        env.fail_next(4);
        let mut hub = hub(&fan, &env);

        let (_, e) = hub.poll(0);
        assert!(e.is_none());
        assert_eq!(hub.ready(), (true, false));

        // Within the backoff window no new attempt is made.
        let recoveries = env.recoveries();
        let (_, e) = hub.poll(500);
        assert!(e.is_none());
        assert_eq!(env.recoveries(), recoveries);

        let (_, e) = hub.poll(1_000);
        assert!(e.is_some());
    }

    #[test]
    fn bus_error_drops_readiness_crc_error_does_not() {
        let fan = SimulatedBus::new(120.0, 22.0);
        let env = SimulatedBus::new(-50.0, 21.0);
        let mut hub = hub(&fan, &env);
        hub.poll(0);

        fan.corrupt_next_frame();
        let (f, _) = hub.poll(100);
        assert!(f.is_none());
        assert!(hub.ready().0);

        fan.fail_next(4);
        let (f, _) = hub.poll(200);
        assert!(f.is_none());
        assert!(!hub.ready().0);

        // Re-initialised on the next cycle.
        let (f, _) = hub.poll(300);
        assert!(f.is_some());
    }
}
