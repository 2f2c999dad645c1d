//! Zero-cross phase-angle dimmer for the blower motor.
//!
//! ```text
//!   mains  ╱╲    ╱╲        zero-cross opto ─▶ GPIO posedge ISR (core 1)
//!         ╱  ╲  ╱  ╲                             │
//!   ─────╱────╲╱────╲──                          ▼
//!        ↑ zc   ↑ zc          ZeroCrossDetector::on_edge(now, duty)
//!        │◀ delay ▶│gate            │
//!                                   ├─ Off      → gate low, alarm disarmed
//!                                   ├─ FireNow  → gate pulse in the ISR
//!                                   └─ Arm{d}   → one-shot alarm at zc + d
//!                                                     │
//!                                         timer ISR ─▶ gate pulse (busy-wait)
//! ```
//!
//! The only state crossing from the control task (core 0) into the ISRs
//! (core 1) is [`DIMMER_DUTY`], a relaxed atomic byte.  The detector's own
//! bookkeeping is atomics too, so the line-status reader on core 0 never
//! takes a lock the ISR could contend on.
//!
//! Nothing in the interrupt path allocates, blocks or logs.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use crate::config::DimmerTiming;

/// Above this the detector is seeing both edges of each cycle.
const DOUBLE_EDGE_THRESHOLD_HZ: f32 = 70.0;

// ───────────────────────────────────────────────────────────────
// Duty cell
// ───────────────────────────────────────────────────────────────

/// Commanded conduction percentage, 0..=100.
pub struct DutyCell(AtomicU8);

impl DutyCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Store `percent`, clamped to 100.
    pub fn set(&self, percent: u8) {
        self.0.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for DutyCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Written by the control loop, read by the zero-cross ISR.
pub static DIMMER_DUTY: DutyCell = DutyCell::new();

// ───────────────────────────────────────────────────────────────
// Phase computation
// ───────────────────────────────────────────────────────────────

/// Delay from zero-cross to gate pulse for `percent` conduction, limited so
/// the pulse still ends inside the half cycle.
pub fn phase_delay_us(timing: &DimmerTiming, percent: u8) -> u32 {
    let percent = u32::from(percent.min(100));
    let max_delay = timing
        .half_cycle_us
        .saturating_sub(timing.gate_pulse_us)
        .saturating_sub(1);
    let delay = (u64::from(timing.half_cycle_us) * u64::from(100 - percent) / 100) as u32;
    delay.min(max_delay)
}

/// What the zero-cross ISR must do with the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    /// Edge fell inside the debounce window.
    Ignored,
    /// 0 %: gate low, pending alarm cancelled.
    Off,
    /// 100 %: pulse now, pending alarm cancelled.
    FireNow,
    /// Pulse after `delay_us`.
    Arm { delay_us: u32 },
}

/// AC line state derived from zero-cross timing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LineStatus {
    pub sync: bool,
    pub frequency_hz: f32,
}

// ───────────────────────────────────────────────────────────────
// Zero-cross detector
// ───────────────────────────────────────────────────────────────

/// Debounce and scheduling decision for zero-cross edges.
///
/// Timestamps are 32-bit microseconds and compared with wrapping arithmetic.
/// The ESP32-S3 has no 64-bit atomics.
pub struct ZeroCrossDetector {
    timing: DimmerTiming,
    last_edge_us: AtomicU32,
    has_edge: AtomicBool,
    period_us: AtomicU32,
}

impl ZeroCrossDetector {
    pub const fn new(timing: DimmerTiming) -> Self {
        Self {
            timing,
            last_edge_us: AtomicU32::new(0),
            has_edge: AtomicBool::new(false),
            period_us: AtomicU32::new(0),
        }
    }

    pub fn timing(&self) -> &DimmerTiming {
        &self.timing
    }

    /// Handle one rising edge at `now_us` with the current duty.
    pub fn on_edge(&self, now_us: u32, percent: u8) -> GateAction {
        if self.has_edge.load(Ordering::Relaxed) {
            let last = self.last_edge_us.load(Ordering::Relaxed);
            let since = now_us.wrapping_sub(last);
            if since < self.timing.debounce_us {
                return GateAction::Ignored;
            }
            self.period_us.store(since, Ordering::Relaxed);
        }
        self.last_edge_us.store(now_us, Ordering::Relaxed);
        self.has_edge.store(true, Ordering::Release);

        match percent {
            0 => GateAction::Off,
            p if p >= 100 => GateAction::FireNow,
            p => GateAction::Arm {
                delay_us: phase_delay_us(&self.timing, p),
            },
        }
    }

    /// Line sync holds while the last accepted edge is at most `timeout_us`
    /// old.  Frequency is 0 without sync or before two edges were seen.
    pub fn line_status(&self, now_us: u32, timeout_us: u32) -> LineStatus {
        if !self.has_edge.load(Ordering::Acquire) {
            return LineStatus::default();
        }
        let last = self.last_edge_us.load(Ordering::Relaxed);
        let period = self.period_us.load(Ordering::Relaxed);
        let sync = now_us.wrapping_sub(last) <= timeout_us;

        let mut frequency_hz = 0.0;
        if sync && period > 0 {
            frequency_hz = 1_000_000.0 / period as f32;
            if frequency_hz > DOUBLE_EDGE_THRESHOLD_HZ {
                frequency_hz *= 0.5;
            }
        }
        LineStatus { sync, frequency_hz }
    }

    /// Forget all edges (gate task restart).
    pub fn reset(&self) {
        self.has_edge.store(false, Ordering::Relaxed);
        self.period_us.store(0, Ordering::Relaxed);
        self.last_edge_us.store(0, Ordering::Relaxed);
    }
}

/// The board's detector, shared between the ISRs and the control task.
pub static ZERO_CROSS: ZeroCrossDetector = ZeroCrossDetector::new(DimmerTiming::MAINS_50HZ);

// ═══════════════════════════════════════════════════════════════════════════
//  ESP-IDF interrupt glue
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(target_os = "espidf")]
pub use idf::{install, line_status_now};

#[cfg(target_os = "espidf")]
mod idf {
    use core::ffi::c_void;
    use core::ptr;
    use core::sync::atomic::{AtomicPtr, Ordering};

    use esp_idf_svc::sys;
    use log::info;

    use super::{DIMMER_DUTY, GateAction, LineStatus, ZERO_CROSS};
    use crate::error::{Error, Result};
    use crate::pins;

    const OK: sys::esp_err_t = sys::ESP_OK as sys::esp_err_t;
    const ERR_INVALID_STATE: sys::esp_err_t = sys::ESP_ERR_INVALID_STATE as sys::esp_err_t;
    const TIMER_RESOLUTION_HZ: u32 = 1_000_000;

    static GATE_TIMER: AtomicPtr<sys::gptimer_t> = AtomicPtr::new(ptr::null_mut());

    fn check(err: sys::esp_err_t, what: &'static str) -> Result<()> {
        if err == OK {
            Ok(())
        } else {
            log::error!("DIMMER | {} failed: {}", what, err);
            Err(Error::InvalidState(what))
        }
    }

    #[inline(always)]
    fn now_us() -> u32 {
        // SAFETY: esp_timer is running from boot and the call is ISR-safe.
        unsafe { sys::esp_timer_get_time() as u32 }
    }

    /// Gate high for the pulse width, then low.  Busy-waits: this runs in
    /// interrupt context where yielding is not possible.
    #[inline(always)]
    fn fire_gate_pulse() {
        let width = ZERO_CROSS.timing().gate_pulse_us;
        // SAFETY: gate pin configured as output in `install`.
        unsafe { sys::gpio_set_level(i32::from(pins::GATE_GPIO), 1) };
        let start = now_us();
        while now_us().wrapping_sub(start) < width {
            core::hint::spin_loop();
        }
        // SAFETY: as above.
        unsafe { sys::gpio_set_level(i32::from(pins::GATE_GPIO), 0) };
    }

    fn disarm(timer: sys::gptimer_handle_t) {
        // SAFETY: null alarm config disables the alarm; ISR-safe.
        unsafe { sys::gptimer_set_alarm_action(timer, ptr::null()) };
    }

    unsafe extern "C" fn zero_cross_isr(_arg: *mut c_void) {
        let timer = GATE_TIMER.load(Ordering::Relaxed);
        match ZERO_CROSS.on_edge(now_us(), DIMMER_DUTY.get()) {
            GateAction::Ignored => {}
            GateAction::Off => {
                // SAFETY: gate pin is an output.
                unsafe { sys::gpio_set_level(i32::from(pins::GATE_GPIO), 0) };
                disarm(timer);
            }
            GateAction::FireNow => {
                disarm(timer);
                fire_gate_pulse();
            }
            GateAction::Arm { delay_us } => {
                let alarm = sys::gptimer_alarm_config_t {
                    alarm_count: u64::from(delay_us.max(1)),
                    reload_count: 0,
                    ..Default::default()
                };
                // SAFETY: timer handle is valid once published; both calls
                // are ISR-safe and `alarm` is copied.
                unsafe {
                    sys::gptimer_set_raw_count(timer, 0);
                    sys::gptimer_set_alarm_action(timer, &alarm);
                }
            }
        }
    }

    unsafe extern "C" fn gate_alarm_isr(
        timer: sys::gptimer_handle_t,
        _edata: *const sys::gptimer_alarm_event_data_t,
        _ctx: *mut c_void,
    ) -> bool {
        disarm(timer);
        fire_gate_pulse();
        false
    }

    /// Configure the gate output, the one-shot gate timer and the zero-cross
    /// interrupt.  Call from a task pinned to core 1: both interrupts are
    /// allocated on the calling core.
    pub fn install() -> Result<()> {
        if !GATE_TIMER.load(Ordering::Acquire).is_null() {
            return Err(Error::InvalidState("dimmer already installed"));
        }
        DIMMER_DUTY.set(0);
        ZERO_CROSS.reset();

        let gate = i32::from(pins::GATE_GPIO);
        let zc = i32::from(pins::ZC_GPIO);

        // SAFETY: plain driver configuration with structs that outlive each
        // call; the ISR handlers are 'static functions.
        unsafe {
            let gate_cfg = sys::gpio_config_t {
                pin_bit_mask: 1u64 << gate,
                mode: sys::gpio_mode_t_GPIO_MODE_OUTPUT,
                pull_up_en: sys::gpio_pullup_t_GPIO_PULLUP_DISABLE,
                pull_down_en: sys::gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
                intr_type: sys::gpio_int_type_t_GPIO_INTR_DISABLE,
                ..Default::default()
            };
            check(sys::gpio_config(&gate_cfg), "gate gpio config")?;
            sys::gpio_set_level(gate, 0);

            let mut timer: sys::gptimer_handle_t = ptr::null_mut();
            let timer_cfg = sys::gptimer_config_t {
                clk_src: sys::soc_periph_gptimer_clk_src_t_GPTIMER_CLK_SRC_DEFAULT,
                direction: sys::gptimer_count_direction_t_GPTIMER_COUNT_UP,
                resolution_hz: TIMER_RESOLUTION_HZ,
                ..Default::default()
            };
            check(sys::gptimer_new_timer(&timer_cfg, &mut timer), "gptimer new")?;
            let callbacks = sys::gptimer_event_callbacks_t {
                on_alarm: Some(gate_alarm_isr),
            };
            check(
                sys::gptimer_register_event_callbacks(timer, &callbacks, ptr::null_mut()),
                "gptimer callbacks",
            )?;
            check(sys::gptimer_enable(timer), "gptimer enable")?;
            check(sys::gptimer_start(timer), "gptimer start")?;
            GATE_TIMER.store(timer, Ordering::Release);

            let zc_cfg = sys::gpio_config_t {
                pin_bit_mask: 1u64 << zc,
                mode: sys::gpio_mode_t_GPIO_MODE_INPUT,
                pull_up_en: sys::gpio_pullup_t_GPIO_PULLUP_ENABLE,
                pull_down_en: sys::gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
                intr_type: sys::gpio_int_type_t_GPIO_INTR_POSEDGE,
                ..Default::default()
            };
            check(sys::gpio_config(&zc_cfg), "zero-cross gpio config")?;

            // Already installed by another driver is fine.
            let err = sys::gpio_install_isr_service(0);
            if err != OK && err != ERR_INVALID_STATE {
                check(err, "gpio isr service")?;
            }
            check(
                sys::gpio_isr_handler_add(zc, Some(zero_cross_isr), ptr::null_mut()),
                "zero-cross isr",
            )?;
        }

        // SAFETY: reading the current core id has no side effects.
        let core = unsafe { sys::xPortGetCoreID() };
        info!(
            "DIMMER | installed on core {} (zc=GPIO{}, gate=GPIO{})",
            core,
            pins::ZC_GPIO,
            pins::GATE_GPIO
        );
        Ok(())
    }

    /// Line status against the free-running µs clock.
    pub fn line_status_now(timeout_us: u32) -> LineStatus {
        ZERO_CROSS.line_status(now_us(), timeout_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: DimmerTiming = DimmerTiming::MAINS_50HZ;

    #[test]
    fn delay_endpoints() {
        assert_eq!(phase_delay_us(&T, 100), 0);
        assert_eq!(phase_delay_us(&T, 50), 5_000);
        // 1 % would be 9900 µs; limited so the 100 µs pulse fits.
        assert_eq!(phase_delay_us(&T, 1), 9_899);
        assert_eq!(phase_delay_us(&T, 0), 9_899);
    }

    #[test]
    fn duty_cell_clamps() {
        let cell = DutyCell::new();
        cell.set(250);
        assert_eq!(cell.get(), 100);
        cell.set(37);
        assert_eq!(cell.get(), 37);
    }

    #[test]
    fn zero_and_full_never_arm() {
        let zc = ZeroCrossDetector::new(T);
        assert_eq!(zc.on_edge(0, 0), GateAction::Off);
        assert_eq!(zc.on_edge(10_000, 100), GateAction::FireNow);
        assert_eq!(zc.on_edge(20_000, 40), GateAction::Arm { delay_us: 6_000 });
    }

    #[test]
    fn bounce_inside_window_is_ignored() {
        let zc = ZeroCrossDetector::new(T);
        assert_ne!(zc.on_edge(1_000, 50), GateAction::Ignored);
        assert_eq!(zc.on_edge(1_400, 50), GateAction::Ignored);
        assert_eq!(zc.on_edge(2_499, 50), GateAction::Ignored);
        assert_ne!(zc.on_edge(2_500, 50), GateAction::Ignored);
    }

    #[test]
    fn debounce_survives_timer_wrap() {
        let zc = ZeroCrossDetector::new(T);
        zc.on_edge(u32::MAX - 200, 50);
        assert_eq!(zc.on_edge(300, 50), GateAction::Ignored);
        assert_ne!(zc.on_edge(9_799, 50), GateAction::Ignored);
    }

    #[test]
    fn line_status_from_half_cycle_edges() {
        let zc = ZeroCrossDetector::new(T);
        assert_eq!(zc.line_status(0, 100_000), LineStatus::default());

        zc.on_edge(0, 0);
        let s = zc.line_status(5_000, 100_000);
        assert!(s.sync);
        assert_eq!(s.frequency_hz, 0.0);

        // Edges every 10 ms → 100 Hz raw, reported as 50 Hz.
        zc.on_edge(10_000, 0);
        let s = zc.line_status(12_000, 100_000);
        assert!(s.sync);
        assert!((s.frequency_hz - 50.0).abs() < 1e-3);

        // One edge per full cycle at 60 Hz stays as is.
        zc.on_edge(10_000 + 16_667, 0);
        let s = zc.line_status(30_000, 100_000);
        assert!((s.frequency_hz - 60.0).abs() < 0.01);

        let s = zc.line_status(10_000 + 16_667 + 100_001, 100_000);
        assert!(!s.sync);
        assert_eq!(s.frequency_hz, 0.0);
    }
}
