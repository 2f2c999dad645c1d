//! Monotonic clock adapter.
//!
//! - **`target_os = "espidf"`**: wraps `esp_timer_get_time()` (µs since
//!   boot, monotonic).
//! - **`not(target_os = "espidf")`**: uses `std::time::Instant` for host
//!   tests and simulation.
//!
//! Service timestamps are wrapping `u32` milliseconds; every consumer
//! compares them with `wrapping_sub`.

pub struct MonotonicClock {
    #[cfg(not(target_os = "espidf"))]
    start: std::time::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            start: std::time::Instant::now(),
        }
    }

    /// Microseconds since boot.
    #[cfg(target_os = "espidf")]
    pub fn now_us(&self) -> u64 {
        // SAFETY: esp_timer_get_time has no preconditions after boot.
        (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64
    }

    /// Microseconds since construction.
    #[cfg(not(target_os = "espidf"))]
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Milliseconds, wrapping every ~49.7 days.
    pub fn now_ms(&self) -> u32 {
        (self.now_us() / 1000) as u32
    }
}
