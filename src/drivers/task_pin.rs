//! Core-pinned thread spawning for the ESP32-S3.
//!
//! Wraps `esp_pthread_set_cfg()` so that `std::thread::spawn` creates a
//! FreeRTOS task pinned to one CPU core with an explicit priority and stack
//! size.  Interrupts allocated from such a task are serviced on that core,
//! which is how the dimmer ends up alone on core 1.
//!
//! `esp_pthread_set_cfg()` stores a thread-local configuration consumed by
//! the *next* `pthread_create()` of the calling thread, so the config→spawn
//! pair must not be interleaved with other thread creation.

use std::io;
use std::thread::JoinHandle;

/// CPU core identifiers for the ESP32-S3 Xtensa LX7 dual-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// Core 0 (PRO_CPU): sensor, control and test tasks.
    Pro = 0,
    /// Core 1 (APP_CPU): zero-cross and gate timer interrupts only.
    App = 1,
}

/// Spawn a thread pinned to `core`.  `name` must be NUL-terminated
/// (e.g. `"sensor\0"`).
#[cfg(target_os = "espidf")]
pub fn spawn_on_core<T: Send + 'static>(
    core: Core,
    priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() -> T + Send + 'static,
) -> io::Result<JoinHandle<T>> {
    use esp_idf_svc::sys;

    // SAFETY: `name` is 'static and NUL-terminated; the config struct is
    // copied by ESP-IDF before the call returns.
    let ret = unsafe {
        let mut cfg = sys::esp_create_default_pthread_config();
        cfg.pin_to_core = core as i32;
        cfg.prio = i32::from(priority);
        cfg.stack_size = (stack_kb * 1024) as _;
        cfg.thread_name = name.as_ptr().cast();
        sys::esp_pthread_set_cfg(&cfg)
    };
    if ret != sys::ESP_OK as sys::esp_err_t {
        return Err(io::Error::other(format!("esp_pthread_set_cfg failed: {ret}")));
    }

    let display_name = name.trim_end_matches('\0');
    log::info!(
        "Spawning '{}' on {:?} (pri={}, stack={}KB)",
        display_name,
        core,
        priority,
        stack_kb
    );

    std::thread::Builder::new()
        .name(display_name.into())
        .spawn(f)
}

/// Host fallback: ignores core affinity and priority.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_on_core<T: Send + 'static>(
    _core: Core,
    _priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() -> T + Send + 'static,
) -> io::Result<JoinHandle<T>> {
    let display_name = name.trim_end_matches('\0');
    log::info!(
        "Spawning '{}' (sim, no core pinning, stack={}KB)",
        display_name,
        stack_kb
    );

    std::thread::Builder::new()
        .name(display_name.into())
        .stack_size(stack_kb * 1024)
        .spawn(f)
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;

    #[test]
    fn spawned_thread_carries_name_and_result() {
        let handle = spawn_on_core(Core::Pro, 5, 64, "probe\0", || {
            std::thread::current().name().map(str::to_owned)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("probe"));
    }
}
