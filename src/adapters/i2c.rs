//! I2C sensor bus adapters.
//!
//! - **`target_os = "espidf"`**: [`IdfI2cBus`] drives one ESP-IDF I2C
//!   master controller and performs the bit-banged lock-up recovery.
//! - **`not(target_os = "espidf")`**: [`SimulatedBus`] answers like an
//!   ADP910 for host-side testing, with injectable faults.

#[cfg(target_os = "espidf")]
pub use idf::IdfI2cBus;
#[cfg(not(target_os = "espidf"))]
pub use sim::SimulatedBus;

#[cfg(target_os = "espidf")]
mod idf {
    use esp_idf_svc::sys;
    use log::warn;

    use crate::app::ports::SensorBus;
    use crate::config::SensorPortConfig;
    use crate::error::{BusError, Error, Result};

    /// Clock pulses that are always enough to walk a slave out of a byte.
    const RECOVERY_CLOCKS: u8 = 9;
    const RECOVERY_HALF_PERIOD_US: u32 = 5;

    const OK: sys::esp_err_t = sys::ESP_OK as sys::esp_err_t;
    const FAIL: sys::esp_err_t = sys::ESP_FAIL as sys::esp_err_t;
    const ERR_TIMEOUT: sys::esp_err_t = sys::ESP_ERR_TIMEOUT as sys::esp_err_t;
    const ERR_INVALID_STATE: sys::esp_err_t = sys::ESP_ERR_INVALID_STATE as sys::esp_err_t;

    /// Master driver on one I2C controller.
    pub struct IdfI2cBus {
        port: SensorPortConfig,
        installed: bool,
    }

    impl IdfI2cBus {
        pub fn new(port: SensorPortConfig) -> Result<Self> {
            port.validate()?;
            let mut bus = Self {
                port,
                installed: false,
            };
            bus.install()?;
            Ok(bus)
        }

        fn install(&mut self) -> Result<()> {
            let mut cfg = sys::i2c_config_t {
                mode: sys::i2c_mode_t_I2C_MODE_MASTER,
                sda_io_num: i32::from(self.port.sda_pin),
                scl_io_num: i32::from(self.port.scl_pin),
                sda_pullup_en: true,
                scl_pullup_en: true,
                ..Default::default()
            };
            cfg.__bindgen_anon_1.master.clk_speed = self.port.frequency_hz;

            let port = self.port.port.index();
            // SAFETY: `cfg` lives across the call; the port index is 0 or 1.
            let err = unsafe { sys::i2c_param_config(port, &cfg) };
            if err != OK {
                return Err(Error::Bus(BusError::Io(err)));
            }
            // SAFETY: master mode needs no slave buffers.
            let err = unsafe { sys::i2c_driver_install(port, cfg.mode, 0, 0, 0) };
            if err != OK {
                return Err(Error::Bus(BusError::Io(err)));
            }
            self.installed = true;
            Ok(())
        }

        fn uninstall(&mut self) {
            if self.installed {
                // SAFETY: driver was installed on this port by `install`.
                unsafe { sys::i2c_driver_delete(self.port.port.index()) };
                self.installed = false;
            }
        }

        fn ticks(timeout_us: u32) -> sys::TickType_t {
            let ms = timeout_us.div_ceil(1000);
            let ticks = ms * sys::configTICK_RATE_HZ / 1000;
            ticks.max(1)
        }

        fn map_err(err: sys::esp_err_t) -> BusError {
            match err {
                ERR_TIMEOUT => BusError::Timeout,
                FAIL => BusError::Nack,
                other => BusError::Io(other),
            }
        }

        /// Toggle SCL until the slave releases SDA, then drive a STOP.
        fn clock_out_stuck_slave(&self) {
            let sda = i32::from(self.port.sda_pin);
            let scl = i32::from(self.port.scl_pin);
            // SAFETY: both pins belong to this bus and the driver is
            // uninstalled, so nothing else is driving them.
            unsafe {
                sys::gpio_set_direction(sda, sys::gpio_mode_t_GPIO_MODE_INPUT_OUTPUT_OD);
                sys::gpio_set_direction(scl, sys::gpio_mode_t_GPIO_MODE_INPUT_OUTPUT_OD);
                sys::gpio_set_pull_mode(sda, sys::gpio_pull_mode_t_GPIO_PULLUP_ONLY);
                sys::gpio_set_pull_mode(scl, sys::gpio_pull_mode_t_GPIO_PULLUP_ONLY);
                sys::gpio_set_level(sda, 1);
                sys::gpio_set_level(scl, 1);
                sys::esp_rom_delay_us(RECOVERY_HALF_PERIOD_US);

                for _ in 0..RECOVERY_CLOCKS {
                    if sys::gpio_get_level(sda) != 0 {
                        break;
                    }
                    sys::gpio_set_level(scl, 0);
                    sys::esp_rom_delay_us(RECOVERY_HALF_PERIOD_US);
                    sys::gpio_set_level(scl, 1);
                    sys::esp_rom_delay_us(RECOVERY_HALF_PERIOD_US);
                }

                // STOP: SDA low→high while SCL is high.
                sys::gpio_set_level(sda, 0);
                sys::esp_rom_delay_us(RECOVERY_HALF_PERIOD_US);
                sys::gpio_set_level(scl, 1);
                sys::esp_rom_delay_us(RECOVERY_HALF_PERIOD_US);
                sys::gpio_set_level(sda, 1);
                sys::esp_rom_delay_us(RECOVERY_HALF_PERIOD_US);
            }
        }
    }

    impl SensorBus for IdfI2cBus {
        fn write(&mut self, address: u8, bytes: &[u8], timeout_us: u32) -> Result<(), BusError> {
            if !self.installed {
                return Err(BusError::Io(ERR_INVALID_STATE));
            }
            // SAFETY: `bytes` outlives the blocking call.
            let err = unsafe {
                sys::i2c_master_write_to_device(
                    self.port.port.index(),
                    address,
                    bytes.as_ptr(),
                    bytes.len(),
                    Self::ticks(timeout_us),
                )
            };
            if err == OK { Ok(()) } else { Err(Self::map_err(err)) }
        }

        fn read(&mut self, address: u8, buf: &mut [u8], timeout_us: u32) -> Result<(), BusError> {
            if !self.installed {
                return Err(BusError::Io(ERR_INVALID_STATE));
            }
            // SAFETY: `buf` outlives the blocking call.
            let err = unsafe {
                sys::i2c_master_read_from_device(
                    self.port.port.index(),
                    address,
                    buf.as_mut_ptr(),
                    buf.len(),
                    Self::ticks(timeout_us),
                )
            };
            if err == OK { Ok(()) } else { Err(Self::map_err(err)) }
        }

        fn recover(&mut self) {
            self.uninstall();
            self.clock_out_stuck_slave();
            if let Err(e) = self.install() {
                warn!("I2C{} | re-install after recovery failed: {}", self.port.port.index(), e);
            }
        }
    }

    impl Drop for IdfI2cBus {
        fn drop(&mut self) {
            self.uninstall();
        }
    }
}

#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::sync::{Arc, Mutex, PoisonError};

    use crate::app::ports::SensorBus;
    use crate::error::BusError;
    use crate::sensors::adp910::{CMD_START_CONTINUOUS, encode_frame};

    #[derive(Debug, Default)]
    struct SimState {
        pressure_pa: f32,
        temperature_c: f32,
        measuring: bool,
        fail_remaining: u32,
        corrupt_next: bool,
        recoveries: u32,
        reads: u32,
        writes: Vec<Vec<u8>>,
    }

    /// Simulated ADP910 on its own bus.  Clones share state, so a test can
    /// keep a handle after moving one into a driver.
    #[derive(Debug, Clone)]
    pub struct SimulatedBus {
        state: Arc<Mutex<SimState>>,
    }

    impl SimulatedBus {
        pub fn new(pressure_pa: f32, temperature_c: f32) -> Self {
            Self {
                state: Arc::new(Mutex::new(SimState {
                    pressure_pa,
                    temperature_c,
                    ..SimState::default()
                })),
            }
        }

        fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
            let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        }

        pub fn set_reading(&self, pressure_pa: f32, temperature_c: f32) {
            self.with(|s| {
                s.pressure_pa = pressure_pa;
                s.temperature_c = temperature_c;
            });
        }

        /// NACK the next `n` transfers.
        pub fn fail_next(&self, n: u32) {
            self.with(|s| s.fail_remaining = n);
        }

        /// Flip a checksum bit in the next frame returned.
        pub fn corrupt_next_frame(&self) {
            self.with(|s| s.corrupt_next = true);
        }

        pub fn recoveries(&self) -> u32 {
            self.with(|s| s.recoveries)
        }

        pub fn reads(&self) -> u32 {
            self.with(|s| s.reads)
        }

        pub fn last_write(&self) -> Option<Vec<u8>> {
            self.with(|s| s.writes.last().cloned())
        }
    }

    impl SensorBus for SimulatedBus {
        fn write(&mut self, _address: u8, bytes: &[u8], _timeout_us: u32) -> Result<(), BusError> {
            self.with(|s| {
                if s.fail_remaining > 0 {
                    s.fail_remaining -= 1;
                    return Err(BusError::Nack);
                }
                if bytes == CMD_START_CONTINUOUS.to_be_bytes() {
                    s.measuring = true;
                }
                s.writes.push(bytes.to_vec());
                Ok(())
            })
        }

        fn read(&mut self, _address: u8, buf: &mut [u8], _timeout_us: u32) -> Result<(), BusError> {
            self.with(|s| {
                s.reads += 1;
                if s.fail_remaining > 0 {
                    s.fail_remaining -= 1;
                    return Err(BusError::Nack);
                }
                if !s.measuring {
                    return Err(BusError::Nack);
                }
                let mut frame = encode_frame(s.pressure_pa, s.temperature_c);
                if s.corrupt_next {
                    s.corrupt_next = false;
                    frame[2] ^= 0x01;
                }
                let n = buf.len().min(frame.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(())
            })
        }

        fn recover(&mut self) {
            self.with(|s| s.recoveries += 1);
        }
    }
}
