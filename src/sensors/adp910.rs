//! ADP910 digital differential-pressure sensor driver.
//!
//! The sensor runs in continuous-measurement mode once started; every read
//! returns a 6-byte frame:
//!
//! ```text
//!  byte  0      1      2      3      4      5
//!       ┌──────┬──────┬──────┬──────┬──────┬──────┐
//!       │ P_hi │ P_lo │ CRC8 │ T_hi │ T_lo │ CRC8 │
//!       └──────┴──────┴──────┴──────┴──────┴──────┘
//!        i16 BE / 60 = Pa     i16 BE / 200 = °C
//! ```
//!
//! Each half carries its own CRC-8 (poly 0x31, init 0xFF).  A frame with
//! either checksum wrong is rejected as a whole.
//!
//! Every bus transaction is attempted up to four times with a bus recovery
//! and a short delay between attempts.  Timeouts scale with the transfer
//! length and bus clock.

use crc::{CRC_8_NRSC_5, Crc};
use embedded_hal::delay::DelayNs;
use log::debug;

use super::PressureSample;
use crate::app::ports::SensorBus;
use crate::config::SensorPortConfig;
use crate::error::{BusError, Error, Result};

/// Start continuous measurement, mass-flow temperature compensation.
pub const CMD_START_CONTINUOUS: u16 = 0x361E;
pub const FRAME_LEN: usize = 6;

const PRESSURE_LSB_PER_PA: f32 = 60.0;
const TEMPERATURE_LSB_PER_C: f32 = 200.0;

const TRANSFER_ATTEMPTS: u8 = 4;
const RETRY_DELAY_MS: u32 = 2;
const STARTUP_DELAY_MS: u32 = 60;
const COMMAND_SETTLE_MS: u32 = 20;
const DISCARDED_SAMPLES: u8 = 3;
const DISCARD_INTERVAL_MS: u32 = 10;

const DEFAULT_FREQUENCY_HZ: u64 = 100_000;
const TIMEOUT_MARGIN_US: u64 = 2_000;
const MIN_TIMEOUT_US: u64 = 5_000;
const MAX_TIMEOUT_US: u64 = 60_000;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

/// Sensirion-style CRC-8 over one data word.
pub fn crc8(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

/// Worst-case duration of a `len`-byte transfer at `frequency_hz`: nine
/// clocks per byte plus address and slack bytes, a fixed margin on top.
pub fn transfer_timeout_us(frequency_hz: u32, len: usize) -> u32 {
    let freq = if frequency_hz == 0 {
        DEFAULT_FREQUENCY_HZ
    } else {
        u64::from(frequency_hz)
    };
    let bits = (len as u64 + 2) * 9;
    let wire_us = (bits * 1_000_000).div_ceil(freq);
    (wire_us + TIMEOUT_MARGIN_US).clamp(MIN_TIMEOUT_US, MAX_TIMEOUT_US) as u32
}

/// Validate both checksums and decode a raw frame.
pub fn decode_frame(frame: &[u8; FRAME_LEN], pressure_offset_pa: f32) -> Result<PressureSample> {
    if crc8(&frame[0..2]) != frame[2] || crc8(&frame[3..5]) != frame[5] {
        return Err(Error::CrcMismatch);
    }

    let raw_pressure = i16::from_be_bytes([frame[0], frame[1]]);
    let raw_temperature = i16::from_be_bytes([frame[3], frame[4]]);
    let differential_pressure_pa = f32::from(raw_pressure) / PRESSURE_LSB_PER_PA;

    Ok(PressureSample {
        differential_pressure_pa,
        corrected_pressure_pa: differential_pressure_pa - pressure_offset_pa,
        temperature_c: f32::from(raw_temperature) / TEMPERATURE_LSB_PER_C,
    })
}

/// Encode a frame the way the sensor would send it.  Used by the bus
/// simulation and tests.
pub fn encode_frame(pressure_pa: f32, temperature_c: f32) -> [u8; FRAME_LEN] {
    let p = to_raw(pressure_pa * PRESSURE_LSB_PER_PA).to_be_bytes();
    let t = to_raw(temperature_c * TEMPERATURE_LSB_PER_C).to_be_bytes();
    [p[0], p[1], crc8(&p), t[0], t[1], crc8(&t)]
}

fn to_raw(scaled: f32) -> i16 {
    scaled
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// One ADP910 on its own bus.
pub struct Adp910<B, D> {
    bus: B,
    delay: D,
    port: SensorPortConfig,
    pressure_offset_pa: f32,
    initialized: bool,
}

impl<B: SensorBus, D: DelayNs> Adp910<B, D> {
    pub fn new(bus: B, delay: D, port: SensorPortConfig) -> Self {
        Self {
            bus,
            delay,
            port,
            pressure_offset_pa: 0.0,
            initialized: false,
        }
    }

    /// Recover the bus, start continuous measurement and let the output
    /// settle.  Safe to call again after a failure.
    pub fn initialize(&mut self) -> Result<()> {
        self.initialized = false;
        self.port.validate()?;

        self.bus.recover();
        self.delay.delay_ms(STARTUP_DELAY_MS);

        let cmd = CMD_START_CONTINUOUS.to_be_bytes();
        self.write_with_retry(&cmd)?;
        self.delay.delay_ms(COMMAND_SETTLE_MS);
        self.initialized = true;

        // First conversions after start are not yet compensated.
        for _ in 0..DISCARDED_SAMPLES {
            let mut frame = [0u8; FRAME_LEN];
            if let Err(e) = self.read_with_retry(&mut frame) {
                debug!("ADP910 | discard read failed: {}", e);
            }
            self.delay.delay_ms(DISCARD_INTERVAL_MS);
        }
        Ok(())
    }

    /// Read and decode one frame.
    pub fn read_sample(&mut self) -> Result<PressureSample> {
        if !self.initialized {
            return Err(Error::NotReady);
        }
        let mut frame = [0u8; FRAME_LEN];
        self.read_with_retry(&mut frame)?;
        decode_frame(&frame, self.pressure_offset_pa)
    }

    pub fn set_pressure_offset(&mut self, offset_pa: f32) {
        self.pressure_offset_pa = offset_pa;
    }

    pub fn pressure_offset(&self) -> f32 {
        self.pressure_offset_pa
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn port(&self) -> &SensorPortConfig {
        &self.port
    }

    // ── Internal ──────────────────────────────────────────────

    fn write_with_retry(&mut self, bytes: &[u8]) -> Result<()> {
        let timeout = transfer_timeout_us(self.port.frequency_hz, bytes.len());
        let address = self.port.address;
        self.with_retry(|bus| bus.write(address, bytes, timeout))
    }

    fn read_with_retry(&mut self, buf: &mut [u8]) -> Result<()> {
        let timeout = transfer_timeout_us(self.port.frequency_hz, buf.len());
        let address = self.port.address;
        self.with_retry(|bus| bus.read(address, buf, timeout))
    }

    fn with_retry(
        &mut self,
        mut op: impl FnMut(&mut B) -> core::result::Result<(), BusError>,
    ) -> Result<()> {
        let mut last = BusError::Timeout;
        for attempt in 0..TRANSFER_ATTEMPTS {
            match op(&mut self.bus) {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
            if attempt + 1 < TRANSFER_ATTEMPTS {
                self.bus.recover();
                self.delay.delay_ms(RETRY_DELAY_MS);
            }
        }
        Err(Error::Bus(last))
    }
}
