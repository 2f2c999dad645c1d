//! Fuzz target: `adp910::decode_frame`
//!
//! Any 6-byte frame either fails its checksum or decodes to a finite
//! reading inside the sensor's i16 range.
//!
//! cargo fuzz run fuzz_sensor_frame

#![no_main]

use blowerdoor::sensors::adp910::{FRAME_LEN, crc8, decode_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: [u8; FRAME_LEN]| {
    let checksums_ok = crc8(&data[0..2]) == data[2] && crc8(&data[3..5]) == data[5];
    match decode_frame(&data, 0.0) {
        Ok(sample) => {
            assert!(checksums_ok);
            assert!(sample.differential_pressure_pa.abs() <= 32_768.0 / 60.0);
            assert!(sample.temperature_c.is_finite());
            assert_eq!(sample.corrected_pressure_pa, sample.differential_pressure_pa);
        }
        Err(_) => assert!(!checksums_ok),
    }
});
