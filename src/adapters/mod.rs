//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter    | Implements  | Connects to                         |
//! |------------|-------------|-------------------------------------|
//! | `flash`    | FlashRegion | ESP-IDF data partition / RAM        |
//! | `i2c`      | SensorBus   | ESP-IDF I2C master / simulated ADP910 |
//! | `log_sink` | EventSink   | Serial log output                   |
//! | `time`     | -           | ESP32 system timer / `Instant`      |

pub mod flash;
pub mod i2c;
pub mod log_sink;
pub mod time;
