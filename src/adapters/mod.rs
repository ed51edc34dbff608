//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter     | Implements     | Connects to                   |
//! |-------------|----------------|-------------------------------|
//! | `gpio`      | PinPort        | ESP32 GPIO matrix + LEDC      |
//! | `mqtt`      | MessagingPort  | ESP-IDF MQTT client / sim     |
//! | `nvs`       | ConfigPort     | NVS / in-memory store         |
//! | `log_sink`  | EventSink      | Serial log output             |
//! | `time`      | -              | ESP32 system timer            |
//! | `device_id` | -              | Factory MAC (eFuse)           |

pub mod device_id;
pub mod gpio;
pub mod log_sink;
pub mod mqtt;
pub mod nvs;
pub mod time;
