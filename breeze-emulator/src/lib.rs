//! Breeze device emulator
//!
//! Simulates ESP32/ESP8266 boards on the Breeze MQTT protocol:
//! - discovery (retained), periodic status, state echoes
//! - `set_state` / `toggle` / `ping` commands
//! - optional auto mode (random toggles, connection flaps)

pub mod config;
pub mod device;
pub mod identity;
pub mod runner;
pub mod signal;
