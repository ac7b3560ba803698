//! # Lantuya
//!
//! LAN-local discovery, monitoring and on/off control of Tuya-compatible
//! Wi-Fi devices (bulbs, plugs, switches) without any vendor cloud.
//!
//! The daemon listens for discovery beacons on UDP ports 6666/6667,
//! polls and commands devices over TCP port 6668 with the Tuya local
//! binary protocol, and exposes a small HTTP control surface.

pub mod config;
pub mod controller;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod exchange;
pub mod http;
pub mod messages;
pub mod model;
pub mod protocol;
pub mod runtime;

pub use controller::Controller;
pub use error::TuyaError;
pub use messages::DeviceSecret;
pub use protocol::{CommandType, Version};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[must_use]
pub fn version() -> &'static str {
    VERSION
}
