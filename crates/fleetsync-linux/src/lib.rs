//! Linux-specific implementation for fleetsync
//!
//! This crate reads battery and network link state from sysfs so the core
//! crate can drive its power and connectivity monitors on Linux units.

#![cfg(target_os = "linux")]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod net;
pub mod power_supply;

pub use net::{interface_is_up, link_state, LinkState, NET_ROOT};
pub use power_supply::{find_battery, read_battery, BatteryReading, POWER_SUPPLY_ROOT};

