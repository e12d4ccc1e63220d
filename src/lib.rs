//! BLE printer link library
//! Discovers receipt printers over Bluetooth Low Energy, bonds with them,
//! keeps a GATT session open and streams print data to them.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
#[cfg(feature = "bluest")]
pub mod platform;
pub mod utils;

pub use config::AppConfig;
pub use core::bluetooth::{
    BleController, BleError, ConnectionResult, ConnectionStatus, Device, OutcomeStream,
    Permissions, PrintResult, RadioAdapter, RadioEvent,
};
