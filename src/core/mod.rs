//! Core functionality for the printer link
//! This module contains the Bluetooth Low Energy central used to reach the printer

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BleController, BleError, Device, RadioAdapter};
