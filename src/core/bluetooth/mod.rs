//! Bluetooth functionality for the printer link
//! This module handles all bluetooth operations including scanning,
//! bonding, connecting, and writing print data to the printer.

mod adapter;
mod bonding;
mod connection;
mod constants;
mod error;
mod manager;
mod notification;
mod registry;
mod scanner;
mod stream;
mod transport;
mod types;

// Re-export types that should be publicly accessible
pub use adapter::{RadioAdapter, RadioEvent, SharedAdapter, WriteRequest};
pub use bonding::BondNegotiator;
pub use connection::{ConnectionConfig, ConnectionSupervisor, Session};
pub use constants::*; // Re-export all constants
pub use error::{BleError, Result};
pub use manager::BleController;
pub use notification::NotificationHandler;
pub use registry::DeviceRegistry;
pub use scanner::Scanner;
pub use stream::OutcomeStream;
pub use transport::{PreparedWrite, Transport, WriteCharacteristicRef};
pub use types::{
    BondState, CharacteristicId, CharacteristicProperties, ConnectionResult, ConnectionStatus,
    Device, GattCharacteristic, GattService, GattStatus, LinkState, Notification, Permissions,
    PrintResult, WriteMode,
};
