//! Constants used throughout the link core
//! This module contains the GATT identifiers of the printer profile,
//! retry budgets, timeouts and descriptor payloads.

use uuid::Uuid;

/// The printer service advertised by supported peripherals
pub const UUID_PRINTER_SERVICE: Uuid = Uuid::from_u128(0x000018f0_0000_1000_8000_00805f9b34fb);

/// The printer characteristic, used both for writes and for notifications
pub const UUID_PRINTER_CHAR: Uuid = Uuid::from_u128(0x00002af1_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor
pub const UUID_CCC_DESCRIPTOR: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCC payload enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCC payload enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCC payload disabling both notifications and indications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Maximum number of connection attempts
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Delay between connection attempts in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// MTU requested once the link is up
pub const PREFERRED_MTU: u16 = 512;

/// ATT MTU every link starts with
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest MTU the ATT layer allows
pub const MAX_ATT_MTU: u16 = 517;

/// Bytes of every ATT write taken by the opcode and handle
pub const ATT_WRITE_OVERHEAD: u16 = 3;

/// Timeout for a bonding handshake in seconds
pub const BOND_TIMEOUT_SECS: u64 = 30;

/// Timeout for GATT connect and service discovery in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;

/// Timeout for a characteristic write to be acknowledged in seconds
pub const WRITE_TIMEOUT_SECS: u64 = 10;

/// Capacity of the radio event broadcast channel
pub const RADIO_EVENT_CAPACITY: usize = 256;

/// Capacity of the notification broadcast channel
pub const NOTIFICATION_CAPACITY: usize = 64;

/// Capacity of a connection outcome stream
pub const CONNECTION_OUTCOME_CAPACITY: usize = 8;
