//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::error::BleError;

/// Bonding state reported by the platform for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BondState {
    /// Not bonded, or a bonding attempt failed
    None,
    /// A bonding handshake is in progress
    Bonding,
    /// A long-term key is established
    Bonded,
}

/// Represents a discovered Bluetooth device.
///
/// Devices are immutable snapshots of what the radio reported; the core only
/// moves them between the paired and scanned sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// The address of the device, its stable identity
    pub address: String,
    /// The name of the device, if available
    pub name: Option<String>,
    /// Bond state at the time of the snapshot
    pub bond_state: BondState,
}

impl Device {
    /// Creates a new Device snapshot
    pub fn new(address: impl Into<String>, name: Option<String>, bond_state: BondState) -> Self {
        Self {
            address: address.into(),
            name,
            bond_state,
        }
    }

    /// Returns the address of the device
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns true if the snapshot says the device is bonded
    pub fn is_bonded(&self) -> bool {
        self.bond_state == BondState::Bonded
    }

    /// Returns a copy of this snapshot with another bond state
    pub fn with_bond_state(&self, bond_state: BondState) -> Self {
        Self {
            bond_state,
            ..self.clone()
        }
    }
}

/// Identifies a characteristic by its service and its own UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// GATT properties of a characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// A characteristic discovered on a connected device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// UUIDs of the descriptors attached to this characteristic
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    /// Returns true if the characteristic carries the given descriptor
    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

/// A service discovered on a connected device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Status codes surfaced by GATT callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GattStatus {
    Success,
    /// The written value exceeded what the link can carry
    InvalidAttributeLength,
    WriteNotPermitted,
    /// Any other platform status code, passed through untouched
    Failure(i32),
}

impl GattStatus {
    pub const SUCCESS_CODE: i32 = 0x00;
    pub const WRITE_NOT_PERMITTED_CODE: i32 = 0x03;
    pub const INVALID_ATTRIBUTE_LENGTH_CODE: i32 = 0x0d;
    /// Generic error most stacks report for an unexplained link failure
    pub const GATT_ERROR_CODE: i32 = 0x85;

    /// Maps a raw platform status code
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::SUCCESS_CODE => Self::Success,
            Self::WRITE_NOT_PERMITTED_CODE => Self::WriteNotPermitted,
            Self::INVALID_ATTRIBUTE_LENGTH_CODE => Self::InvalidAttributeLength,
            other => Self::Failure(other),
        }
    }

    /// Returns the raw platform status code
    pub fn code(self) -> i32 {
        match self {
            Self::Success => Self::SUCCESS_CODE,
            Self::WriteNotPermitted => Self::WRITE_NOT_PERMITTED_CODE,
            Self::InvalidAttributeLength => Self::INVALID_ATTRIBUTE_LENGTH_CODE,
            Self::Failure(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::InvalidAttributeLength => write!(f, "write exceeded connection ATT MTU"),
            Self::WriteNotPermitted => write!(f, "write not permitted"),
            Self::Failure(code) => write!(f, "status {code:#04x}"),
        }
    }
}

/// State of a GATT link as reported by connection-state callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// How a payload is written to a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteMode {
    /// Default write, acknowledged by the peer
    WithResponse,
    /// Unacknowledged write command
    WithoutResponse,
}

impl WriteMode {
    /// Picks the write mode for a characteristic: acknowledged writes first,
    /// then write commands. `None` means the characteristic cannot be written.
    pub fn select(properties: &CharacteristicProperties) -> Option<Self> {
        if properties.write {
            Some(Self::WithResponse)
        } else if properties.write_without_response {
            Some(Self::WithoutResponse)
        } else {
            None
        }
    }
}

/// Connection status observed by callers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No session and no attempt in flight
    #[default]
    Idle,
    Bonding,
    Connecting,
    DiscoveringServices,
    Connected,
    Failed(BleError),
}

/// Outcomes emitted on a connection stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionResult {
    Established,
    PairingInitiated,
    Error(BleError),
}

/// Outcome of a print request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrintResult {
    Success,
    Error(BleError),
}

impl From<Result<(), BleError>> for PrintResult {
    fn from(result: Result<(), BleError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::Error(e),
        }
    }
}

/// Capabilities granted by the caller.
///
/// The core never prompts for permissions; operations whose capability is
/// missing are silent no-ops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub scan: bool,
    pub connect: bool,
}

impl Permissions {
    /// Every capability granted
    pub const fn all() -> Self {
        Self {
            scan: true,
            connect: true,
        }
    }
}

/// A value pushed by the peer on a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub address: String,
    pub characteristic: CharacteristicId,
    pub value: Vec<u8>,
}
