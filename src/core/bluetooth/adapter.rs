//! Radio adapter contract
//! Commands go to the platform through [`RadioAdapter`]; platform callbacks
//! come back as [`RadioEvent`]s on a broadcast channel.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::bluetooth::error::{BleError, Result};
use crate::core::bluetooth::types::{
    BondState, CharacteristicId, Device, GattService, GattStatus, LinkState, WriteMode,
};

/// Callbacks reported by the platform radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A scan result matching the active filter
    DeviceDiscovered(Device),
    BondStateChanged {
        address: String,
        state: BondState,
    },
    ConnectionStateChanged {
        address: String,
        status: GattStatus,
        state: LinkState,
    },
    MtuChanged {
        address: String,
        mtu: u16,
        status: GattStatus,
    },
    ServicesDiscovered {
        address: String,
        status: GattStatus,
        services: Vec<GattService>,
    },
    DescriptorWritten {
        address: String,
        characteristic: CharacteristicId,
        descriptor: Uuid,
        status: GattStatus,
    },
    CharacteristicWritten {
        address: String,
        characteristic: CharacteristicId,
        status: GattStatus,
    },
    CharacteristicChanged {
        address: String,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
}

impl RadioEvent {
    /// Address of the device the event concerns
    pub fn address(&self) -> &str {
        match self {
            Self::DeviceDiscovered(device) => &device.address,
            Self::BondStateChanged { address, .. }
            | Self::ConnectionStateChanged { address, .. }
            | Self::MtuChanged { address, .. }
            | Self::ServicesDiscovered { address, .. }
            | Self::DescriptorWritten { address, .. }
            | Self::CharacteristicWritten { address, .. }
            | Self::CharacteristicChanged { address, .. } => address,
        }
    }
}

/// A single characteristic write: target, mode and payload travel together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub characteristic: CharacteristicId,
    pub mode: WriteMode,
    pub payload: Vec<u8>,
}

impl WriteRequest {
    pub fn new(characteristic: CharacteristicId) -> Self {
        Self {
            characteristic,
            mode: WriteMode::WithResponse,
            payload: Vec::new(),
        }
    }

    pub fn with_mode(self, mode: WriteMode) -> Self {
        Self { mode, ..self }
    }

    pub fn with_payload(self, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..self
        }
    }
}

/// Platform radio commands.
///
/// Every command only starts an operation; its result arrives later as a
/// [`RadioEvent`]. Callers subscribe before issuing the command they await.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Returns a receiver for every event emitted from now on
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;

    /// Starts a discovery request filtered on a service UUID
    async fn start_scan(&self, service: Uuid) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Queries the live bond state of a device
    async fn bond_state(&self, address: &str) -> Result<BondState>;

    /// Starts a bonding handshake, returns false if the platform refused it
    async fn create_bond(&self, address: &str) -> Result<bool>;

    async fn connect_gatt(&self, address: &str) -> Result<()>;

    /// Closes the GATT link, a no-op if none is open
    async fn close_gatt(&self, address: &str) -> Result<()>;

    async fn request_mtu(&self, address: &str, mtu: u16) -> Result<()>;

    async fn discover_services(&self, address: &str) -> Result<()>;

    /// Turns the local delivery of value changes on or off
    async fn set_characteristic_notification(
        &self,
        address: &str,
        characteristic: &CharacteristicId,
        enable: bool,
    ) -> Result<()>;

    async fn write_descriptor(
        &self,
        address: &str,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    async fn write_characteristic(&self, address: &str, request: WriteRequest) -> Result<()>;
}

/// Adapter handle shared between the core components
pub type SharedAdapter = Arc<dyn RadioAdapter>;

/// Receives the next event, skipping over lag.
pub(crate) async fn next_event(rx: &mut broadcast::Receiver<RadioEvent>) -> Result<RadioEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Ok(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Radio event listener lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(BleError::Adapter("radio event channel closed".to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{UUID_PRINTER_CHAR, UUID_PRINTER_SERVICE};

    #[test]
    fn test_write_request_carries_mode_and_payload() {
        let id = CharacteristicId::new(UUID_PRINTER_SERVICE, UUID_PRINTER_CHAR);
        let request = WriteRequest::new(id)
            .with_payload(b"TEST".to_vec())
            .with_mode(WriteMode::WithoutResponse);
        assert_eq!(request.characteristic, id);
        assert_eq!(request.mode, WriteMode::WithoutResponse);
        assert_eq!(request.payload, b"TEST");
    }

    #[tokio::test]
    async fn test_next_event_skips_lag() {
        let (tx, mut rx) = broadcast::channel(1);
        let event = |address: &str| RadioEvent::BondStateChanged {
            address: address.to_string(),
            state: BondState::Bonded,
        };
        tx.send(event("first")).unwrap();
        tx.send(event("second")).unwrap();

        let received = next_event(&mut rx).await.unwrap();
        assert_eq!(received.address(), "second");

        drop(tx);
        assert!(matches!(next_event(&mut rx).await, Err(BleError::Adapter(_))));
    }
}
