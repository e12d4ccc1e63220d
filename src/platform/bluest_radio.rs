//! Radio adapter backed by the bluest crate
//! Commands spawn the matching bluest operation and report the outcome as a
//! radio event once it completes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Descriptor};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::{
    BleError, BondState, CharacteristicId, CharacteristicProperties, Device, GattCharacteristic,
    GattService, GattStatus, LinkState, RADIO_EVENT_CAPACITY, RadioAdapter, RadioEvent, Result,
    UUID_CCC_DESCRIPTOR, WriteMode, WriteRequest,
};
use crate::utils::device_address;

/// Interval of the connection watcher
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);

type CharacteristicKey = (String, CharacteristicId);
type DescriptorKey = (String, CharacteristicId, Uuid);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn adapter_error(e: bluest::Error) -> BleError {
    BleError::Adapter(e.to_string())
}

/// Cancels and forgets every token whose key matches
fn cancel_for<K: Eq + Hash>(
    tokens: &Mutex<HashMap<K, CancellationToken>>,
    matches: impl Fn(&K) -> bool,
) {
    lock(tokens).retain(|key, token| {
        if matches(key) {
            token.cancel();
            false
        } else {
            true
        }
    });
}

#[derive(Default)]
struct Discovered {
    services: Vec<GattService>,
    characteristics: Vec<(CharacteristicId, Characteristic)>,
    descriptors: Vec<(CharacteristicId, Uuid, Descriptor)>,
}

/// [`RadioAdapter`] over the system Bluetooth stack
pub struct BluestRadio {
    adapter: Adapter,
    events: broadcast::Sender<RadioEvent>,
    devices: Arc<Mutex<HashMap<String, bluest::Device>>>,
    characteristics: Arc<Mutex<HashMap<CharacteristicKey, Characteristic>>>,
    descriptors: Arc<Mutex<HashMap<DescriptorKey, Descriptor>>>,
    scan_token: Mutex<Option<CancellationToken>>,
    link_tokens: Mutex<HashMap<String, CancellationToken>>,
    notify_tokens: Mutex<HashMap<CharacteristicKey, CancellationToken>>,
}

impl BluestRadio {
    /// Opens the default adapter and waits for it to become available
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| BleError::Adapter("No Bluetooth adapter found".to_string()))?;
        adapter.wait_available().await.map_err(adapter_error)?;
        info!("Bluetooth adapter is available.");

        let (events, _) = broadcast::channel(RADIO_EVENT_CAPACITY);
        Ok(Self {
            adapter,
            events,
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            descriptors: Arc::new(Mutex::new(HashMap::new())),
            scan_token: Mutex::new(None),
            link_tokens: Mutex::new(HashMap::new()),
            notify_tokens: Mutex::new(HashMap::new()),
        })
    }

    fn device(&self, address: &str) -> Result<bluest::Device> {
        lock(&self.devices)
            .get(address)
            .cloned()
            .ok_or_else(|| BleError::Adapter(format!("Device not found with address: {address}")))
    }

    /// Looks `address` up among scanned devices, then among devices the
    /// system already holds a link to.
    async fn resolve_device(&self, address: &str) -> Result<bluest::Device> {
        if let Ok(device) = self.device(address) {
            return Ok(device);
        }
        let connected = self.adapter.connected_devices().await.map_err(adapter_error)?;
        if let Some(device) = connected
            .into_iter()
            .find(|device| device_address(&device.id().to_string()) == address)
        {
            lock(&self.devices).insert(address.to_string(), device.clone());
            return Ok(device);
        }
        warn!("Device {} has not been seen by a scan, scan for it before connecting", address);
        Err(BleError::Unsupported(format!(
            "{address} is unknown to the adapter"
        )))
    }

    fn characteristic(&self, address: &str, id: &CharacteristicId) -> Result<Characteristic> {
        lock(&self.characteristics)
            .get(&(address.to_string(), *id))
            .cloned()
            .ok_or_else(|| BleError::Adapter(format!("Characteristic {id} not discovered on {address}")))
    }

    async fn discover(device: &bluest::Device) -> std::result::Result<Discovered, bluest::Error> {
        let mut discovered = Discovered::default();
        for service in device.discover_services().await? {
            let mut characteristics = Vec::new();
            for characteristic in service.discover_characteristics().await? {
                let id = CharacteristicId::new(service.uuid(), characteristic.uuid());
                let props = characteristic.properties().await?;
                let properties = CharacteristicProperties {
                    read: props.read,
                    write: props.write,
                    write_without_response: props.write_without_response,
                    notify: props.notify,
                    indicate: props.indicate,
                };

                let mut descriptor_uuids = Vec::new();
                match characteristic.discover_descriptors().await {
                    Ok(descriptors) => {
                        for descriptor in descriptors {
                            descriptor_uuids.push(descriptor.uuid());
                            discovered.descriptors.push((id, descriptor.uuid(), descriptor));
                        }
                    }
                    Err(e) => debug!("Descriptor discovery on {} failed: {}", id, e),
                }
                // some stacks hide the CCC descriptor and manage it themselves
                if (properties.notify || properties.indicate)
                    && !descriptor_uuids.contains(&UUID_CCC_DESCRIPTOR)
                {
                    descriptor_uuids.push(UUID_CCC_DESCRIPTOR);
                }

                characteristics.push(GattCharacteristic {
                    uuid: characteristic.uuid(),
                    properties,
                    descriptors: descriptor_uuids,
                });
                discovered.characteristics.push((id, characteristic));
            }
            discovered.services.push(GattService {
                uuid: service.uuid(),
                characteristics,
            });
        }
        Ok(discovered)
    }
}

#[async_trait]
impl RadioAdapter for BluestRadio {
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, service: Uuid) -> Result<()> {
        self.stop_scan().await?;

        let token = CancellationToken::new();
        *lock(&self.scan_token) = Some(token.clone());

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let devices = self.devices.clone();
        tokio::spawn(async move {
            let services = [service];
            let scan_stream = match adapter.scan(&services).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start bluetooth scan: {}", e);
                    return;
                }
            };
            tokio::pin!(scan_stream);

            loop {
                tokio::select! {
                    result = scan_stream.next() => {
                        let Some(discovered_device) = result else {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        };
                        let device = discovered_device.device;
                        let id = device.id().to_string();
                        let address = device_address(&id);
                        let name = device.name().ok();
                        let bond_state = if device.is_paired().await.unwrap_or(false) {
                            BondState::Bonded
                        } else {
                            BondState::None
                        };
                        debug!("Found device - ID: {}, Name: {:?}, RSSI: {:?}", id, name, discovered_device.rssi);

                        lock(&devices).insert(address.clone(), device);
                        let _ = events.send(RadioEvent::DeviceDiscovered(Device::new(address, name, bond_state)));
                    }
                    _ = token.cancelled() => {
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(token) = lock(&self.scan_token).take() {
            token.cancel();
        }
        Ok(())
    }

    async fn bond_state(&self, address: &str) -> Result<BondState> {
        let device = self.resolve_device(address).await?;
        match device.is_paired().await.map_err(adapter_error)? {
            true => Ok(BondState::Bonded),
            false => Ok(BondState::None),
        }
    }

    async fn create_bond(&self, address: &str) -> Result<bool> {
        let device = self.resolve_device(address).await?;
        let events = self.events.clone();
        let address = address.to_string();

        let _ = events.send(RadioEvent::BondStateChanged {
            address: address.clone(),
            state: BondState::Bonding,
        });
        tokio::spawn(async move {
            let state = match device.pair().await {
                Ok(()) => BondState::Bonded,
                Err(e) => {
                    warn!("Pairing with {} failed: {}", address, e);
                    BondState::None
                }
            };
            let _ = events.send(RadioEvent::BondStateChanged { address, state });
        });
        Ok(true)
    }

    async fn connect_gatt(&self, address: &str) -> Result<()> {
        let device = self.resolve_device(address).await?;
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.link_tokens).insert(address.to_string(), token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let connected = tokio::select! {
                _ = token.cancelled() => return,
                result = adapter.connect_device(&device) => result,
            };
            if let Err(e) = connected {
                warn!("Connecting to {} failed: {}", address, e);
                let _ = events.send(RadioEvent::ConnectionStateChanged {
                    address,
                    status: GattStatus::Failure(GattStatus::GATT_ERROR_CODE),
                    state: LinkState::Disconnected,
                });
                return;
            }
            let _ = events.send(RadioEvent::ConnectionStateChanged {
                address: address.clone(),
                status: GattStatus::Success,
                state: LinkState::Connected,
            });

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(LINK_POLL_INTERVAL) => {
                        if !device.is_connected().await {
                            info!("Device {} reports disconnected", address);
                            let _ = events.send(RadioEvent::ConnectionStateChanged {
                                address,
                                status: GattStatus::Success,
                                state: LinkState::Disconnected,
                            });
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn close_gatt(&self, address: &str) -> Result<()> {
        if let Some(token) = lock(&self.link_tokens).remove(address) {
            token.cancel();
        }
        cancel_for(&self.notify_tokens, |(owner, _)| owner == address);
        lock(&self.characteristics).retain(|(owner, _), _| owner != address);
        lock(&self.descriptors).retain(|(owner, _, _), _| owner != address);

        let Ok(device) = self.device(address) else {
            return Ok(());
        };
        if device.is_connected().await {
            info!("Disconnecting from device {}", address);
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(adapter_error)?;
        }
        Ok(())
    }

    async fn request_mtu(&self, _address: &str, _mtu: u16) -> Result<()> {
        Err(BleError::Unsupported(
            "MTU is negotiated by the platform".to_string(),
        ))
    }

    async fn discover_services(&self, address: &str) -> Result<()> {
        let device = self.device(address)?;
        let events = self.events.clone();
        let characteristics = self.characteristics.clone();
        let descriptors = self.descriptors.clone();
        let address = address.to_string();

        tokio::spawn(async move {
            let (status, services) = match Self::discover(&device).await {
                Ok(discovered) => {
                    {
                        let mut map = lock(&characteristics);
                        for (id, characteristic) in discovered.characteristics {
                            map.insert((address.clone(), id), characteristic);
                        }
                    }
                    {
                        let mut map = lock(&descriptors);
                        for (id, uuid, descriptor) in discovered.descriptors {
                            map.insert((address.clone(), id, uuid), descriptor);
                        }
                    }
                    (GattStatus::Success, discovered.services)
                }
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", address, e);
                    (GattStatus::Failure(GattStatus::GATT_ERROR_CODE), Vec::new())
                }
            };
            let _ = events.send(RadioEvent::ServicesDiscovered {
                address,
                status,
                services,
            });
        });
        Ok(())
    }

    async fn set_characteristic_notification(
        &self,
        address: &str,
        characteristic: &CharacteristicId,
        enable: bool,
    ) -> Result<()> {
        let key = (address.to_string(), *characteristic);
        if !enable {
            cancel_for(&self.notify_tokens, |k| *k == key);
            return Ok(());
        }

        let target = self.characteristic(address, characteristic)?;
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.notify_tokens).insert(key, token.clone()) {
            previous.cancel();
        }

        let events = self.events.clone();
        let address = address.to_string();
        let id = *characteristic;
        tokio::spawn(async move {
            info!("Listening for notifications on {}...", id);
            let notification_stream = match target.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to subscribe to notifications: {}", e);
                    return;
                }
            };
            tokio::pin!(notification_stream);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = notification_stream.next() => match next {
                        Some(Ok(value)) => {
                            let _ = events.send(RadioEvent::CharacteristicChanged {
                                address: address.clone(),
                                characteristic: id,
                                value,
                            });
                        }
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            info!("Notification stream ended");
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        address: &str,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        let events = self.events.clone();
        let address = address.to_string();
        let id = *characteristic;

        // subscribing through notify() already configures the CCC descriptor
        if descriptor == UUID_CCC_DESCRIPTOR {
            let _ = events.send(RadioEvent::DescriptorWritten {
                address,
                characteristic: id,
                descriptor,
                status: GattStatus::Success,
            });
            return Ok(());
        }

        let target = lock(&self.descriptors)
            .get(&(address.clone(), id, descriptor))
            .cloned()
            .ok_or_else(|| BleError::Adapter(format!("Descriptor {descriptor} not discovered on {id}")))?;
        let value = value.to_vec();
        tokio::spawn(async move {
            let status = match target.write(&value).await {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    warn!("Descriptor write on {} failed: {}", id, e);
                    GattStatus::Failure(GattStatus::GATT_ERROR_CODE)
                }
            };
            let _ = events.send(RadioEvent::DescriptorWritten {
                address,
                characteristic: id,
                descriptor,
                status,
            });
        });
        Ok(())
    }

    async fn write_characteristic(&self, address: &str, request: WriteRequest) -> Result<()> {
        let target = self.characteristic(address, &request.characteristic)?;
        let events = self.events.clone();
        let address = address.to_string();

        tokio::spawn(async move {
            let result = match request.mode {
                WriteMode::WithResponse => target.write(&request.payload).await,
                WriteMode::WithoutResponse => target.write_without_response(&request.payload).await,
            };
            let status = match result {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    warn!("Write to {} failed: {}", request.characteristic, e);
                    GattStatus::Failure(GattStatus::GATT_ERROR_CODE)
                }
            };
            let _ = events.send(RadioEvent::CharacteristicWritten {
                address,
                characteristic: request.characteristic,
                status,
            });
        });
        Ok(())
    }
}
