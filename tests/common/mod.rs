#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ble_printer_link::config::link_config::LinkConfig;
use ble_printer_link::core::bluetooth::{
    BleController, BleError, BondState, CharacteristicId, CharacteristicProperties,
    ConnectionResult, Device, GattCharacteristic, GattService, GattStatus, LinkState,
    OutcomeStream, Permissions, RadioAdapter, RadioEvent, Result, UUID_CCC_DESCRIPTOR,
    UUID_PRINTER_CHAR, UUID_PRINTER_SERVICE, WriteRequest,
};
use tokio::sync::broadcast;
use uuid::Uuid;

pub const PRINTER: &str = "AA:BB:CC:DD:EE:FF";
pub const OTHER_PRINTER: &str = "11:22:33:44:55:66";

/// Commands the link core issued to the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartScan(Uuid),
    StopScan,
    CreateBond(String),
    ConnectGatt(String),
    CloseGatt(String),
    RequestMtu(String, u16),
    DiscoverServices(String),
    SetNotification(String, CharacteristicId, bool),
    WriteDescriptor(String, CharacteristicId, Uuid, Vec<u8>),
    Write(String, WriteRequest),
}

/// How the radio answers a GATT connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReply {
    Success,
    Fail(GattStatus),
    /// Never answers
    Silent,
    /// The radio does not know the device
    Unknown,
}

/// How the radio answers a service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryReply {
    Success,
    Fail(GattStatus),
    /// The peer drops the link before services resolve
    DropLink,
}

/// How the radio answers a bonding request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondReply {
    Succeed,
    Reject,
    /// `create_bond` returns false
    Refuse,
    /// Stays in `Bonding` forever
    Hang,
}

struct Script {
    commands: Vec<Command>,
    bond_states: HashMap<String, BondState>,
    bond_reply: BondReply,
    connect_queue: VecDeque<ConnectReply>,
    connect_by_address: HashMap<String, ConnectReply>,
    mtu_supported: bool,
    discovery_queue: VecDeque<DiscoveryReply>,
    discovery_default: DiscoveryReply,
    services: Vec<GattService>,
    /// `None` never acknowledges writes
    write_reply: Option<GattStatus>,
}

/// In-memory radio answering commands synchronously with scripted events
pub struct MockRadio {
    events: broadcast::Sender<RadioEvent>,
    script: Mutex<Script>,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            script: Mutex::new(Script {
                commands: Vec::new(),
                bond_states: HashMap::new(),
                bond_reply: BondReply::Succeed,
                connect_queue: VecDeque::new(),
                connect_by_address: HashMap::new(),
                mtu_supported: true,
                discovery_queue: VecDeque::new(),
                discovery_default: DiscoveryReply::Success,
                services: printer_services(with_response()),
                write_reply: Some(GattStatus::Success),
            }),
        })
    }

    pub fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_bond_state(&self, address: &str, state: BondState) {
        self.script
            .lock()
            .unwrap()
            .bond_states
            .insert(address.to_string(), state);
    }

    pub fn set_bond_reply(&self, reply: BondReply) {
        self.script.lock().unwrap().bond_reply = reply;
    }

    /// Replies used for the next connects, in order
    pub fn queue_connect_replies(&self, replies: impl IntoIterator<Item = ConnectReply>) {
        self.script.lock().unwrap().connect_queue.extend(replies);
    }

    /// Reply for every connect to `address` once the queue is empty
    pub fn set_connect_reply(&self, address: &str, reply: ConnectReply) {
        self.script
            .lock()
            .unwrap()
            .connect_by_address
            .insert(address.to_string(), reply);
    }

    pub fn set_mtu_supported(&self, supported: bool) {
        self.script.lock().unwrap().mtu_supported = supported;
    }

    /// Replies used for the next service discoveries, in order
    pub fn queue_discovery_replies(&self, replies: impl IntoIterator<Item = DiscoveryReply>) {
        self.script.lock().unwrap().discovery_queue.extend(replies);
    }

    /// Reply for every discovery once the queue is empty
    pub fn set_discovery_reply(&self, reply: DiscoveryReply) {
        self.script.lock().unwrap().discovery_default = reply;
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        self.script.lock().unwrap().services = services;
    }

    pub fn set_write_reply(&self, reply: Option<GattStatus>) {
        self.script.lock().unwrap().write_reply = reply;
    }

    pub fn commands(&self) -> Vec<Command> {
        self.script.lock().unwrap().commands.clone()
    }

    pub fn count(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.commands().iter().filter(|c| pred(c)).count()
    }

    pub fn writes(&self) -> Vec<WriteRequest> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::Write(_, request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Waits until a command matching `pred` has been issued
    pub async fn wait_for_command(&self, pred: impl Fn(&Command) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.commands().iter().any(&pred) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("command was never issued");
    }

    fn record(&self, command: Command) {
        self.script.lock().unwrap().commands.push(command);
    }
}

#[async_trait]
impl RadioAdapter for MockRadio {
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, service: Uuid) -> Result<()> {
        self.record(Command::StartScan(service));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Command::StopScan);
        Ok(())
    }

    async fn bond_state(&self, address: &str) -> Result<BondState> {
        Ok(self
            .script
            .lock()
            .unwrap()
            .bond_states
            .get(address)
            .copied()
            .unwrap_or(BondState::None))
    }

    async fn create_bond(&self, address: &str) -> Result<bool> {
        self.record(Command::CreateBond(address.to_string()));
        let reply = self.script.lock().unwrap().bond_reply;
        if reply == BondReply::Refuse {
            return Ok(false);
        }

        let event = |state| RadioEvent::BondStateChanged {
            address: address.to_string(),
            state,
        };
        self.emit(event(BondState::Bonding));
        match reply {
            BondReply::Succeed => {
                self.set_bond_state(address, BondState::Bonded);
                self.emit(event(BondState::Bonded));
            }
            BondReply::Reject => self.emit(event(BondState::None)),
            BondReply::Hang | BondReply::Refuse => {}
        }
        Ok(true)
    }

    async fn connect_gatt(&self, address: &str) -> Result<()> {
        self.record(Command::ConnectGatt(address.to_string()));
        let reply = {
            let mut script = self.script.lock().unwrap();
            script
                .connect_queue
                .pop_front()
                .or_else(|| script.connect_by_address.get(address).copied())
                .unwrap_or(ConnectReply::Success)
        };
        let (status, state) = match reply {
            ConnectReply::Success => (GattStatus::Success, LinkState::Connected),
            ConnectReply::Fail(status) => (status, LinkState::Disconnected),
            ConnectReply::Silent => return Ok(()),
            ConnectReply::Unknown => {
                return Err(BleError::Unsupported(format!("{address} is unknown")));
            }
        };
        self.emit(RadioEvent::ConnectionStateChanged {
            address: address.to_string(),
            status,
            state,
        });
        Ok(())
    }

    async fn close_gatt(&self, address: &str) -> Result<()> {
        self.record(Command::CloseGatt(address.to_string()));
        Ok(())
    }

    async fn request_mtu(&self, address: &str, mtu: u16) -> Result<()> {
        self.record(Command::RequestMtu(address.to_string(), mtu));
        if !self.script.lock().unwrap().mtu_supported {
            return Err(BleError::Unsupported("mtu".into()));
        }
        self.emit(RadioEvent::MtuChanged {
            address: address.to_string(),
            mtu,
            status: GattStatus::Success,
        });
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<()> {
        self.record(Command::DiscoverServices(address.to_string()));
        let (reply, services) = {
            let mut script = self.script.lock().unwrap();
            let reply = script
                .discovery_queue
                .pop_front()
                .unwrap_or(script.discovery_default);
            (reply, script.services.clone())
        };
        let event = match reply {
            DiscoveryReply::Success => RadioEvent::ServicesDiscovered {
                address: address.to_string(),
                status: GattStatus::Success,
                services,
            },
            DiscoveryReply::Fail(status) => RadioEvent::ServicesDiscovered {
                address: address.to_string(),
                status,
                services: Vec::new(),
            },
            DiscoveryReply::DropLink => RadioEvent::ConnectionStateChanged {
                address: address.to_string(),
                status: GattStatus::Failure(19),
                state: LinkState::Disconnected,
            },
        };
        self.emit(event);
        Ok(())
    }

    async fn set_characteristic_notification(
        &self,
        address: &str,
        characteristic: &CharacteristicId,
        enable: bool,
    ) -> Result<()> {
        self.record(Command::SetNotification(
            address.to_string(),
            *characteristic,
            enable,
        ));
        Ok(())
    }

    async fn write_descriptor(
        &self,
        address: &str,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.record(Command::WriteDescriptor(
            address.to_string(),
            *characteristic,
            descriptor,
            value.to_vec(),
        ));
        self.emit(RadioEvent::DescriptorWritten {
            address: address.to_string(),
            characteristic: *characteristic,
            descriptor,
            status: GattStatus::Success,
        });
        Ok(())
    }

    async fn write_characteristic(&self, address: &str, request: WriteRequest) -> Result<()> {
        let characteristic = request.characteristic;
        self.record(Command::Write(address.to_string(), request));
        if let Some(status) = self.script.lock().unwrap().write_reply {
            self.emit(RadioEvent::CharacteristicWritten {
                address: address.to_string(),
                characteristic,
                status,
            });
        }
        Ok(())
    }
}

pub fn with_response() -> CharacteristicProperties {
    CharacteristicProperties {
        write: true,
        notify: true,
        ..Default::default()
    }
}

pub fn without_response_only() -> CharacteristicProperties {
    CharacteristicProperties {
        write_without_response: true,
        notify: true,
        ..Default::default()
    }
}

pub fn read_only() -> CharacteristicProperties {
    CharacteristicProperties {
        read: true,
        notify: true,
        ..Default::default()
    }
}

pub fn printer_services(properties: CharacteristicProperties) -> Vec<GattService> {
    vec![GattService {
        uuid: UUID_PRINTER_SERVICE,
        characteristics: vec![GattCharacteristic {
            uuid: UUID_PRINTER_CHAR,
            properties,
            descriptors: vec![UUID_CCC_DESCRIPTOR],
        }],
    }]
}

pub fn printer_char() -> CharacteristicId {
    CharacteristicId::new(UUID_PRINTER_SERVICE, UUID_PRINTER_CHAR)
}

pub fn printer(address: &str, bond_state: BondState) -> Device {
    Device::new(address, Some("MTP-II".to_string()), bond_state)
}

pub fn controller(radio: &Arc<MockRadio>) -> BleController {
    let controller = BleController::new(radio.clone(), LinkConfig::default());
    controller.set_permissions(Permissions::all());
    controller
}

/// Connects to a bonded printer and returns the live connection stream
pub async fn connected(
    radio: &Arc<MockRadio>,
    controller: &BleController,
) -> OutcomeStream<ConnectionResult> {
    radio.set_bond_state(PRINTER, BondState::Bonded);
    let mut stream = controller
        .connect_to_device(printer(PRINTER, BondState::Bonded))
        .await;
    assert_eq!(stream.recv().await, Some(ConnectionResult::Established));
    stream
}
