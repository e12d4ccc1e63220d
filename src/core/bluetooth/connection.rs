//! Bluetooth connection handling for the printer
//! This module owns the single GATT session: it connects with retry,
//! negotiates the MTU, discovers services, watches the link and tears it
//! down again.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{OwnedMutexGuard, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::{RadioEvent, SharedAdapter, next_event};
use crate::core::bluetooth::bonding::BondNegotiator;
use crate::core::bluetooth::constants::{
    BLUETOOTH_OPERATION_TIMEOUT_SECS, BOND_TIMEOUT_SECS, CONNECT_RETRY_DELAY_MS,
    CONNECTION_OUTCOME_CAPACITY, DEFAULT_ATT_MTU, MAX_CONNECT_ATTEMPTS, PREFERRED_MTU,
    UUID_PRINTER_CHAR, UUID_PRINTER_SERVICE, ATT_WRITE_OVERHEAD,
};
use crate::core::bluetooth::error::{BleError, Result};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::stream::OutcomeStream;
use crate::core::bluetooth::types::{
    BondState, CharacteristicId, ConnectionResult, ConnectionStatus, Device, GattCharacteristic,
    GattService, LinkState,
};

/// An open GATT connection to one device
#[derive(Debug)]
pub struct Session {
    id: u64,
    device: Device,
    mtu: AtomicU16,
    services: Vec<GattService>,
    closed: CancellationToken,
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl Session {
    pub fn new(id: u64, device: Device, mtu: u16, services: Vec<GattService>) -> Self {
        Self {
            id,
            device,
            mtu: AtomicU16::new(mtu),
            services,
            closed: CancellationToken::new(),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn address(&self) -> &str {
        &self.device.address
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::Release);
    }

    /// Largest payload a single write can carry on this link
    pub fn max_payload_len(&self) -> usize {
        usize::from(self.mtu().saturating_sub(ATT_WRITE_OVERHEAD))
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Resolves once the session has been released
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Finds `target` by exact service and characteristic match, falling
    /// back to the characteristic UUID in any service.
    pub fn locate(&self, target: &CharacteristicId) -> Option<(CharacteristicId, &GattCharacteristic)> {
        fn in_service(service: &GattService, uuid: uuid::Uuid) -> Option<&GattCharacteristic> {
            service.characteristics.iter().find(|c| c.uuid == uuid)
        }

        self.services
            .iter()
            .filter(|s| s.uuid == target.service)
            .find_map(|s| in_service(s, target.characteristic).map(|c| (*target, c)))
            .or_else(|| {
                self.services.iter().find_map(|s| {
                    in_service(s, target.characteristic)
                        .map(|c| (CharacteristicId::new(s.uuid, c.uuid), c))
                })
            })
    }

    /// Takes the write gate, `Busy` if a write is already in flight
    pub(crate) fn try_begin_write(&self) -> Result<OwnedMutexGuard<()>> {
        self.write_gate
            .clone()
            .try_lock_owned()
            .map_err(|_| BleError::Busy)
    }
}

/// Tuning of the connection procedure
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub preferred_mtu: u16,
    /// Limit for the GATT connect and service discovery callbacks
    pub operation_timeout: Duration,
    pub bond_timeout: Option<Duration>,
    /// Characteristic notifications are enabled on
    pub target: CharacteristicId,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CONNECT_ATTEMPTS,
            retry_delay: Duration::from_millis(CONNECT_RETRY_DELAY_MS),
            preferred_mtu: PREFERRED_MTU,
            operation_timeout: Duration::from_secs(BLUETOOTH_OPERATION_TIMEOUT_SECS),
            bond_timeout: Some(Duration::from_secs(BOND_TIMEOUT_SECS)),
            target: CharacteristicId::new(UUID_PRINTER_SERVICE, UUID_PRINTER_CHAR),
        }
    }
}

struct ActiveAttempt {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    adapter: SharedAdapter,
    bonds: BondNegotiator,
    notifications: NotificationHandler,
    config: ConnectionConfig,
    session: Mutex<Option<Arc<Session>>>,
    status_tx: watch::Sender<ConnectionStatus>,
    next_session_id: AtomicU64,
}

/// Connection supervisor for the printer link
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
    active: tokio::sync::Mutex<Option<ActiveAttempt>>,
}

impl ConnectionSupervisor {
    pub fn new(
        adapter: SharedAdapter,
        notifications: NotificationHandler,
        config: ConnectionConfig,
    ) -> Self {
        let bonds = BondNegotiator::new(adapter.clone(), config.bond_timeout);
        Self {
            shared: Arc::new(Shared {
                adapter,
                bonds,
                notifications,
                config,
                session: Mutex::new(None),
                status_tx: watch::Sender::new(ConnectionStatus::Idle),
                next_session_id: AtomicU64::new(1),
            }),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Connects to `device`, superseding any attempt or session in place.
    ///
    /// The returned stream yields `PairingInitiated` when bonding starts,
    /// then exactly one of `Established` or `Error`; after `Established` it
    /// may still yield `Error(Disconnected)` on link loss. Dropping the
    /// stream cancels the attempt and closes the session it produced.
    pub async fn connect(&self, device: Device) -> OutcomeStream<ConnectionResult> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!("Superseding previous connection before connecting to {}", device.address);
            Self::finish(previous).await;
        }

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(CONNECTION_OUTCOME_CAPACITY);
        let shared = self.shared.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            shared.run(device, tx, task_token).await;
        });

        *active = Some(ActiveAttempt {
            token: token.clone(),
            handle,
        });
        OutcomeStream::new(rx, token)
    }

    /// Cancels any attempt and closes the session. Safe when disconnected.
    pub async fn disconnect(&self) {
        let previous = self.active.lock().await.take();
        match previous {
            Some(attempt) => Self::finish(attempt).await,
            None => debug!("Disconnect requested without an active connection"),
        }
        self.shared.set_status(ConnectionStatus::Idle);
    }

    /// The live session, if any
    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared.slot().clone()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.shared.status_tx.borrow().clone()
    }

    async fn finish(attempt: ActiveAttempt) {
        attempt.token.cancel();
        info!("Waiting for connection task to finish...");
        match attempt.handle.await {
            Ok(()) => info!("Connection task finished."),
            Err(e) => {
                if e.is_cancelled() {
                    info!("Connection task was cancelled.");
                } else {
                    error!("Connection task finished with an unexpected join error: {:?}", e);
                }
            }
        }
    }
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        debug!("Connection status: {:?}", status);
        self.status_tx.send_replace(status);
    }

    fn install(&self, session: Arc<Session>) {
        *self.slot() = Some(session);
    }

    /// Clears the slot, then marks the session closed, so anyone woken by
    /// the close already sees no session.
    fn release(&self, session: &Session) {
        {
            let mut slot = self.slot();
            if slot.as_ref().is_some_and(|s| s.id() == session.id()) {
                *slot = None;
            }
        }
        session.close();
        info!("Session {} with {} released", session.id(), session.address());
    }

    async fn close_link(&self, address: &str) {
        if let Err(e) = self.adapter.close_gatt(address).await {
            debug!("Closing GATT link to {} failed: {}", address, e);
        }
    }

    async fn run(
        self: Arc<Self>,
        device: Device,
        tx: mpsc::Sender<ConnectionResult>,
        token: CancellationToken,
    ) {
        let established = tokio::select! {
            _ = token.cancelled() => {
                info!("Connection attempt to {} cancelled", device.address);
                self.teardown(None, &device.address).await;
                return;
            }
            result = self.establish_with_retry(&device, &tx) => result,
        };

        match established {
            Ok((session, events)) => {
                self.install(session.clone());
                self.set_status(ConnectionStatus::Connected);
                info!("Device {} connected and session installed.", device.address);
                let _ = tx.send(ConnectionResult::Established).await;
                self.supervise(session, events, &tx, &token).await;
            }
            Err(e) => {
                error!("Connection to {} failed: {}", device.address, e);
                self.set_status(ConnectionStatus::Failed(e.clone()));
                let _ = tx.send(ConnectionResult::Error(e)).await;
            }
        }
    }

    /// Connect with retry mechanism
    async fn establish_with_retry(
        &self,
        device: &Device,
        tx: &mpsc::Sender<ConnectionResult>,
    ) -> Result<(Arc<Session>, broadcast::Receiver<RadioEvent>)> {
        let address = device.address.as_str();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let mut last_error = None;

        while attempt < max_attempts {
            attempt += 1;
            self.close_link(address).await;

            if self.bonds.current_state(device).await != BondState::Bonded {
                self.set_status(ConnectionStatus::Bonding);
                let _ = tx.send(ConnectionResult::PairingInitiated).await;
                self.bonds.bond(device).await?;
            }

            self.set_status(ConnectionStatus::Connecting);
            info!("Initiating connection to {} (attempt {}/{})...", address, attempt, max_attempts);
            match self.try_connect(device).await {
                Ok(connected) => {
                    info!("Successfully connected to device {}", address);
                    return Ok(connected);
                }
                Err(e) if !e.is_retryable() => {
                    warn!("Connection attempt {} failed and cannot be retried: {}", attempt, e);
                    self.close_link(address).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    self.close_link(address).await;
                    last_error = Some(e);

                    if attempt < max_attempts {
                        info!("Retrying connection in {} ms...", self.config.retry_delay.as_millis());
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(BleError::ConnectionFailed(format!(
            "Failed to connect to {} after {} attempts: {}",
            address,
            max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Try to open a session with the device
    async fn try_connect(
        &self,
        device: &Device,
    ) -> Result<(Arc<Session>, broadcast::Receiver<RadioEvent>)> {
        let address = device.address.as_str();
        let limit = self.config.operation_timeout;
        let mut events = self.adapter.subscribe();

        self.adapter.connect_gatt(address).await?;
        tokio::time::timeout(limit, Self::wait_for_link(&mut events, address))
            .await
            .map_err(|_| BleError::Timeout(format!("GATT connection to {address}")))??;

        info!("Connection successful, requesting MTU {}...", self.config.preferred_mtu);
        if let Err(e) = self.adapter.request_mtu(address, self.config.preferred_mtu).await {
            debug!("MTU request for {} not honoured: {}", address, e);
        }

        self.set_status(ConnectionStatus::DiscoveringServices);
        info!("Discovering services on {}...", address);
        self.adapter.discover_services(address).await?;
        let (mtu, services) =
            tokio::time::timeout(limit, Self::wait_for_services(&mut events, address))
                .await
                .map_err(|_| BleError::Timeout(format!("service discovery on {address}")))??;

        for service in &services {
            debug!("Available service: {}", service.uuid);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, device.clone(), mtu, services));
        if !self
            .notifications
            .enable(&self.adapter, &session, &self.config.target)
            .await
        {
            warn!("Continuing without notifications from {}", address);
        }

        info!("Connection and setup process completed successfully (MTU {})", mtu);
        Ok((session, events))
    }

    async fn wait_for_link(
        events: &mut broadcast::Receiver<RadioEvent>,
        address: &str,
    ) -> Result<()> {
        loop {
            if let RadioEvent::ConnectionStateChanged {
                address: from,
                status,
                state,
            } = next_event(events).await?
            {
                if from != address {
                    continue;
                }
                return match (state, status.is_success()) {
                    (LinkState::Connected, true) => Ok(()),
                    _ => Err(BleError::ConnectionFailed(format!(
                        "GATT connect to {address} failed with {status}"
                    ))),
                };
            }
        }
    }

    async fn wait_for_services(
        events: &mut broadcast::Receiver<RadioEvent>,
        address: &str,
    ) -> Result<(u16, Vec<GattService>)> {
        let mut mtu = DEFAULT_ATT_MTU;
        loop {
            match next_event(events).await? {
                RadioEvent::MtuChanged {
                    address: from,
                    mtu: new_mtu,
                    status,
                } if from == address => {
                    if status.is_success() {
                        info!("MTU for {} changed to {}", address, new_mtu);
                        mtu = new_mtu;
                    } else {
                        debug!("MTU change on {} failed with {}", address, status);
                    }
                }
                RadioEvent::ConnectionStateChanged {
                    address: from,
                    state: LinkState::Disconnected,
                    status,
                } if from == address => {
                    return Err(BleError::ConnectionFailed(format!(
                        "{address} dropped the link before services resolved ({status})"
                    )));
                }
                RadioEvent::ServicesDiscovered {
                    address: from,
                    status,
                    services,
                } if from == address => {
                    return if status.is_success() {
                        Ok((mtu, services))
                    } else {
                        Err(BleError::ConnectionFailed(format!(
                            "service discovery on {address} failed with {status}"
                        )))
                    };
                }
                _ => {}
            }
        }
    }

    /// Watches the live session until cancellation or link loss
    async fn supervise(
        &self,
        session: Arc<Session>,
        mut events: broadcast::Receiver<RadioEvent>,
        tx: &mpsc::Sender<ConnectionResult>,
        token: &CancellationToken,
    ) {
        let address = session.address().to_string();
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => {
                    info!("Closing session with {}", address);
                    self.teardown(Some(&session), &address).await;
                    return;
                }
                event = next_event(&mut events) => event,
            };

            match event {
                Err(e) => {
                    error!("Lost radio events while connected to {}: {}", address, e);
                    self.release(&session);
                    self.close_link(&address).await;
                    self.set_status(ConnectionStatus::Failed(e.clone()));
                    let _ = tx.send(ConnectionResult::Error(e)).await;
                    return;
                }
                Ok(RadioEvent::ConnectionStateChanged {
                    address: from,
                    state: LinkState::Disconnected,
                    status,
                }) if from == address => {
                    warn!("Link to {} lost ({})", address, status);
                    self.release(&session);
                    self.close_link(&address).await;
                    self.set_status(ConnectionStatus::Failed(BleError::Disconnected));
                    let _ = tx.send(ConnectionResult::Error(BleError::Disconnected)).await;
                    return;
                }
                Ok(RadioEvent::CharacteristicChanged {
                    address: from,
                    characteristic,
                    value,
                }) if from == address => {
                    self.notifications.publish(&from, characteristic, value);
                }
                Ok(RadioEvent::MtuChanged {
                    address: from,
                    mtu,
                    status,
                }) if from == address && status.is_success() => {
                    info!("MTU for {} changed to {}", address, mtu);
                    session.set_mtu(mtu);
                }
                Ok(RadioEvent::DescriptorWritten {
                    address: from,
                    characteristic,
                    descriptor,
                    status,
                }) if from == address => {
                    debug!("Descriptor {} on {} written: {}", descriptor, characteristic, status);
                }
                Ok(_) => {}
            }
        }
    }

    async fn teardown(&self, session: Option<&Arc<Session>>, address: &str) {
        if let Some(session) = session {
            self.notifications
                .disable(&self.adapter, session, &self.config.target)
                .await;
            self.release(session);
        }
        self.close_link(address).await;
        self.set_status(ConnectionStatus::Idle);
    }
}
