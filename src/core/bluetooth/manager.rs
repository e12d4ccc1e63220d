//! Bluetooth manager for the printer link
//! This module provides the main interface for bluetooth operations

use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::link_config::LinkConfig;
use crate::core::bluetooth::adapter::SharedAdapter;
use crate::core::bluetooth::connection::{ConnectionSupervisor, Session};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::scanner::Scanner;
use crate::core::bluetooth::stream::OutcomeStream;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{
    ConnectionResult, ConnectionStatus, Device, Notification, Permissions, PrintResult,
};
use crate::core::bluetooth::error::BleError;

/// Manages Bluetooth operations for one printer link
pub struct BleController {
    config: LinkConfig,
    permissions: RwLock<Permissions>,
    registry: Arc<DeviceRegistry>,
    scanner: Mutex<Scanner>,
    supervisor: ConnectionSupervisor,
    transport: Arc<Transport>,
    notifications: NotificationHandler,
}

impl BleController {
    /// Creates a new BleController. No permission is granted until
    /// [`set_permissions`](Self::set_permissions) is called.
    pub fn new(adapter: SharedAdapter, config: LinkConfig) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let notifications = NotificationHandler::new();
        let scanner = Scanner::new(adapter.clone(), registry.clone());
        let supervisor = ConnectionSupervisor::new(
            adapter.clone(),
            notifications.clone(),
            config.connection_config(),
        );
        let transport = Transport::new(adapter, config.target(), config.write_timeout());

        Self {
            config,
            permissions: RwLock::new(Permissions::default()),
            registry,
            scanner: Mutex::new(scanner),
            supervisor,
            transport: Arc::new(transport),
            notifications,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Records what the caller has been granted by the platform
    pub fn set_permissions(&self, permissions: Permissions) {
        info!("Bluetooth permissions updated: {:?}", permissions);
        *self.permissions.write().unwrap_or_else(PoisonError::into_inner) = permissions;
    }

    pub fn permissions(&self) -> Permissions {
        *self.permissions.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts scanning for printers. A no-op without scan permission.
    pub async fn start_scan(&self) {
        let permissions = self.permissions();
        self.scanner
            .lock()
            .await
            .start(self.config.service_uuid, permissions)
            .await;
    }

    pub async fn stop_scanning(&self) {
        self.scanner.lock().await.stop().await;
    }

    pub async fn is_scanning(&self) -> bool {
        self.scanner.lock().await.is_scanning()
    }

    /// Connects to `device`, stopping any scan first. Without connect
    /// permission the returned stream ends immediately.
    pub async fn connect_to_device(&self, device: Device) -> OutcomeStream<ConnectionResult> {
        if !self.permissions().connect {
            debug!("Connect permission not granted, ignoring connect to {}", device.address);
            return OutcomeStream::closed();
        }
        self.stop_scanning().await;
        info!("Connecting to device {} ({:?})", device.address, device.name);
        self.supervisor.connect(device).await
    }

    /// Disconnects from the current device, if any
    pub async fn disconnect(&self) {
        info!("Disconnecting from printer");
        self.supervisor.disconnect().await;
    }

    /// Sends `data` to the printer. The stream yields exactly one result;
    /// dropping it abandons the write.
    pub fn send_print_data(&self, data: impl Into<Vec<u8>>) -> OutcomeStream<PrintResult> {
        let Some(session) = self.supervisor.session() else {
            warn!("Not connected to a Bluetooth device!");
            return OutcomeStream::ready(PrintResult::Error(BleError::NotConnected));
        };
        let prepared = match self.transport.prepare(&session) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Print data rejected: {}", e);
                return OutcomeStream::ready(PrintResult::Error(e));
            }
        };

        let data = data.into();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = task_token.cancelled() => {
                    debug!("Print request abandoned");
                    return;
                }
                result = prepared.send(data) => PrintResult::from(result),
            };
            let _ = tx.send(result).await;
        });
        OutcomeStream::new(rx, token)
    }

    pub fn scanned_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.registry.subscribe_scanned()
    }

    pub fn paired_devices(&self) -> watch::Receiver<Vec<Device>> {
        self.registry.subscribe_paired()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.supervisor.status()
    }

    /// Checks if a device is currently connected.
    pub fn is_connected(&self) -> bool {
        self.supervisor
            .session()
            .is_some_and(|session| session.is_open())
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.supervisor.session()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}
