use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{RadioEvent, SharedAdapter, next_event};
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::types::{BondState, Permissions};

pub struct Scanner {
    adapter: SharedAdapter,
    registry: Arc<DeviceRegistry>,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl Scanner {
    pub fn new(adapter: SharedAdapter, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            adapter,
            registry,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Starts a discovery request filtered on `filter`. Does nothing when
    /// scanning has not been permitted.
    pub async fn start(&mut self, filter: Uuid, permissions: Permissions) {
        if !permissions.scan {
            debug!("Scan permission not granted, not scanning");
            return;
        }
        if self.scan_task_handle.is_some() {
            self.stop().await;
        }

        self.cancel_token = CancellationToken::new();
        let events = self.adapter.subscribe();

        info!("Starting bluetooth scan for service {}", filter);
        if let Err(e) = self.adapter.start_scan(filter).await {
            error!("Failed to start bluetooth scan: {}", e);
            return;
        }

        let cancel_token_for_task = self.cancel_token.clone();
        let registry_for_task = self.registry.clone();
        let handle = tokio::spawn(async move {
            Self::route_discoveries(events, registry_for_task, cancel_token_for_task).await;
        });
        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");
    }

    /// Feeds scan results into the registry until cancelled
    async fn route_discoveries(
        mut events: broadcast::Receiver<RadioEvent>,
        registry: Arc<DeviceRegistry>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = next_event(&mut events) => {
                    match event {
                        Ok(RadioEvent::DeviceDiscovered(device)) => {
                            debug!("Found device - Address: {}, Name: {:?}", device.address, device.name);
                            registry.record(device);
                        }
                        Ok(RadioEvent::BondStateChanged { address, state: BondState::Bonded }) => {
                            registry.promote_bonded(&address);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Bluetooth scan event stream has ended: {}", e);
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    /// Stops the running scan. Safe to call when no scan is running.
    pub async fn stop(&mut self) {
        let Some(handle) = self.scan_task_handle.take() else {
            debug!("No active scan task to stop.");
            return;
        };

        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop bluetooth scan: {}", e);
        }

        info!("Waiting for scan task to finish...");
        match handle.await {
            Ok(()) => info!("Scan task finished successfully after cancellation."),
            Err(e) => {
                if e.is_cancelled() {
                    info!("Scan task was cancelled successfully.");
                } else {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                }
            }
        }
    }
}
