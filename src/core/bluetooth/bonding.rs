//! Bonding handshake
//! Drives one bonding attempt per device and waits for the platform to
//! report a terminal bond state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::core::bluetooth::adapter::{RadioEvent, SharedAdapter, next_event};
use crate::core::bluetooth::error::{BleError, Result};
use crate::core::bluetooth::types::{BondState, Device};

type PendingSet = Arc<Mutex<HashSet<String>>>;

/// Claim on a pending bond, released when dropped
struct PendingBond {
    pending: PendingSet,
    address: String,
}

impl PendingBond {
    fn claim(pending: &PendingSet, address: &str) -> Option<Self> {
        let mut set = pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(address.to_string()) {
            return None;
        }
        Some(Self {
            pending: pending.clone(),
            address: address.to_string(),
        })
    }
}

impl Drop for PendingBond {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.address);
    }
}

/// Runs bonding handshakes, one at a time per device
#[derive(Clone)]
pub struct BondNegotiator {
    adapter: SharedAdapter,
    pending: PendingSet,
    timeout: Option<Duration>,
}

impl BondNegotiator {
    /// `timeout` of `None` waits for the platform indefinitely
    pub fn new(adapter: SharedAdapter, timeout: Option<Duration>) -> Self {
        Self {
            adapter,
            pending: Arc::new(Mutex::new(HashSet::new())),
            timeout,
        }
    }

    /// Live bond state, falling back to the snapshot if the query fails
    pub async fn current_state(&self, device: &Device) -> BondState {
        match self.adapter.bond_state(&device.address).await {
            Ok(state) => state,
            Err(e) => {
                debug!(
                    "Bond state query for {} failed ({}), using snapshot",
                    device.address, e
                );
                device.bond_state
            }
        }
    }

    /// Bonds with `device`, returning once it is bonded
    pub async fn bond(&self, device: &Device) -> Result<()> {
        if self.current_state(device).await == BondState::Bonded {
            debug!("Device {} already bonded", device.address);
            return Ok(());
        }

        let _claim = PendingBond::claim(&self.pending, &device.address).ok_or(BleError::Busy)?;

        let mut events = self.adapter.subscribe();
        info!("Initiating bonding with {}", device.address);
        match self.adapter.create_bond(&device.address).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Platform refused to start bonding with {}", device.address);
                return Err(BleError::BondingFailed(format!(
                    "could not start bonding with {}",
                    device.address
                )));
            }
            Err(e) => return Err(BleError::BondingFailed(e.to_string())),
        }

        let wait = Self::wait_for_bond(&mut events, &device.address);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or_else(|_| {
                Err(BleError::BondingFailed(format!(
                    "timed out after {} s waiting for {}",
                    limit.as_secs(),
                    device.address
                )))
            }),
            None => wait.await,
        };

        match &result {
            Ok(()) => info!("Bonded with {}", device.address),
            Err(e) => warn!("Bonding with {} failed: {}", device.address, e),
        }
        result
    }

    async fn wait_for_bond(
        events: &mut broadcast::Receiver<RadioEvent>,
        address: &str,
    ) -> Result<()> {
        loop {
            if let RadioEvent::BondStateChanged { address: from, state } = next_event(events).await? {
                if from != address {
                    continue;
                }
                match state {
                    BondState::Bonded => return Ok(()),
                    BondState::None => {
                        return Err(BleError::BondingFailed(format!(
                            "{address} rejected the bond"
                        )));
                    }
                    BondState::Bonding => debug!("Bonding with {} in progress", address),
                }
            }
        }
    }
}
