//! Notification handling for the printer characteristic
//! This module subscribes to value changes through the CCC descriptor and
//! fans received values out to observers.

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::core::bluetooth::adapter::SharedAdapter;
use crate::core::bluetooth::connection::Session;
use crate::core::bluetooth::constants::{
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
    NOTIFICATION_CAPACITY, UUID_CCC_DESCRIPTOR,
};
use crate::core::bluetooth::types::{CharacteristicId, CharacteristicProperties, Notification};

/// Notification handler for printer data
#[derive(Clone)]
pub struct NotificationHandler {
    tx: broadcast::Sender<Notification>,
}

impl Default for NotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHandler {
    /// Create a new NotificationHandler
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { tx }
    }

    /// CCC value for the characteristic, `None` if it can't push values
    pub fn subscription_value(properties: &CharacteristicProperties) -> Option<[u8; 2]> {
        if properties.notify {
            Some(ENABLE_NOTIFICATION_VALUE)
        } else if properties.indicate {
            Some(ENABLE_INDICATION_VALUE)
        } else {
            None
        }
    }

    /// Set up notifications on `target`. Returns false if they could not be
    /// enabled; the session stays usable for writes either way.
    pub async fn enable(
        &self,
        adapter: &SharedAdapter,
        session: &Session,
        target: &CharacteristicId,
    ) -> bool {
        let address = session.address();
        let Some((resolved, characteristic)) = session.locate(target) else {
            warn!("Characteristic {} not found on {}", target, address);
            return false;
        };
        let target = &resolved;
        let Some(value) = Self::subscription_value(&characteristic.properties) else {
            warn!("{} doesn't support notifications", target);
            return false;
        };

        info!("Subscribing to notifications on {}...", target);
        if let Err(e) = adapter
            .set_characteristic_notification(address, target, true)
            .await
        {
            error!("set_characteristic_notification failed for {}: {}", target, e);
            return false;
        }

        if !characteristic.has_descriptor(UUID_CCC_DESCRIPTOR) {
            error!("{} doesn't contain the CCC descriptor!", target);
            return false;
        }

        match adapter
            .write_descriptor(address, target, UUID_CCC_DESCRIPTOR, &value)
            .await
        {
            Ok(()) => {
                info!("Notifications enabled on {}", target);
                true
            }
            Err(e) => {
                error!("Failed to write CCC descriptor on {}: {}", target, e);
                false
            }
        }
    }

    /// Turn notifications off again, best effort
    pub async fn disable(
        &self,
        adapter: &SharedAdapter,
        session: &Session,
        target: &CharacteristicId,
    ) {
        let address = session.address();
        let Some((resolved, characteristic)) = session.locate(target) else {
            return;
        };
        let target = &resolved;
        if Self::subscription_value(&characteristic.properties).is_none() {
            return;
        }
        if characteristic.has_descriptor(UUID_CCC_DESCRIPTOR) {
            if let Err(e) = adapter
                .write_descriptor(address, target, UUID_CCC_DESCRIPTOR, &DISABLE_NOTIFICATION_VALUE)
                .await
            {
                debug!("Failed to clear CCC descriptor on {}: {}", target, e);
            }
        }
        if let Err(e) = adapter
            .set_characteristic_notification(address, target, false)
            .await
        {
            debug!("Failed to stop notifications on {}: {}", target, e);
        }
        info!("Notifications disabled on {}", target);
    }

    /// Forward a value pushed by the peer to every observer
    pub fn publish(&self, address: &str, characteristic: CharacteristicId, value: Vec<u8>) {
        debug!(
            "Characteristic {} changed on {}: {}",
            characteristic,
            address,
            to_hex(&value)
        );
        // no observers is fine
        let _ = self.tx.send(Notification {
            address: address.to_string(),
            characteristic,
            value,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

fn to_hex(value: &[u8]) -> String {
    value
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
