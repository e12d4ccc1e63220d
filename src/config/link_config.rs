use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::{
    BLUETOOTH_OPERATION_TIMEOUT_SECS, BOND_TIMEOUT_SECS, CONNECT_RETRY_DELAY_MS,
    CharacteristicId, ConnectionConfig, DEFAULT_ATT_MTU, MAX_ATT_MTU, MAX_CONNECT_ATTEMPTS,
    PREFERRED_MTU, UUID_PRINTER_CHAR, UUID_PRINTER_SERVICE, WRITE_TIMEOUT_SECS,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Service the scanner filters on and notifications live under
    pub service_uuid: Uuid,

    /// Characteristic print data is written to
    pub characteristic_uuid: Uuid,

    /// Connection attempts before giving up
    pub max_connect_attempts: u32,

    /// Pause between connection attempts (ms)
    pub retry_delay_ms: u64,

    /// MTU requested once the link is up
    pub preferred_mtu: u16,

    /// Bonding timeout (s), 0 waits forever
    pub bond_timeout_secs: u64,

    /// GATT connect and service discovery timeout (s)
    pub operation_timeout_secs: u64,

    /// Write acknowledgement timeout (s)
    pub write_timeout_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            service_uuid: UUID_PRINTER_SERVICE,
            characteristic_uuid: UUID_PRINTER_CHAR,
            max_connect_attempts: MAX_CONNECT_ATTEMPTS,
            retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            preferred_mtu: PREFERRED_MTU,
            bond_timeout_secs: BOND_TIMEOUT_SECS,
            operation_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            write_timeout_secs: WRITE_TIMEOUT_SECS,
        }
    }
}

impl LinkConfig {
    /// Rejects values the link cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connect_attempts == 0 {
            bail!("max_connect_attempts must be at least 1");
        }
        if !(DEFAULT_ATT_MTU..=MAX_ATT_MTU).contains(&self.preferred_mtu) {
            bail!(
                "preferred_mtu {} is outside {}..={}",
                self.preferred_mtu,
                DEFAULT_ATT_MTU,
                MAX_ATT_MTU
            );
        }
        if self.operation_timeout_secs == 0 || self.write_timeout_secs == 0 {
            bail!("operation and write timeouts must be positive");
        }
        Ok(())
    }

    pub fn target(&self) -> CharacteristicId {
        CharacteristicId::new(self.service_uuid, self.characteristic_uuid)
    }

    pub fn bond_timeout(&self) -> Option<Duration> {
        (self.bond_timeout_secs > 0).then(|| Duration::from_secs(self.bond_timeout_secs))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_attempts: self.max_connect_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            preferred_mtu: self.preferred_mtu,
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            bond_timeout: self.bond_timeout(),
            target: self.target(),
        }
    }
}
