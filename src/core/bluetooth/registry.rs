//! Paired and scanned device sets
//! Devices are deduplicated by address and an address is never in both sets.
//! Each set is published as a snapshot whenever it changes.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use tokio::sync::watch;

use crate::core::bluetooth::types::{BondState, Device};

#[derive(Default)]
struct DeviceSets {
    paired: Vec<Device>,
    scanned: Vec<Device>,
}

impl DeviceSets {
    fn contains(set: &[Device], address: &str) -> bool {
        set.iter().any(|d| d.address == address)
    }
}

/// Registry of the devices known to the link core
pub struct DeviceRegistry {
    sets: Mutex<DeviceSets>,
    paired_tx: watch::Sender<Vec<Device>>,
    scanned_tx: watch::Sender<Vec<Device>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(DeviceSets::default()),
            paired_tx: watch::Sender::new(Vec::new()),
            scanned_tx: watch::Sender::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceSets> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a device to the scanned set unless its address is already known.
    /// Returns true if the scanned set changed.
    pub fn record_discovered(&self, device: Device) -> bool {
        let mut sets = self.lock();
        if DeviceSets::contains(&sets.paired, &device.address)
            || DeviceSets::contains(&sets.scanned, &device.address)
        {
            return false;
        }
        debug!("Recording scanned device {} ({:?})", device.address, device.name);
        sets.scanned.push(device);
        self.scanned_tx.send_replace(sets.scanned.clone());
        true
    }

    /// Adds a device to the paired set and drops it from the scanned set.
    /// Returns true if either set changed.
    pub fn record_bonded(&self, device: Device) -> bool {
        let mut sets = self.lock();
        let mut changed = false;

        let before = sets.scanned.len();
        sets.scanned.retain(|d| d.address != device.address);
        if sets.scanned.len() != before {
            self.scanned_tx.send_replace(sets.scanned.clone());
            changed = true;
        }

        if !DeviceSets::contains(&sets.paired, &device.address) {
            info!("Recording paired device {} ({:?})", device.address, device.name);
            sets.paired.push(device);
            self.paired_tx.send_replace(sets.paired.clone());
            changed = true;
        }
        changed
    }

    /// Routes a snapshot by its bond state
    pub fn record(&self, device: Device) -> bool {
        match device.bond_state {
            BondState::Bonded => self.record_bonded(device),
            BondState::None | BondState::Bonding => self.record_discovered(device),
        }
    }

    /// Moves a scanned device that has just bonded into the paired set
    pub fn promote_bonded(&self, address: &str) -> bool {
        let scanned = {
            let sets = self.lock();
            sets.scanned.iter().find(|d| d.address == address).cloned()
        };
        match scanned {
            Some(device) => self.record_bonded(device.with_bond_state(BondState::Bonded)),
            None => false,
        }
    }

    pub fn paired_devices(&self) -> Vec<Device> {
        self.lock().paired.clone()
    }

    pub fn scanned_devices(&self) -> Vec<Device> {
        self.lock().scanned.clone()
    }

    pub fn subscribe_paired(&self) -> watch::Receiver<Vec<Device>> {
        self.paired_tx.subscribe()
    }

    pub fn subscribe_scanned(&self) -> watch::Receiver<Vec<Device>> {
        self.scanned_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str, bond_state: BondState) -> Device {
        Device::new(address, Some(format!("Printer {address}")), bond_state)
    }

    fn assert_disjoint(registry: &DeviceRegistry) {
        let paired = registry.paired_devices();
        for scanned in registry.scanned_devices() {
            assert!(
                !paired.iter().any(|p| p.address == scanned.address),
                "{} is in both sets",
                scanned.address
            );
        }
    }

    #[test]
    fn test_rediscovery_does_not_duplicate() {
        let registry = DeviceRegistry::new();
        assert!(registry.record_discovered(device("11:22:33:44:55:66", BondState::None)));
        assert!(!registry.record_discovered(device("11:22:33:44:55:66", BondState::None)));
        assert_eq!(registry.scanned_devices().len(), 1);
    }

    #[test]
    fn test_bonded_device_stays_out_of_scanned_set() {
        let registry = DeviceRegistry::new();
        let printer = device("AA:BB:CC:DD:EE:FF", BondState::Bonded);
        registry.record_bonded(printer.clone());
        assert!(!registry.record_discovered(printer.with_bond_state(BondState::None)));

        assert_eq!(registry.paired_devices(), vec![printer]);
        assert!(registry.scanned_devices().is_empty());
    }

    #[test]
    fn test_record_bonded_moves_out_of_scanned_set() {
        let registry = DeviceRegistry::new();
        registry.record_discovered(device("AA:BB:CC:DD:EE:FF", BondState::None));
        registry.record_discovered(device("11:22:33:44:55:66", BondState::None));
        registry.record_bonded(device("AA:BB:CC:DD:EE:FF", BondState::Bonded));

        assert_eq!(registry.paired_devices().len(), 1);
        assert_eq!(registry.scanned_devices().len(), 1);
        assert_eq!(registry.scanned_devices()[0].address, "11:22:33:44:55:66");
        assert_disjoint(&registry);
    }

    #[test]
    fn test_promote_bonded_uses_scanned_snapshot() {
        let registry = DeviceRegistry::new();
        registry.record_discovered(device("AA:BB:CC:DD:EE:FF", BondState::None));
        assert!(registry.promote_bonded("AA:BB:CC:DD:EE:FF"));
        assert!(!registry.promote_bonded("AA:BB:CC:DD:EE:FF"));

        let paired = registry.paired_devices();
        assert_eq!(paired.len(), 1);
        assert_eq!(paired[0].bond_state, BondState::Bonded);
        assert_eq!(paired[0].name.as_deref(), Some("Printer AA:BB:CC:DD:EE:FF"));
        assert!(registry.scanned_devices().is_empty());
    }

    #[test]
    fn test_sets_stay_disjoint_for_mixed_sequences() {
        let registry = DeviceRegistry::new();
        let addresses = ["A0", "A1", "A2", "A3"];
        for round in 0..8 {
            for (i, address) in addresses.iter().enumerate() {
                let state = if (round + i) % 3 == 0 {
                    BondState::Bonded
                } else {
                    BondState::None
                };
                registry.record(device(address, state));
                if round % 2 == 1 {
                    registry.promote_bonded(address);
                }
                assert_disjoint(&registry);
            }
        }
    }

    #[test]
    fn test_snapshots_are_pushed_only_on_change() {
        let registry = DeviceRegistry::new();
        let mut scanned = registry.subscribe_scanned();
        let mut paired = registry.subscribe_paired();

        registry.record_discovered(device("AA:BB:CC:DD:EE:FF", BondState::None));
        assert!(scanned.has_changed().unwrap());
        assert_eq!(scanned.borrow_and_update().len(), 1);

        registry.record_discovered(device("AA:BB:CC:DD:EE:FF", BondState::None));
        assert!(!scanned.has_changed().unwrap());

        registry.record_bonded(device("AA:BB:CC:DD:EE:FF", BondState::Bonded));
        assert!(scanned.has_changed().unwrap());
        assert!(scanned.borrow_and_update().is_empty());
        assert!(paired.has_changed().unwrap());
        assert_eq!(paired.borrow_and_update().len(), 1);
    }

    #[test]
    fn test_concurrent_recording_keeps_sets_disjoint() {
        let registry = std::sync::Arc::new(DeviceRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let address = format!("DEV-{}", i % 10);
                        if (i + worker) % 2 == 0 {
                            registry.record_bonded(device(&address, BondState::Bonded));
                        } else {
                            registry.record_discovered(device(&address, BondState::None));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_disjoint(&registry);
        assert_eq!(
            registry.paired_devices().len() + registry.scanned_devices().len(),
            10
        );
    }
}
