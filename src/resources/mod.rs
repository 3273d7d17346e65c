//! Shared host resource registry.
//!
//! Some host resources are shared between instances that start and stop
//! concurrently: VLAN sub-interfaces on a common parent, the SR-IOV virtual
//! functions of a card, a GPU's mdev slots, a PCI slot's driver binding.
//! [`HostResources`] is the only owner of "is X free" state. Each lock is
//! named after the resource it guards and held exactly across the
//! check-then-claim step.

mod sriov;

pub use sriov::{CardSelector, SriovClaims};

use crate::error::{Error, Result};
use crate::host::Host;
use crate::network::host_device_name;
use crate::storage::VolatileStore;
use parking_lot::{ArcMutexGuard, Mutex, MutexGuard, RawMutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Volatile key holding the VLAN interface a NIC runs on.
pub const VOLATILE_VLAN_PARENT: &str = "last_state.vlan.parent";

/// Held lock on one named resource.
pub type ResourceGuard = ArcMutexGuard<RawMutex, ()>;

/// A family of mutexes looked up by resource key.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Block until the lock for `key` is held.
    pub fn lock(&self, key: &str) -> ResourceGuard {
        let lock = self
            .locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone();
        lock.lock_arc()
    }
}

/// Who uses a shared resource: instance key and device name.
pub type ResourceUser = (String, String);

/// In-process registry of shared host resources.
#[derive(Default)]
pub struct HostResources {
    /// Serializes creation and removal of shared interfaces, keyed by
    /// interface name.
    shared_interfaces: KeyedLocks,
    vlan_users: Mutex<HashMap<String, BTreeSet<ResourceUser>>>,
    /// One global lock over every VF claim: scanning for a free VF, setting
    /// it up and recording it happen under it.
    sriov: Mutex<SriovClaims>,
    /// Serializes mdev allocation per parent GPU.
    mdev: KeyedLocks,
    /// Serializes driver rebinding per PCI slot.
    pci: KeyedLocks,
}

impl HostResources {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild in-memory claims from persisted volatile state.
    ///
    /// Run once at startup so claims made before a restart keep their
    /// resources.
    pub fn recover(&self, store: &dyn VolatileStore) -> Result<()> {
        let mut devices: HashMap<ResourceUser, HashMap<String, String>> = HashMap::new();
        for entry in store.list()? {
            devices
                .entry((entry.instance, entry.device))
                .or_default()
                .insert(entry.key, entry.value);
        }

        let mut sriov = self.sriov.lock();
        let mut vlans = self.vlan_users.lock();
        for ((instance, device), values) in devices {
            if let (Some(parent), Some(id)) = (
                values.get("last_state.vf.parent"),
                values.get("last_state.vf.id").and_then(|v| v.parse::<u32>().ok()),
            ) {
                let owner = format!("{}/{}", instance, device);
                tracing::debug!(%parent, vf = id, %owner, "recovered VF claim");
                sriov.restore(parent, id, &owner);
            }
            if let Some(vlan) = values.get(VOLATILE_VLAN_PARENT) {
                tracing::debug!(%vlan, %instance, %device, "recovered VLAN user");
                vlans
                    .entry(vlan.clone())
                    .or_default()
                    .insert((instance.clone(), device.clone()));
            }
        }
        Ok(())
    }

    /// Lock a shared interface by name.
    pub fn lock_interface(&self, name: &str) -> ResourceGuard {
        self.shared_interfaces.lock(name)
    }

    /// Lock the mdev slots of one GPU.
    pub fn lock_mdev(&self, pci_address: &str) -> ResourceGuard {
        self.mdev.lock(pci_address)
    }

    /// Lock the driver binding of one PCI slot.
    pub fn lock_pci(&self, slot: &str) -> ResourceGuard {
        self.pci.lock(slot)
    }

    /// Take the global SR-IOV lock.
    pub fn sriov(&self) -> MutexGuard<'_, SriovClaims> {
        self.sriov.lock()
    }

    /// Ensure the VLAN interface `parent.vlan` exists and register `user` on it.
    ///
    /// Returns the interface name and whether this call created it. Only the
    /// creator may later remove it.
    pub fn vlan_acquire(
        &self,
        host: &dyn Host,
        parent: &str,
        vlan: &str,
        gvrp: bool,
        user: ResourceUser,
    ) -> Result<(String, bool)> {
        let name = host_device_name(parent, vlan);
        let _guard = self.lock_interface(&name);

        let created = if host.interface_exists(&name) {
            tracing::debug!(interface = %name, "reusing existing VLAN interface");
            false
        } else {
            let id: u16 = vlan
                .parse()
                .map_err(|_| Error::validation("vlan", format!("invalid VLAN ID {:?}", vlan)))?;
            host.create_vlan(parent, &name, id, gvrp)?;
            tracing::info!(interface = %name, %parent, vlan = id, "created VLAN interface");
            true
        };

        self.vlan_users
            .lock()
            .entry(name.clone())
            .or_default()
            .insert(user);
        Ok((name, created))
    }

    /// Unregister `user` from a VLAN interface, removing the interface if
    /// `created` and nobody else uses it.
    pub fn vlan_release(&self, host: &dyn Host, name: &str, user: &ResourceUser, created: bool) -> Result<()> {
        let _guard = self.lock_interface(name);

        let remaining = {
            let mut users = self.vlan_users.lock();
            let remaining = match users.get_mut(name) {
                Some(set) => {
                    set.remove(user);
                    set.len()
                }
                None => 0,
            };
            if remaining == 0 {
                users.remove(name);
            }
            remaining
        };

        if !created {
            return Ok(());
        }
        if remaining > 0 {
            tracing::debug!(interface = %name, users = remaining, "VLAN interface still in use");
            return Ok(());
        }
        if host.interface_exists(name) {
            host.remove_interface(name)?;
            tracing::info!(interface = %name, "removed VLAN interface");
        }
        Ok(())
    }

    /// Number of registered users of a VLAN interface.
    pub fn vlan_user_count(&self, name: &str) -> usize {
        self.vlan_users.lock().get(name).map_or(0, BTreeSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use crate::storage::MemoryVolatileStore;
    use std::collections::HashMap;

    fn user(inst: &str, dev: &str) -> ResourceUser {
        (inst.to_string(), dev.to_string())
    }

    #[test]
    fn test_vlan_only_creator_removes() {
        let host = FakeHost::new().with_interface("eth0");
        let res = HostResources::new();

        let (name, first) = res
            .vlan_acquire(&host, "eth0", "10", false, user("default/c1", "eth0"))
            .unwrap();
        let (_, second) = res
            .vlan_acquire(&host, "eth0", "10", false, user("default/c2", "eth0"))
            .unwrap();
        assert_eq!(name, "eth0.10");
        assert!(first);
        assert!(!second);
        assert_eq!(host.op_count("create_vlan"), 1);
        assert_eq!(res.vlan_user_count("eth0.10"), 2);

        // The creator stops first while the second user is still running.
        res.vlan_release(&host, &name, &user("default/c1", "eth0"), true)
            .unwrap();
        assert!(host.has_link("eth0.10"));

        // The non-creator never removes it.
        res.vlan_release(&host, &name, &user("default/c2", "eth0"), false)
            .unwrap();
        assert!(host.has_link("eth0.10"));
        assert_eq!(host.op_count("remove_interface"), 0);
    }

    #[test]
    fn test_vlan_creator_removes_when_last() {
        let host = FakeHost::new().with_interface("eth0");
        let res = HostResources::new();
        let (name, created) = res
            .vlan_acquire(&host, "eth0", "20", true, user("default/c1", "eth0"))
            .unwrap();
        res.vlan_release(&host, &name, &user("default/c1", "eth0"), created)
            .unwrap();
        assert!(!host.has_link("eth0.20"));
        assert_eq!(res.vlan_user_count("eth0.20"), 0);
    }

    #[test]
    fn test_keyed_locks_are_per_key() {
        let locks = KeyedLocks::default();
        let a = locks.lock("a");
        // A different key must not block.
        let b = locks.lock("b");
        drop(a);
        drop(b);
        let _again = locks.lock("a");
    }

    #[test]
    fn test_recover_rebuilds_claims() {
        let store = MemoryVolatileStore::new();
        let values: HashMap<String, String> = [
            ("last_state.vf.parent", "eth1"),
            ("last_state.vf.id", "3"),
            (VOLATILE_VLAN_PARENT, "eth0.10"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        store.set("default/c1", "eth0", &values).unwrap();

        let res = HostResources::new();
        res.recover(&store).unwrap();
        assert_eq!(res.sriov().owner("eth1", 3), Some("default/c1/eth0"));
        assert_eq!(res.vlan_user_count("eth0.10"), 1);
    }
}
