//! Volatile state storage.
//!
//! Volatile state is the set of host-generated facts a device records while
//! it is attached: the host-side interface name, the driver a PCI slot was
//! bound to, whether a VLAN interface was created or reused. It is keyed by
//! instance and device name and must outlive the daemon process.
//!
//! # Backends
//!
//! - [`RedbVolatileStore`]: persistent, a single redb table
//! - [`MemoryVolatileStore`]: in-process, for dry runs and tests
//!
//! # Key layout
//!
//! ```text
//! <project>/<instance> \0 <device> \0 <key>  ->  <value>
//! ```
//!
//! Writing an empty value deletes the key, so "cleared" and "never set" are
//! indistinguishable to readers.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

const VOLATILE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("volatile");

/// Key separator; instance, device and key names never contain NUL.
const SEP: char = '\0';

/// One stored volatile key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolatileEntry {
    /// Instance key (`project/name`).
    pub instance: String,
    /// Device name.
    pub device: String,
    /// Volatile key.
    pub key: String,
    /// Value.
    pub value: String,
}

/// Persistence backend for volatile state.
pub trait VolatileStore: Send + Sync {
    /// All keys of one device.
    fn get(&self, instance: &str, device: &str) -> Result<HashMap<String, String>>;

    /// Write keys of one device; empty values delete.
    fn set(&self, instance: &str, device: &str, values: &HashMap<String, String>) -> Result<()>;

    /// Every stored key, ordered by instance then device then key.
    fn list(&self) -> Result<Vec<VolatileEntry>>;
}

fn db_err(e: impl std::fmt::Display) -> Error {
    Error::Database(e.to_string())
}

fn prefix(instance: &str, device: &str) -> String {
    format!("{instance}{SEP}{device}{SEP}")
}

fn split_key(raw: &str) -> Option<(&str, &str, &str)> {
    let mut parts = raw.splitn(3, SEP);
    Some((parts.next()?, parts.next()?, parts.next()?))
}

/// redb-backed volatile store.
pub struct RedbVolatileStore {
    db: Database,
}

impl RedbVolatileStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(db_err)?;

        // Make sure the table exists so read transactions never fail on a
        // fresh database.
        let txn = db.begin_write().map_err(db_err)?;
        txn.open_table(VOLATILE_TABLE).map_err(db_err)?;
        txn.commit().map_err(db_err)?;

        tracing::debug!(path = %path.display(), "opened volatile store");
        Ok(Self { db })
    }
}

impl VolatileStore for RedbVolatileStore {
    fn get(&self, instance: &str, device: &str) -> Result<HashMap<String, String>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(VOLATILE_TABLE).map_err(db_err)?;
        let prefix = prefix(instance, device);

        let mut out = HashMap::new();
        for item in table.range(prefix.as_str()..).map_err(db_err)? {
            let (k, v) = item.map_err(db_err)?;
            let Some(key) = k.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            out.insert(key.to_string(), v.value().to_string());
        }
        Ok(out)
    }

    fn set(&self, instance: &str, device: &str, values: &HashMap<String, String>) -> Result<()> {
        let prefix = prefix(instance, device);
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(VOLATILE_TABLE).map_err(db_err)?;
            for (key, value) in values {
                let full = format!("{prefix}{key}");
                if value.is_empty() {
                    table.remove(full.as_str()).map_err(db_err)?;
                } else {
                    table.insert(full.as_str(), value.as_str()).map_err(db_err)?;
                }
            }
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<VolatileEntry>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(VOLATILE_TABLE).map_err(db_err)?;

        let mut out = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (k, v) = item.map_err(db_err)?;
            if let Some((instance, device, key)) = split_key(k.value()) {
                out.push(VolatileEntry {
                    instance: instance.to_string(),
                    device: device.to_string(),
                    key: key.to_string(),
                    value: v.value().to_string(),
                });
            }
        }
        Ok(out)
    }
}

/// In-memory volatile store.
#[derive(Default)]
pub struct MemoryVolatileStore {
    entries: RwLock<BTreeMap<(String, String), BTreeMap<String, String>>>,
}

impl MemoryVolatileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VolatileStore for MemoryVolatileStore {
    fn get(&self, instance: &str, device: &str) -> Result<HashMap<String, String>> {
        let entries = self.entries.read();
        Ok(entries
            .get(&(instance.to_string(), device.to_string()))
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn set(&self, instance: &str, device: &str, values: &HashMap<String, String>) -> Result<()> {
        let mut entries = self.entries.write();
        let slot = entries
            .entry((instance.to_string(), device.to_string()))
            .or_default();
        for (key, value) in values {
            if value.is_empty() {
                slot.remove(key);
            } else {
                slot.insert(key.clone(), value.clone());
            }
        }
        if slot.is_empty() {
            entries.remove(&(instance.to_string(), device.to_string()));
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<VolatileEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .flat_map(|((instance, device), keys)| {
                keys.iter().map(move |(key, value)| VolatileEntry {
                    instance: instance.clone(),
                    device: device.clone(),
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect())
    }
}

/// One device's slice of the volatile store.
///
/// Drivers only ever hold this handle, never the store itself, so they
/// cannot write another device's keys.
#[derive(Clone)]
pub struct Volatile {
    store: Arc<dyn VolatileStore>,
    instance: String,
    device: String,
}

impl Volatile {
    /// Scope `store` to one device.
    pub fn new(store: Arc<dyn VolatileStore>, instance: &str, device: &str) -> Self {
        Self {
            store,
            instance: instance.to_string(),
            device: device.to_string(),
        }
    }

    /// All keys of this device.
    pub fn get(&self) -> Result<HashMap<String, String>> {
        self.store.get(&self.instance, &self.device)
    }

    /// Write keys; empty values delete.
    pub fn set(&self, values: &HashMap<String, String>) -> Result<()> {
        tracing::trace!(instance = %self.instance, device = %self.device, keys = values.len(), "volatile set");
        self.store.set(&self.instance, &self.device, values)
    }

    /// Clear `keys`.
    pub fn clear(&self, keys: &[&str]) -> Result<()> {
        let values = keys
            .iter()
            .map(|k| (k.to_string(), String::new()))
            .collect();
        self.set(&values)
    }

    /// Whether no keys are stored for this device.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.get()?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> HashMap<String, String> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn exercise(store: &dyn VolatileStore) {
        store
            .set("default/c1", "eth0", &pairs(&[("host_name", "veth1"), ("last_state.created", "true")]))
            .unwrap();
        store
            .set("default/c1", "eth00", &pairs(&[("host_name", "veth2")]))
            .unwrap();
        store
            .set("default/c2", "eth0", &pairs(&[("host_name", "veth3")]))
            .unwrap();

        // Prefix scans must not bleed into devices sharing a name prefix.
        let got = store.get("default/c1", "eth0").unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["host_name"], "veth1");

        // Empty values delete.
        store
            .set("default/c1", "eth0", &pairs(&[("host_name", ""), ("last_state.created", "")]))
            .unwrap();
        assert!(store.get("default/c1", "eth0").unwrap().is_empty());

        let all = store.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].device, "eth00");
        assert_eq!(all[1].instance, "default/c2");
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryVolatileStore::new());
    }

    #[test]
    fn test_redb_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbVolatileStore::open(&dir.path().join("state").join("volatile.redb")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_redb_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volatile.redb");
        {
            let store = RedbVolatileStore::open(&path).unwrap();
            store
                .set("default/vm1", "gpu", &pairs(&[("vgpu.uuid", "abc")]))
                .unwrap();
        }
        let store = RedbVolatileStore::open(&path).unwrap();
        assert_eq!(store.get("default/vm1", "gpu").unwrap()["vgpu.uuid"], "abc");
    }

    #[test]
    fn test_volatile_handle_is_scoped() {
        let store: Arc<dyn VolatileStore> = Arc::new(MemoryVolatileStore::new());
        let a = Volatile::new(store.clone(), "default/c1", "eth0");
        let b = Volatile::new(store, "default/c1", "eth1");

        a.set(&pairs(&[("host_name", "veth1")])).unwrap();
        assert!(b.is_empty().unwrap());

        a.clear(&["host_name"]).unwrap();
        assert!(a.is_empty().unwrap());
    }
}
