//! Device configuration model.
//!
//! A [`DeviceConfig`] is a flat string map. Missing keys read as the empty
//! string, which every validator treats as "unset".

use super::validate::{self, Check};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One device's declared configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfig(BTreeMap<String, String>);

impl DeviceConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `key`, or `""` when unset.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    /// Whether `key` is set to a non-empty value.
    pub fn has(&self, key: &str) -> bool {
        !self.get(key).is_empty()
    }

    /// Set `key`; empty values remove it.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        if value.is_empty() {
            self.0.remove(&key);
        } else {
            self.0.insert(key, value);
        }
    }

    /// Remove `key`.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Device type (`nic`, `gpu`, ...).
    pub fn kind(&self) -> &str {
        self.get("type")
    }

    /// Whether `key` parses as true.
    pub fn is_true(&self, key: &str) -> bool {
        validate::is_true(self.get(key))
    }

    /// Iterate over all keys.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Check every value against `rules` and reject unknown keys.
    ///
    /// `type`, `user.*` and `initial.*` are always accepted, as is the
    /// subtype selector of the device class (`nictype` for NICs, `gputype`
    /// for GPUs).
    pub fn validate(&self, rules: &Rules) -> Result<()> {
        for (field, check) in &rules.checks {
            check(self.get(field)).map_err(|reason| Error::validation(field.clone(), reason))?;
        }

        for key in self.0.keys() {
            if rules.checks.contains_key(key)
                || key == "type"
                || key.starts_with("user.")
                || key.starts_with("initial.")
            {
                continue;
            }
            let kind = self.kind();
            if (kind == "nic" || kind == "infiniband") && key == "nictype" {
                continue;
            }
            if kind == "gpu" && key == "gputype" {
                continue;
            }
            return Err(Error::UnknownOption(key.clone()));
        }
        Ok(())
    }

    /// Equality ignoring `user.*` keys, returning the keys that differ.
    fn diff_keys(&self, other: &DeviceConfig) -> Vec<String> {
        let keys: BTreeSet<&String> = self.0.keys().chain(other.0.keys()).collect();
        keys.into_iter()
            .filter(|k| !k.starts_with("user."))
            .filter(|k| self.get(k) != other.get(k))
            .cloned()
            .collect()
    }

    /// Equality ignoring `user.*` keys.
    pub fn equivalent(&self, other: &DeviceConfig) -> bool {
        self.diff_keys(other).is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DeviceConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = DeviceConfig::new();
        for (k, v) in iter {
            config.set(k, v);
        }
        config
    }
}

/// Validation rules keyed by field name.
#[derive(Default)]
pub struct Rules {
    checks: BTreeMap<String, Check>,
}

impl Rules {
    /// Empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the check for `field`.
    pub fn insert(&mut self, field: impl Into<String>, check: Check) -> &mut Self {
        self.checks.insert(field.into(), check);
        self
    }

    /// Accept every field in `fields` with any value.
    pub fn allow_any(&mut self, fields: &[&str]) -> &mut Self {
        for field in fields {
            self.insert(*field, Box::new(validate::is_any));
        }
        self
    }

    /// Whether `field` has a rule.
    pub fn contains(&self, field: &str) -> bool {
        self.checks.contains_key(field)
    }
}

/// All devices of one instance, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Devices(BTreeMap<String, DeviceConfig>);

/// Partition of a device list change.
#[derive(Debug, Default)]
pub struct DeviceChanges {
    /// Devices to stop and remove.
    pub removed: Devices,
    /// Devices to add and start.
    pub added: Devices,
    /// Devices whose only differences are live-updatable fields.
    pub updated: Devices,
    /// Every key that changed on a device present in both lists.
    pub changed_keys: Vec<String>,
}

impl Devices {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a device.
    pub fn get(&self, name: &str) -> Option<&DeviceConfig> {
        self.0.get(name)
    }

    /// Add or replace a device.
    pub fn insert(&mut self, name: impl Into<String>, config: DeviceConfig) {
        self.0.insert(name.into(), config);
    }

    /// Remove a device.
    pub fn remove(&mut self, name: &str) -> Option<DeviceConfig> {
        self.0.remove(name)
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &DeviceConfig)> {
        self.0.iter()
    }

    /// Device names in order.
    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no devices.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a device of this name with equivalent config exists.
    pub fn contains(&self, name: &str, config: &DeviceConfig) -> bool {
        self.get(name).is_some_and(|c| c.equivalent(config))
    }

    /// Overlay `other` on top of this list, later entries winning.
    pub fn merged_with(&self, other: &Devices) -> Devices {
        let mut out = self.clone();
        for (name, config) in other.iter() {
            out.insert(name.clone(), config.clone());
        }
        out
    }

    /// Compute what changes going from `self` to `new`.
    ///
    /// `updatable` returns, for an old/new pair of the same device, the keys
    /// the driver can apply without re-adding the device. When the remaining
    /// keys are equal the device lands in `updated` instead of
    /// `removed` + `added`.
    pub fn update<F>(&self, new: &Devices, updatable: F) -> Result<DeviceChanges>
    where
        F: Fn(&str, &DeviceConfig, &DeviceConfig) -> Result<Vec<String>>,
    {
        let mut changes = DeviceChanges::default();

        for (name, config) in self.iter() {
            if !new.contains(name, config) {
                changes.removed.insert(name.clone(), config.clone());
            }
        }
        for (name, config) in new.iter() {
            if !self.contains(name, config) {
                changes.added.insert(name.clone(), config.clone());
            }
        }

        let mut changed = BTreeSet::new();
        for name in changes.added.names() {
            let Some(old) = changes.removed.get(&name).cloned() else {
                continue;
            };
            let Some(new_config) = changes.added.get(&name).cloned() else {
                continue;
            };

            changed.extend(old.diff_keys(&new_config));

            let (mut old_cmp, mut new_cmp) = (old.clone(), new_config.clone());
            for key in updatable(&name, &old, &new_config)? {
                old_cmp.remove(&key);
                new_cmp.remove(&key);
            }

            if old_cmp.equivalent(&new_cmp) {
                changes.removed.remove(&name);
                changes.added.remove(&name);
                changes.updated.insert(name, new_config);
            }
        }

        changes.changed_keys = changed.into_iter().collect();
        Ok(changes)
    }
}

impl FromIterator<(String, DeviceConfig)> for Devices {
    fn from_iter<I: IntoIterator<Item = (String, DeviceConfig)>>(iter: I) -> Self {
        Devices(iter.into_iter().collect())
    }
}
