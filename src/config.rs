//! Daemon configuration.
//!
//! Loaded from `config.toml` in the user's config directory. Every field has a
//! default so a missing file or a partial file is fine.

use crate::device::{ManagedNetwork, NetworkLookup};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config file storage.
const APP_NAME: &str = "hostdev";

/// Config file name inside the application directory.
const CONFIG_FILENAME: &str = "config.toml";

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Firewall backend used for reverse path filtering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    /// nftables via the `nft` command.
    #[default]
    Nftables,
    /// No filtering.
    None,
}

impl std::fmt::Display for FirewallBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirewallBackend::Nftables => write!(f, "nftables"),
            FirewallBackend::None => write!(f, "none"),
        }
    }
}

/// A managed network known to this host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkDefinition {
    /// Network type (`wireguard`, `sriov`, `physical`, `bridge`).
    #[serde(rename = "type")]
    pub kind: String,

    /// Lifecycle status; only `created` networks may be used.
    #[serde(default = "default_network_status")]
    pub status: String,

    /// Network configuration keys.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

fn default_network_status() -> String {
    "created".to_string()
}

/// Global hostdev configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path of the volatile state database.
    pub state_db: PathBuf,

    /// Root under which per-instance device nodes are created.
    pub devices_dir: PathBuf,

    /// Mount point of sysfs.
    pub sysfs_root: PathBuf,

    /// Mount point of procfs.
    pub procfs_root: PathBuf,

    /// Per-address timeout of neighbour probes.
    #[serde(with = "humantime_serde")]
    pub neighbor_probe_timeout: Duration,

    /// Log output format.
    pub log_format: LogFormat,

    /// Firewall backend.
    pub firewall: FirewallBackend,

    /// Managed networks by name.
    pub networks: BTreeMap<String, NetworkDefinition>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join(APP_NAME);

        Self {
            state_db: data_dir.join("volatile.redb"),
            devices_dir: PathBuf::from("/var/lib/hostdev/devices"),
            sysfs_root: PathBuf::from("/sys"),
            procfs_root: PathBuf::from("/proc"),
            neighbor_probe_timeout: Duration::from_millis(100),
            log_format: LogFormat::Text,
            firewall: FirewallBackend::Nftables,
            networks: BTreeMap::new(),
        }
    }
}

impl DaemonConfig {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::ConfigLoad("could not determine config directory".into()))?;
        Ok(dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Load configuration from `path`, or the default location.
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text)
                .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(Error::ConfigLoad(format!("{}: {}", path.display(), e))),
        }
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::ConfigLoad(e.to_string()))
    }

    /// Save configuration to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = self.to_toml()?;
        std::fs::write(path, text).map_err(|e| Error::ConfigSave(e.to_string()))
    }

    /// Render configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))
    }
}

impl NetworkLookup for DaemonConfig {
    fn network(&self, _project: &str, name: &str) -> Result<ManagedNetwork> {
        let def = self
            .networks
            .get(name)
            .ok_or_else(|| Error::not_found(format!("network {:?}", name)))?;

        Ok(ManagedNetwork {
            name: name.to_string(),
            kind: def.kind.clone(),
            created: def.status == "created",
            config: def.config.clone(),
        })
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
