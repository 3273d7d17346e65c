//! hostdev - instance device lifecycle manager.
//!
//! hostdev attaches, reconciles and detaches host-side resources for
//! containers and virtual machines: virtual NICs, PCI and USB passthrough,
//! GPU mediated devices and device nodes. It never launches instances
//! itself; every lifecycle call returns a descriptor for the instance
//! runtime to consume.
//!
//! # Architecture
//!
//! ```text
//! DeviceManager ──► Driver (nic/pci/gpu/usb/unix) ──► Host (kernel)
//!       │                 │
//!       │                 ├──► HostResources (shared locks and claims)
//!       │                 └──► Volatile (per-device persisted facts)
//!       └──► RunConfig + post hooks ──► instance runtime
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod hotplug;
pub mod instance;
pub mod manager;
pub mod network;
pub mod resources;
pub mod storage;

pub use error::{Error, Result};

/// Version of the hostdev library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
