//! Kernel event monitors.
//!
//! Two threads feed the [`HotplugRegistry`]: one reads USB uevents from the
//! kernel's netlink broadcast, the other watches the directories of
//! subscribed device node paths with inotify. Resulting [`HotplugEvent`]s
//! are sent to the caller's channel in arrival order.

use super::uevent::Uevent;
use super::{HotplugRegistry, UnixEvent};
use crate::error::Result;
use crate::host::Host;
use hostdev_protocol::{HotplugAction, HotplugEvent};
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

/// How often the threads look at the stop flag and resync watches.
const POLL_TIMEOUT_MS: i32 = 500;

const UEVENT_BUFFER: usize = 16 * 1024;
const INOTIFY_BUFFER: usize = 4096;

/// Running monitor threads.
pub struct Monitors {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Monitors {
    /// Start both monitors.
    pub fn spawn(
        registry: Arc<HotplugRegistry>,
        host: Arc<dyn Host>,
        sysfs_root: PathBuf,
        sink: Sender<HotplugEvent>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        let socket = uevent_socket()?;
        {
            let (registry, sink, stop) = (registry.clone(), sink.clone(), stop.clone());
            handles.push(
                std::thread::Builder::new()
                    .name("usb-monitor".into())
                    .spawn(move || usb_loop(socket, &registry, &sysfs_root, &sink, &stop))?,
            );
        }

        let inotify = inotify_fd()?;
        {
            let stop = stop.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("devnode-monitor".into())
                    .spawn(move || devnode_loop(inotify, &registry, host.as_ref(), &sink, &stop))?,
            );
        }

        tracing::info!("hotplug monitors started");
        Ok(Self { stop, handles })
    }

    /// Signal both threads and wait for them.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::warn!("hotplug monitor thread panicked");
            }
        }
    }
}

/// Netlink socket subscribed to kernel uevents.
fn uevent_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            libc::NETLINK_KOBJECT_UEVENT,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = 1;
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn inotify_fd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Wait until `fd` is readable. A signal counts as a timeout.
fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(pfd.revents & libc::POLLIN != 0)
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Serial number of a USB device from sysfs, empty when it has none.
fn usb_serial(sysfs_root: &Path, devpath: &str) -> String {
    std::fs::read_to_string(sysfs_root.join(devpath.trim_start_matches('/')).join("serial"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn usb_loop(
    socket: OwnedFd,
    registry: &HotplugRegistry,
    sysfs_root: &Path,
    sink: &Sender<HotplugEvent>,
    stop: &AtomicBool,
) {
    let fd = socket.as_raw_fd();
    let mut buf = vec![0u8; UEVENT_BUFFER];

    while !stop.load(Ordering::Relaxed) {
        match wait_readable(fd, POLL_TIMEOUT_MS) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(error = %e, "uevent monitor stopped");
                return;
            }
        }
        let n = match read_fd(fd, &mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted || e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read uevent");
                continue;
            }
        };

        let Some(uevent) = Uevent::parse(&buf[..n]) else {
            continue;
        };
        let Some(mut event) = uevent.usb_event() else {
            continue;
        };
        if event.action == HotplugAction::Add {
            event.serial = usb_serial(sysfs_root, uevent.devpath());
        }
        tracing::debug!(action = ?event.action, vendor = %event.vendor, product = %event.product, bus = event.busnum, dev = event.devnum, "USB uevent");

        for out in registry.dispatch_usb(&event) {
            if sink.send(out).is_err() {
                return;
            }
        }
    }
}

/// Directories currently watched, by watch descriptor.
struct Watches {
    fd: RawFd,
    dirs: HashMap<i32, PathBuf>,
}

impl Watches {
    /// Watch exactly the parent directories of `paths`.
    fn sync(&mut self, paths: &[PathBuf]) {
        let wanted: Vec<PathBuf> = paths
            .iter()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .collect();

        let stale: Vec<i32> = self
            .dirs
            .iter()
            .filter(|(_, dir)| !wanted.contains(dir))
            .map(|(wd, _)| *wd)
            .collect();
        for wd in stale {
            unsafe { libc::inotify_rm_watch(self.fd, wd) };
            self.dirs.remove(&wd);
        }

        for dir in wanted {
            if self.dirs.values().any(|d| *d == dir) {
                continue;
            }
            let Ok(cpath) = CString::new(dir.as_os_str().as_bytes()) else {
                continue;
            };
            let mask = libc::IN_CREATE | libc::IN_DELETE | libc::IN_MOVED_TO | libc::IN_MOVED_FROM;
            let wd = unsafe { libc::inotify_add_watch(self.fd, cpath.as_ptr(), mask) };
            if wd < 0 {
                // Retried on the next sync; the directory may not exist yet.
                tracing::debug!(dir = %dir.display(), error = %io::Error::last_os_error(), "cannot watch directory");
                continue;
            }
            tracing::debug!(dir = %dir.display(), "watching directory");
            self.dirs.insert(wd, dir);
        }
    }
}

/// Split an inotify read buffer into (watch descriptor, mask, name).
fn parse_inotify(buf: &[u8]) -> Vec<(i32, u32, String)> {
    let header = std::mem::size_of::<libc::inotify_event>();
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + header <= buf.len() {
        let event: libc::inotify_event =
            unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const libc::inotify_event) };
        let name_start = offset + header;
        let name_end = (name_start + event.len as usize).min(buf.len());
        let name = buf[name_start..name_end]
            .split(|b| *b == 0)
            .next()
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default();
        out.push((event.wd, event.mask, name));
        offset = name_end;
    }
    out
}

fn devnode_loop(
    inotify: OwnedFd,
    registry: &HotplugRegistry,
    host: &dyn Host,
    sink: &Sender<HotplugEvent>,
    stop: &AtomicBool,
) {
    let fd = inotify.as_raw_fd();
    let mut watches = Watches {
        fd,
        dirs: HashMap::new(),
    };
    let mut buf = vec![0u8; INOTIFY_BUFFER];

    while !stop.load(Ordering::Relaxed) {
        watches.sync(&registry.watched_paths());

        match wait_readable(fd, POLL_TIMEOUT_MS) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(error = %e, "device node monitor stopped");
                return;
            }
        }
        let n = match read_fd(fd, &mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted || e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read inotify events");
                continue;
            }
        };

        for (wd, mask, name) in parse_inotify(&buf[..n]) {
            let Some(dir) = watches.dirs.get(&wd) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let path = dir.join(&name);
            let action = if mask & (libc::IN_CREATE | libc::IN_MOVED_TO) != 0 {
                HotplugAction::Add
            } else {
                HotplugAction::Remove
            };
            let node = match action {
                HotplugAction::Add => match host.device_node(&path) {
                    Ok(Some(node)) => Some(node),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "cannot stat new path");
                        continue;
                    }
                },
                HotplugAction::Remove => None,
            };

            for out in registry.dispatch_unix(&UnixEvent { action, path, node }) {
                if sink.send(out).is_err() {
                    return;
                }
            }
        }
    }
}
