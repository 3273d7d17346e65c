//! Watch command implementation.

use clap::Args;
use hostdev::config::DaemonConfig;
use hostdev::hotplug::monitor::Monitors;
use hostdev::manager::DeviceManager;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Start instances' devices and stream hotplug changes until interrupted.
#[derive(Args, Debug)]
pub struct WatchCmd {
    /// Instance definition files (TOML).
    #[arg(required = true)]
    pub instances: Vec<PathBuf>,
}

impl WatchCmd {
    /// Execute the watch command.
    pub fn run(self, config: &DaemonConfig) -> hostdev::Result<()> {
        let manager = DeviceManager::open(config)?;
        let instances = self
            .instances
            .iter()
            .map(|p| super::load_instance(p))
            .collect::<hostdev::Result<Vec<_>>>()?;

        for inst in &instances {
            let runs = manager.start(inst, None)?;
            super::print_runs(&runs)?;
            // Registers the hotplug handlers.
            DeviceManager::run_post_hooks(runs)?;
        }

        let (tx, rx) = mpsc::channel();
        let ctx = manager.context();
        let monitors = Monitors::spawn(ctx.hotplug.clone(), ctx.host.clone(), config.sysfs_root.clone(), tx)?;

        unsafe {
            libc::signal(libc::SIGINT, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
            libc::signal(libc::SIGTERM, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
        }
        eprintln!("Watching for hotplug events, press Ctrl-C to stop");

        while !STOP.load(Ordering::SeqCst) {
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "failed to render hotplug event"),
                },
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        monitors.stop();
        let mut result = Ok(());
        for inst in instances.iter().rev() {
            let stopped = manager
                .stop(inst, None)
                .and_then(DeviceManager::run_post_hooks);
            if let Err(e) = stopped {
                tracing::warn!(instance = %inst.key(), error = %e, "failed to stop devices");
                result = Err(e);
            }
        }
        result
    }
}
