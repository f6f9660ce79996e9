//! Top-level composition for the `serial-tcp-connector` binary.
//!
//! Wires a [`DeviceWatcher`] and a [`ControlEndpoint`] together, sharing
//! the watcher's per-device dialogue registry live with the control
//! endpoint, and collapses the watcher's fatal [`ExitCode`] down to the
//! process exit code spec.md §6 reserves. Grounded on `sergw::main`'s
//! composition of `server::run_listen` + `ctrlc` shutdown wiring.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::control::{ControlEndpoint, CONTROL_PORT};
use crate::device_watcher::DeviceWatcher;
use crate::forwarder::ExitCode;

/// Parent directory DeviceWatcher scans and watches for device nodes,
/// per spec.md §4.2 ("typically `/dev/`").
const DEVICE_TOP_DIRECTORY: &str = "/dev/";

/// Runs the connector: starts the control endpoint on its own thread, then
/// blocks on the device watcher until a fatal outcome or external
/// shutdown. Returns the process exit code spec.md §6 reserves (0
/// normal, 1-4 for `ErrSerial`/`ErrTCP`/`ErrSerialInit`/`ErrTCPInit`).
pub fn run(config: &Config) -> i32 {
    let watcher = DeviceWatcher::new(
        DEVICE_TOP_DIRECTORY,
        config.serial.devices.clone(),
        config.tcp.server.clone(),
        config.tcp.port,
        config.serial.options.clone(),
    );

    let control = Arc::new(ControlEndpoint::with_devices(watcher.dialogues()));

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || {
            tracing::info!("received shutdown signal");
            stop.store(true, Ordering::Relaxed);
        }) {
            tracing::warn!(error = %e, "failed to install Ctrl-C handler");
        }
    }

    match TcpListener::bind(("0.0.0.0", CONTROL_PORT)) {
        Ok(listener) => {
            let control = Arc::clone(&control);
            let stop = Arc::clone(&stop);
            thread::spawn(move || control.serve(listener, stop));
            tracing::info!(port = CONTROL_PORT, "control endpoint listening");
        }
        Err(e) => {
            tracing::error!(port = CONTROL_PORT, error = %e, "failed to bind control endpoint");
        }
    }

    let code = watcher.run();
    if !code.is_none() {
        tracing::error!(?code, "device watcher exited with a fatal fault");
    }
    code.process_exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_zero_is_ok() {
        assert_eq!(ExitCode::NO_ERROR.process_exit_code(), 0);
    }
}
