//! Watches a TTY parent directory and spawns a [`Forwarder`] per configured
//! device as it appears.
//!
//! Grounded on the `notify`-crate watcher shape in
//! `Tonksthebear-trybotster::file_watcher::FileWatcher` (a `RecommendedWatcher`
//! feeding a channel), and on `dockserver_utils/serial2tcp.py::SerialDeviceForwarder`,
//! whose `active_connections` list this module's `active` set mirrors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::constants::{CarrierDetect, SerialOptions};
use crate::dialogue::DialogueState;
use crate::forwarder::{CdSource, ExitCode, Forwarder};

/// udev needs a moment to finish creating device nodes and permissions
/// after a CREATE event; matches the original's 0.5s `add_new_glider` settle.
const DEVICE_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Outcome of classifying a finished Forwarder for the Supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOutcome {
    /// Server-side fault: the whole process should exit with this code.
    Fatal(ExitCode),
    /// Serial-side fault or clean exit: the device slot is freed and may
    /// be retaken when the TTY reappears.
    Retryable,
}

/// Classifies a Forwarder's [`ExitCode`] per spec.md §4.2's fatal-error
/// mapping: a TCP-side fault means the dockserver itself is unreachable,
/// which nothing short of a restart fixes.
pub fn classify_exit(code: ExitCode) -> DeviceOutcome {
    if code.contains(ExitCode::ERR_TCP) || code.contains(ExitCode::ERR_TCP_INIT) {
        DeviceOutcome::Fatal(code)
    } else {
        DeviceOutcome::Retryable
    }
}

/// Filters `devices` down to those whose path already exists under
/// `top_directory` (or anywhere, since device paths are already absolute).
pub fn already_present(devices: &[String]) -> Vec<String> {
    devices
        .iter()
        .filter(|d| Path::new(d).exists())
        .cloned()
        .collect()
}

pub struct DeviceWatcher {
    top_directory: PathBuf,
    devices: Vec<String>,
    host: String,
    port: u16,
    serial_options: HashMap<String, SerialOptions>,
    dialogues: Arc<DashMap<String, Arc<DialogueState>>>,
}

impl DeviceWatcher {
    pub fn new(
        top_directory: impl Into<PathBuf>,
        devices: Vec<String>,
        host: impl Into<String>,
        port: u16,
        serial_options: HashMap<String, SerialOptions>,
    ) -> Self {
        Self {
            top_directory: top_directory.into(),
            devices,
            host: host.into(),
            port,
            serial_options,
            dialogues: Arc::new(DashMap::new()),
        }
    }

    /// Shared registry of every device's [`DialogueState`], keyed by device
    /// path. The Supervisor wires this into [`crate::control::ControlEndpoint`]
    /// so control-wire commands reach the same dialogue instance each
    /// Forwarder tees its serial reads into (and, for `simulateCD` devices,
    /// the same instance the CD monitor reads `cd()` from).
    pub fn dialogues(&self) -> Arc<DashMap<String, Arc<DialogueState>>> {
        Arc::clone(&self.dialogues)
    }

    fn spawn_forwarder(
        &self,
        device: String,
        active: &Arc<DashMap<String, ()>>,
        result_tx: channel::Sender<(String, ExitCode)>,
    ) {
        spawn_forwarder(&device, &self.host, self.port, &self.serial_options, active, &self.dialogues, result_tx);
    }

    /// Scans for already-present devices, spawns their forwarders, then
    /// watches `top_directory` for newly appearing ones. Blocks until a
    /// fatal Forwarder outcome or the watch itself fails, returning the
    /// code the Supervisor should exit the process with.
    pub fn run(&self) -> ExitCode {
        let active: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());
        let (result_tx, result_rx) = channel::unbounded::<(String, ExitCode)>();

        for device in already_present(&self.devices) {
            self.spawn_forwarder(device, &active, result_tx.clone());
        }

        let (notify_tx, notify_rx) = channel::unbounded::<notify::Result<Event>>();
        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = notify_tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "failed to create device watcher");
                return ExitCode::ERR_TCP_INIT;
            }
        };
        if let Err(e) = watcher.watch(&self.top_directory, RecursiveMode::NonRecursive) {
            tracing::error!(top_directory = %self.top_directory.display(), error = %e, "failed to watch device directory");
            return ExitCode::ERR_TCP_INIT;
        }

        loop {
            let mut sel = channel::Select::new();
            let notify_idx = sel.recv(&notify_rx);
            let result_idx = sel.recv(&result_rx);
            let index = sel.ready();

            if index == notify_idx {
                match notify_rx.try_recv() {
                    Ok(Ok(event)) => self.handle_event(event, &active, result_tx.clone()),
                    Ok(Err(e)) => tracing::warn!(error = %e, "device watcher error"),
                    Err(channel::TryRecvError::Empty) => continue,
                    Err(channel::TryRecvError::Disconnected) => {
                        tracing::error!("device watch loop ended unexpectedly");
                        return ExitCode::ERR_TCP_INIT;
                    }
                }
            } else if index == result_idx {
                match result_rx.try_recv() {
                    Ok((device, code)) => {
                        active.remove(&device);
                        match classify_exit(code) {
                            DeviceOutcome::Fatal(code) => {
                                tracing::error!(device = %device, ?code, "fatal forwarder outcome, shutting down");
                                return code;
                            }
                            DeviceOutcome::Retryable => {
                                tracing::warn!(device = %device, ?code, "forwarder exited, device may reconnect");
                            }
                        }
                    }
                    Err(channel::TryRecvError::Empty) => continue,
                    Err(channel::TryRecvError::Disconnected) => unreachable!("result_tx outlives the select loop"),
                }
            }
        }
    }

    fn handle_event(
        &self,
        event: Event,
        active: &Arc<DashMap<String, ()>>,
        result_tx: channel::Sender<(String, ExitCode)>,
    ) {
        // DELETE is watched (registered below via notify's default event
        // mask) but deliberately a no-op here: the original's
        // `SerialDeviceForwarder.process_file` only acts on `change == 1`
        // (added), relying on the Forwarder's own serial-read failure to
        // notice a vanished device.
        if !matches!(event.kind, EventKind::Create(_)) {
            return;
        }
        for path in event.paths {
            let Some(path_str) = path.to_str() else { continue };
            if !self.devices.iter().any(|d| d == path_str) {
                continue;
            }
            if active.contains_key(path_str) {
                continue;
            }
            let host = self.host.clone();
            let port = self.port;
            let serial_options = self.serial_options.clone();
            let active = Arc::clone(active);
            let dialogues = Arc::clone(&self.dialogues);
            let result_tx = result_tx.clone();
            let device_for_settle = path_str.to_string();
            thread::spawn(move || {
                thread::sleep(DEVICE_SETTLE_DELAY);
                if active.contains_key(&device_for_settle) || !Path::new(&device_for_settle).exists() {
                    return;
                }
                spawn_forwarder(
                    &device_for_settle,
                    &host,
                    port,
                    &serial_options,
                    &active,
                    &dialogues,
                    result_tx,
                );
            });
        }
    }
}

/// Every device gets a [`DialogueState`], regardless of `serial-options`:
/// the control surface (§4.7) needs somewhere to dispatch `connect` /
/// `disconnect` / `status` for any registered device, not only ones in
/// `simulateCD` mode. Get-or-inserts so repeated spawns of the same
/// device (a retried forwarder slot) reuse the same dialogue instance
/// rather than resetting its memory.
fn dialogue_for(device: &str, dialogues: &DashMap<String, Arc<DialogueState>>) -> Arc<DialogueState> {
    dialogues
        .entry(device.to_string())
        .or_insert_with(|| Arc::new(DialogueState::new(CarrierDetect::Undefined)))
        .clone()
}

fn cd_source_for(device: &str, serial_options: &HashMap<String, SerialOptions>, dialogue: &Arc<DialogueState>) -> CdSource {
    match serial_options.get(device) {
        Some(SerialOptions::Direct) => CdSource::Direct,
        Some(SerialOptions::SimulateCd) => CdSource::Simulated(Arc::clone(dialogue)),
        Some(SerialOptions::None) | None => CdSource::Hardware,
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_forwarder(
    device: &str,
    host: &str,
    port: u16,
    serial_options: &HashMap<String, SerialOptions>,
    active: &Arc<DashMap<String, ()>>,
    dialogues: &Arc<DashMap<String, Arc<DialogueState>>>,
    result_tx: channel::Sender<(String, ExitCode)>,
) {
    active.insert(device.to_string(), ());
    let dialogue = dialogue_for(device, dialogues);
    let cd_source = cd_source_for(device, serial_options, &dialogue);
    let host = host.to_string();
    let dev = device.to_string();
    tracing::info!(device = %dev, "spawning forwarder");
    thread::spawn(move || {
        let forwarder = Forwarder::new(dev.clone(), host, port, cd_source).with_dialogue(dialogue);
        let code = forwarder.run();
        let _ = result_tx.send((dev, code));
    });
}
