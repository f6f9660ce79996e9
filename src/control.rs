//! JSON-over-TCP request/reply control surface for registered devices.
//!
//! The original ZeroMQ REP server (`dockserver_utils/server.py::AsyncZeroMQServer`)
//! is out of scope per spec.md §1 ("specified only as an interface to the
//! BufferHandler"); this is the idiomatic line-delimited JSON-over-TCP
//! substitute the spec invites. `register`/`callback` dispatch mirrors
//! `register_callback`/`handle_request`'s `self.callback[device](action)`.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use dashmap::DashMap;
use serde::Deserialize;

use crate::dialogue::DialogueState;

/// Fixed control-wire port spec.md §6 reserves.
pub const CONTROL_PORT: u16 = 11000;

#[derive(Debug, Deserialize)]
struct ControlRequest {
    device: String,
    action: String,
}

/// Registry of devices with dialogue processing, dispatching
/// `{device, action}` requests to the matching `DialogueState::callback`.
pub struct ControlEndpoint {
    devices: Arc<DashMap<String, Arc<DialogueState>>>,
}

impl ControlEndpoint {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(DashMap::new()),
        }
    }

    /// Builds an endpoint backed by an existing registry rather than a
    /// private one, so devices registered elsewhere (e.g. a
    /// `DeviceWatcher`'s `simulateCD` dialogues) are visible here as soon
    /// as they appear, with no separate sync step.
    pub fn with_devices(devices: Arc<DashMap<String, Arc<DialogueState>>>) -> Self {
        Self { devices }
    }

    pub fn register(&self, device: impl Into<String>, dialogue: Arc<DialogueState>) {
        let device = device.into();
        tracing::debug!(device = %device, "registered control callback");
        self.devices.insert(device, dialogue);
    }

    pub fn deregister(&self, device: &str) {
        tracing::debug!(device = %device, "deregistered control callback");
        self.devices.remove(device);
    }

    /// Dispatches a single request, returning the text reply. Unknown
    /// devices get `"Unknown device (<path>)."`, matching the original's
    /// `f"Unknown device ({device})."`.
    fn dispatch(&self, request: &ControlRequest) -> String {
        match self.devices.get(&request.device) {
            Some(dialogue) => dialogue.callback(&request.action),
            None => format!("Unknown device ({}).", request.device),
        }
    }

    fn handle_connection(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let mut writer = match stream.try_clone() {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "failed to clone control connection for writing");
                return;
            }
        };
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    tracing::debug!(?peer, error = %e, "control connection read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<ControlRequest>(&line) {
                Ok(request) => self.dispatch(&request),
                Err(e) => {
                    tracing::debug!(?peer, error = %e, "malformed control request");
                    format!("Malformed request: {e}")
                }
            };
            if writeln!(writer, "{response}").is_err() {
                break;
            }
        }
    }

    /// Runs the accept loop until `stop` is set. One connection is
    /// handled at a time per accepted socket, on its own thread; a fault
    /// in one connection's requests never brings down the listener.
    pub fn serve(self: Arc<Self>, listener: TcpListener, stop: Arc<AtomicBool>) {
        listener
            .set_nonblocking(true)
            .expect("control listener supports non-blocking mode");
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "accepted control connection");
                    let this = Arc::clone(&self);
                    thread::spawn(move || this.handle_connection(stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(std::time::Duration::from_millis(100));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "control listener accept failed");
                }
            }
        }
    }
}

impl Default for ControlEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CarrierDetect;

    #[test]
    fn unknown_device_is_reported() {
        let endpoint = ControlEndpoint::new();
        let response = endpoint.dispatch(&ControlRequest {
            device: "/dev/ttyUSB9".to_string(),
            action: "status".to_string(),
        });
        assert_eq!(response, "Unknown device (/dev/ttyUSB9).");
    }

    #[test]
    fn registered_device_dispatches_to_callback() {
        let endpoint = ControlEndpoint::new();
        let dialogue = Arc::new(DialogueState::new(CarrierDetect::Undefined));
        endpoint.register("/dev/ttyUSB0", dialogue);

        let response = endpoint.dispatch(&ControlRequest {
            device: "/dev/ttyUSB0".to_string(),
            action: "connect".to_string(),
        });
        assert_eq!(response, "Device connected.");
    }

    #[test]
    fn deregister_makes_device_unknown_again() {
        let endpoint = ControlEndpoint::new();
        let dialogue = Arc::new(DialogueState::new(CarrierDetect::Undefined));
        endpoint.register("/dev/ttyUSB0", dialogue);
        endpoint.deregister("/dev/ttyUSB0");

        let response = endpoint.dispatch(&ControlRequest {
            device: "/dev/ttyUSB0".to_string(),
            action: "status".to_string(),
        });
        assert_eq!(response, "Unknown device (/dev/ttyUSB0).");
    }

    #[test]
    fn request_json_parses_device_and_action() {
        let request: ControlRequest =
            serde_json::from_str(r#"{"device": "/dev/ttyUSB0", "action": "status"}"#).unwrap();
        assert_eq!(request.device, "/dev/ttyUSB0");
        assert_eq!(request.action, "status");
    }
}
