//! Dialogue state machine over a serial device's text stream.
//!
//! Ported from `dockserver_utils/bufferhandler.py::BufferHandler`. Runs a
//! dedicated processing thread fed by a crossbeam channel (the original's
//! `asyncio.Queue` with a 1s `wait_for` timeout), applying the fixed parser
//! list from [`crate::parsers`] and driving an idle [`Timer`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as channel;

use crate::constants::CarrierDetect;
use crate::parsers::{parse_line, LineAssembler, ParserEvent};
use crate::timer::Timer;

/// A single value stored in `DialogueState::memory`.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryValue {
    Connection(CarrierDetect),
    Bool(bool),
    Str(String),
    Epoch(i64),
    LatLon(f64, f64),
}

/// Memory keys that survive [`DialogueInner::clear_volatile`], matching
/// `BufferHandler.clear_memory`'s protected list verbatim — including its
/// quirk that `"VehicleName"` (the protected key) never actually matches
/// the key a `VehicleNameParser` emission is stored under
/// (`"VehicleNameParser"`). See DESIGN.md for the rationale for keeping
/// this as-is rather than "fixing" it.
const PROTECTED_KEYS: [&str; 3] = ["connection", "VehicleName", "running"];

struct DialogueInner {
    memory: HashMap<String, MemoryValue>,
}

impl DialogueInner {
    fn new(initial_cd: CarrierDetect) -> Self {
        let mut memory = HashMap::new();
        memory.insert("connection".to_string(), MemoryValue::Connection(initial_cd));
        memory.insert("running".to_string(), MemoryValue::Bool(false));
        Self { memory }
    }

    fn connection(&self) -> CarrierDetect {
        match self.memory.get("connection") {
            Some(MemoryValue::Connection(cd)) => *cd,
            _ => CarrierDetect::Undefined,
        }
    }

    fn set_connection(&mut self, cd: CarrierDetect) {
        self.memory.insert("connection".to_string(), MemoryValue::Connection(cd));
    }

    fn set_running(&mut self, running: bool) {
        self.memory.insert("running".to_string(), MemoryValue::Bool(running));
    }

    fn is_running(&self) -> bool {
        matches!(self.memory.get("running"), Some(MemoryValue::Bool(true)))
    }

    fn clear_volatile(&mut self) {
        self.memory.retain(|k, _| PROTECTED_KEYS.contains(&k.as_str()));
    }

    fn apply_event(&mut self, event: &ParserEvent) {
        let key = event.key();
        let value = match event {
            ParserEvent::VehicleName(s) => MemoryValue::Str(s.clone()),
            ParserEvent::GliderLabDos(s) => MemoryValue::Str(s.clone()),
            ParserEvent::GpsTime(t) => MemoryValue::Epoch(*t),
            ParserEvent::GpsLatLon(lat, lon) => MemoryValue::LatLon(*lat, *lon),
            ParserEvent::Menu => MemoryValue::Bool(true),
            ParserEvent::DisconnectEvent => MemoryValue::Bool(true),
        };
        self.memory.insert(key.to_string(), value);

        match event {
            ParserEvent::VehicleName(_) | ParserEvent::GliderLabDos(_) => {
                self.set_connection(CarrierDetect::Yes);
            }
            _ => {}
        }
        if matches!(event, ParserEvent::GliderLabDos(_)) {
            self.set_running(false);
        }
        if matches!(event, ParserEvent::DisconnectEvent) {
            self.set_connection(CarrierDetect::No);
            self.set_running(false);
            self.clear_volatile();
        }
    }
}

/// Handle to a running dialogue-processing thread for one serial device.
pub struct DialogueState {
    tx: channel::Sender<Vec<u8>>,
    shared: Arc<Mutex<DialogueInner>>,
    timer: Arc<Timer>,
    handle: Option<JoinHandle<()>>,
}

impl DialogueState {
    pub fn new(initial_cd: CarrierDetect) -> Self {
        tracing::info!("Using DialogueState for dialogue processing.");
        let (tx, rx) = channel::unbounded::<Vec<u8>>();
        let shared = Arc::new(Mutex::new(DialogueInner::new(initial_cd)));
        let timer = Arc::new(Timer::with_default_timeout());
        let shared_for_thread = Arc::clone(&shared);
        let timer_for_thread = Arc::clone(&timer);
        let handle = thread::spawn(move || Self::process(rx, shared_for_thread, timer_for_thread));
        Self {
            tx,
            shared,
            timer,
            handle: Some(handle),
        }
    }

    fn process(rx: channel::Receiver<Vec<u8>>, shared: Arc<Mutex<DialogueInner>>, timer: Arc<Timer>) {
        tracing::debug!("Starting DialogueState::process()...");
        let mut assembler = LineAssembler::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(bytes) => {
                    let text = match String::from_utf8(bytes) {
                        Ok(s) => s,
                        Err(_) => {
                            tracing::debug!("Failed to decode string");
                            continue;
                        }
                    };
                    let lines = assembler.feed(&text);
                    let mut inner = shared.lock().unwrap();
                    for line in lines {
                        if let Some(event) = parse_line(&line) {
                            if matches!(
                                event,
                                ParserEvent::VehicleName(_) | ParserEvent::GliderLabDos(_)
                            ) {
                                timer.reset();
                            }
                            inner.apply_event(&event);
                        }
                    }
                    if inner.is_running() {
                        timer.reset();
                    }
                    tracing::debug!(memory = ?inner.memory, "dialogue state");
                }
                Err(channel::RecvTimeoutError::Timeout) => {
                    if timer.is_timed_out() {
                        let mut inner = shared.lock().unwrap();
                        inner.set_connection(CarrierDetect::No);
                        inner.clear_volatile();
                    }
                }
                Err(channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("Exiting DialogueState::process().");
    }

    /// Enqueue raw serial bytes for dialogue parsing.
    pub fn send(&self, data: &[u8]) {
        let _ = self.tx.send(data.to_vec());
    }

    fn connect(&self) {
        let mut inner = self.shared.lock().unwrap();
        inner.set_connection(CarrierDetect::Yes);
        drop(inner);
        self.timer.disable_until_reset();
    }

    fn disconnect(&self) {
        let mut inner = self.shared.lock().unwrap();
        inner.set_connection(CarrierDetect::No);
        drop(inner);
        self.timer.reset();
    }

    /// Handle a control-surface command (`connect`/`disconnect`/`status`/other).
    pub fn callback(&self, command: &str) -> String {
        match command {
            "connect" => {
                self.connect();
                format!("Device {command}ed.")
            }
            "disconnect" => {
                self.disconnect();
                format!("Device {command}ed.")
            }
            "status" => {
                let inner = self.shared.lock().unwrap();
                inner.connection().status_message().to_string()
            }
            other => format!("Command {other} unprocessed."),
        }
    }

    /// Synthesized carrier-detect, fail-open when connection is undefined.
    pub fn cd(&self) -> bool {
        let inner = self.shared.lock().unwrap();
        match inner.connection() {
            CarrierDetect::Undefined => true,
            CarrierDetect::Yes => true,
            CarrierDetect::No => false,
        }
    }
}

impl Drop for DialogueState {
    fn drop(&mut self) {
        // Dropping tx's last clone (nothing else holds one) disconnects the
        // channel, which unblocks the processing thread's recv_timeout.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
