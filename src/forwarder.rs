//! One-device serial<->TCP relay, gated by carrier-detect.
//!
//! Generalizes `sergw::server::run_listen`'s thread-per-direction shape
//! (reader thread, writer thread, crossbeam channel) from its single
//! long-lived TCP listener into three directions per device: a fixed
//! serial->TCP copy, a fixed TCP->serial copy, and a CD-monitor thread that
//! opens/closes the TCP side as the modem's carrier-detect line rises and
//! falls. Grounded on `dockserver_utils/serial2tcp.py::Serial2TCP.run`,
//! whose `asyncio.wait(..., return_when=FIRST_COMPLETED)` this module's
//! "first direction to finish wins" join mirrors.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use serialport::SerialPort;

use crate::constants::CarrierDetect;
use crate::dialogue::DialogueState;
use crate::metrics::ThroughputAverager;
use crate::serial::open_serial_port;

const READ_BUFFER: usize = 256;
const CD_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SOFT_CANCEL_DEADLINE: Duration = Duration::from_secs(1);
const HARD_CANCEL_DEADLINE: Duration = Duration::from_secs(15);
/// Smoothing time constant for the periodic throughput log line.
const THROUGHPUT_TAU_SECS: f64 = 5.0;
/// Minimum gap between throughput log lines, regardless of read frequency.
const THROUGHPUT_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Bitflag-style outcome of a [`Forwarder::run`]. `NO_ERROR` is the empty
/// set; a combined code is the bitwise OR of every direction that
/// completed with a fault, matching spec's "combined ExitCode equals the
/// bitwise-OR of completed-direction codes" invariant. [`ExitCode::process_exit_code`]
/// is the only place this collapses to one of the four reserved process
/// exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(u8);

impl ExitCode {
    pub const NO_ERROR: ExitCode = ExitCode(0);
    pub const ERR_SERIAL: ExitCode = ExitCode(1 << 0);
    pub const ERR_TCP: ExitCode = ExitCode(1 << 1);
    pub const ERR_SERIAL_INIT: ExitCode = ExitCode(1 << 2);
    pub const ERR_TCP_INIT: ExitCode = ExitCode(1 << 3);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn combine(self, other: ExitCode) -> ExitCode {
        ExitCode(self.0 | other.0)
    }

    pub fn contains(self, other: ExitCode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Maps to the process exit codes spec.md §6 reserves: 1 `ErrSerial`,
    /// 2 `ErrTCP`, 3 `ErrSerialInit`, 4 `ErrTCPInit`. Init-time faults take
    /// priority since they imply the session never started.
    pub fn process_exit_code(self) -> i32 {
        if self.contains(Self::ERR_TCP_INIT) {
            4
        } else if self.contains(Self::ERR_SERIAL_INIT) {
            3
        } else if self.contains(Self::ERR_TCP) {
            2
        } else if self.contains(Self::ERR_SERIAL) {
            1
        } else {
            0
        }
    }
}

/// How a Forwarder learns the modem's carrier-detect state.
pub enum CdSource {
    /// Read the UART's CD line directly.
    Hardware,
    /// No modem: CD is forced `Yes` and the TCP side is opened eagerly.
    Direct,
    /// CD is synthesized by a dialogue processor rather than read from the UART.
    Simulated(Arc<DialogueState>),
}

pub struct Forwarder {
    device: String,
    host: String,
    port: u16,
    cd_source: CdSource,
    dialogue: Option<Arc<DialogueState>>,
}

impl Forwarder {
    pub fn new(device: impl Into<String>, host: impl Into<String>, port: u16, cd_source: CdSource) -> Self {
        Self {
            device: device.into(),
            host: host.into(),
            port,
            cd_source,
            dialogue: None,
        }
    }

    /// Attaches a [`DialogueState`] that the `S->T` direction tees every
    /// inbound serial read into, per spec.md §2's data flow ("serial bytes
    /// -> split tee into (a) TCP writer and (b) LineAssembler -> DialogueState
    /// updates"). Independent of `cd_source`: a device can run dialogue
    /// processing for monitoring/control purposes even when CD comes from
    /// real hardware, not just in `simulateCD` mode.
    pub fn with_dialogue(mut self, dialogue: Arc<DialogueState>) -> Self {
        self.dialogue = Some(dialogue);
        self
    }

    /// Proves the dockserver is reachable before ever touching the serial
    /// device: connect, hold briefly, close. Prevents the glider from
    /// seeing a live dock when the backend is actually down.
    fn startup_probe(&self) -> std::io::Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        thread::sleep(Duration::from_millis(500));
        drop(stream);
        Ok(())
    }

    pub fn run(&self) -> ExitCode {
        if let Err(e) = self.startup_probe() {
            tracing::error!(device = %self.device, host = %self.host, port = self.port, error = %e, "startup TCP probe failed");
            return ExitCode::ERR_TCP_INIT;
        }

        let mut serial_reader = match open_serial_port(&self.device) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(device = %self.device, error = %e, "failed to open serial port");
                return ExitCode::ERR_SERIAL_INIT;
            }
        };
        let mut serial_writer = match serial_reader.try_clone() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(device = %self.device, error = %e, "failed to clone serial port for writer");
                return ExitCode::ERR_SERIAL_INIT;
            }
        };
        // A third handle onto the same open, for the CD monitor. Cloning
        // rather than re-opening matters: `serialport` opens exclusive on
        // Unix (TIOCEXCL), so a second `open_serial_port` call on an
        // already-open device fails with EBUSY. The port is opened exactly
        // once per `run()`, per spec.md §4.1's invariant; every other
        // handle is a clone of it.
        let cd_port = if matches!(self.cd_source, CdSource::Hardware) {
            match serial_reader.try_clone() {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::error!(device = %self.device, error = %e, "failed to clone serial port for CD monitor");
                    return ExitCode::ERR_SERIAL_INIT;
                }
            }
        } else {
            None
        };

        let shared_tcp: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
        let cd_state = Arc::new(AtomicU8::new(CarrierDetect::Undefined as u8));
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = channel::unbounded::<ExitCode>();

        if matches!(self.cd_source, CdSource::Direct) {
            match TcpStream::connect((self.host.as_str(), self.port)) {
                Ok(stream) => {
                    *shared_tcp.lock().unwrap() = Some(stream);
                    cd_state.store(CarrierDetect::Yes as u8, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(device = %self.device, error = %e, "direct-mode TCP open failed");
                    return ExitCode::ERR_TCP_INIT;
                }
            }
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        {
            let shared_tcp = Arc::clone(&shared_tcp);
            let stop = Arc::clone(&stop);
            let done_tx = done_tx.clone();
            let device = self.device.clone();
            let dialogue = self.dialogue.clone();
            handles.push(thread::spawn(move || {
                let code = forward_serial_to_tcp(serial_reader.as_mut(), &shared_tcp, &stop, dialogue.as_deref());
                tracing::debug!(device = %device, ?code, "S->T direction finished");
                let _ = done_tx.send(code);
            }));
        }

        {
            let shared_tcp = Arc::clone(&shared_tcp);
            let cd_state = Arc::clone(&cd_state);
            let stop = Arc::clone(&stop);
            let done_tx = done_tx.clone();
            let device = self.device.clone();
            handles.push(thread::spawn(move || {
                let code = forward_tcp_to_serial(serial_writer.as_mut(), &shared_tcp, &cd_state, &stop);
                tracing::debug!(device = %device, ?code, "T->S direction finished");
                let _ = done_tx.send(code);
            }));
        }

        if !matches!(self.cd_source, CdSource::Direct) {
            let cd_reader = match &self.cd_source {
                CdSource::Hardware => {
                    let cd_port = cd_port.expect("cd_port cloned above for CdSource::Hardware");
                    CdReader::Hardware(Mutex::new(cd_port))
                }
                CdSource::Simulated(ds) => CdReader::Simulated(Arc::clone(ds)),
                CdSource::Direct => unreachable!(),
            };
            let shared_tcp = Arc::clone(&shared_tcp);
            let cd_state = Arc::clone(&cd_state);
            let stop = Arc::clone(&stop);
            let done_tx = done_tx.clone();
            let host = self.host.clone();
            let port = self.port;
            let device = self.device.clone();
            handles.push(thread::spawn(move || {
                run_cd_monitor(cd_reader, host, port, shared_tcp, cd_state, stop, done_tx);
                tracing::debug!(device = %device, "CD monitor finished");
            }));
        }

        drop(done_tx);
        let first = done_rx.recv().unwrap_or(ExitCode::NO_ERROR);
        stop.store(true, Ordering::Relaxed);
        join_all(handles, &stop, &done_rx, first)
    }
}

enum CdReader {
    Hardware(Mutex<Box<dyn SerialPort>>),
    Simulated(Arc<DialogueState>),
}

fn join_all(
    handles: Vec<JoinHandle<()>>,
    _stop: &AtomicBool,
    done_rx: &channel::Receiver<ExitCode>,
    first: ExitCode,
) -> ExitCode {
    let mut combined = first;
    while let Ok(code) = done_rx.try_recv() {
        combined = combined.combine(code);
    }

    let soft_deadline = Instant::now() + SOFT_CANCEL_DEADLINE;
    let hard_deadline = Instant::now() + HARD_CANCEL_DEADLINE;
    while Instant::now() < soft_deadline && handles.iter().any(|h| !h.is_finished()) {
        thread::sleep(Duration::from_millis(20));
    }
    if handles.iter().any(|h| !h.is_finished()) {
        tracing::debug!("direction still running past soft cancellation deadline");
    }
    while Instant::now() < hard_deadline && handles.iter().any(|h| !h.is_finished()) {
        thread::sleep(Duration::from_millis(50));
    }
    if handles.iter().any(|h| !h.is_finished()) {
        tracing::warn!("direction refused to cancel within hard deadline, joining anyway");
    }
    for h in handles {
        let _ = h.join();
    }
    while let Ok(code) = done_rx.try_recv() {
        combined = combined.combine(code);
    }
    combined
}

fn forward_serial_to_tcp(
    serial: &mut dyn SerialPort,
    shared_tcp: &Mutex<Option<TcpStream>>,
    stop: &AtomicBool,
    dialogue: Option<&DialogueState>,
) -> ExitCode {
    let mut buf = [0u8; READ_BUFFER];
    let mut throughput = ThroughputAverager::new(THROUGHPUT_TAU_SECS);
    let mut last_update = Instant::now();
    let mut last_log = Instant::now();
    let exit = loop {
        if stop.load(Ordering::Relaxed) {
            break ExitCode::NO_ERROR;
        }
        match serial.read(&mut buf) {
            Ok(0) => break ExitCode::NO_ERROR,
            Ok(n) => {
                let now = Instant::now();
                let bps = throughput.update(n as u64, now.duration_since(last_update).as_secs_f64());
                last_update = now;
                if now.duration_since(last_log) >= THROUGHPUT_LOG_INTERVAL {
                    tracing::debug!(direction = "serial->tcp", bytes_per_sec = bps, "throughput");
                    last_log = now;
                }
                if let Some(ds) = dialogue {
                    ds.send(&buf[..n]);
                }
                let mut guard = shared_tcp.lock().unwrap();
                if let Some(stream) = guard.as_mut() {
                    if stream.write_all(&buf[..n]).and_then(|_| stream.flush()).is_err() {
                        *guard = None;
                        break ExitCode::ERR_TCP;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                tracing::warn!(error = %e, "serial read failed in S->T");
                break ExitCode::ERR_SERIAL;
            }
        }
    };
    if let Some(stream) = shared_tcp.lock().unwrap().take() {
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
    exit
}

fn forward_tcp_to_serial(
    serial: &mut dyn SerialPort,
    shared_tcp: &Mutex<Option<TcpStream>>,
    cd_state: &AtomicU8,
    stop: &AtomicBool,
) -> ExitCode {
    let mut buf = [0u8; READ_BUFFER];
    let mut throughput = ThroughputAverager::new(THROUGHPUT_TAU_SECS);
    let mut last_update = Instant::now();
    let mut last_log = Instant::now();
    let exit = loop {
        if stop.load(Ordering::Relaxed) {
            break ExitCode::NO_ERROR;
        }
        // Read shared_tcp and cd_state together under one lock acquisition.
        // run_cd_monitor publishes cd_state=Yes under this same lock, only
        // after shared_tcp is already populated, so a None reader here can
        // never be paired with a stale cd_state==Yes read afterward.
        let (reader, carrier_without_backend) = {
            let guard = shared_tcp.lock().unwrap();
            match guard.as_ref() {
                Some(s) => (s.try_clone().ok(), false),
                None => (None, cd_state.load(Ordering::Relaxed) == CarrierDetect::Yes as u8),
            }
        };
        match reader {
            Some(mut stream) => {
                let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
                match stream.read(&mut buf) {
                    Ok(0) => thread::sleep(Duration::from_secs(1)),
                    Ok(n) => {
                        let now = Instant::now();
                        let bps = throughput.update(n as u64, now.duration_since(last_update).as_secs_f64());
                        last_update = now;
                        if now.duration_since(last_log) >= THROUGHPUT_LOG_INTERVAL {
                            tracing::debug!(direction = "tcp->serial", bytes_per_sec = bps, "throughput");
                            last_log = now;
                        }
                        if serial.write_all(&buf[..n]).and_then(|_| serial.flush()).is_err() {
                            break ExitCode::ERR_SERIAL;
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "TCP read failed in T->S");
                        break ExitCode::ERR_TCP;
                    }
                }
            }
            None => {
                if carrier_without_backend {
                    tracing::warn!("carrier present without a TCP backend");
                    break ExitCode::ERR_TCP;
                }
                thread::sleep(Duration::from_secs(1));
            }
        }
    };
    exit
}

fn run_cd_monitor(
    reader: CdReader,
    host: String,
    port: u16,
    shared_tcp: Arc<Mutex<Option<TcpStream>>>,
    cd_state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    done_tx: channel::Sender<ExitCode>,
) {
    while !stop.load(Ordering::Relaxed) {
        let asserted = match &reader {
            CdReader::Hardware(port) => {
                let mut guard = port.lock().unwrap();
                match crate::serial::read_carrier_detect(guard.as_mut()) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(error = %e, "CD line read failed, treating as deasserted");
                        false
                    }
                }
            }
            CdReader::Simulated(ds) => ds.cd(),
        };
        let new_cd = if asserted { CarrierDetect::Yes } else { CarrierDetect::No };
        let old = cd_state.load(Ordering::Relaxed);
        if old != new_cd as u8 {
            match new_cd {
                CarrierDetect::Yes => {
                    // shared_tcp is populated, and cd_state published, while the
                    // same lock is held: forward_tcp_to_serial's `None` arm reads
                    // shared_tcp and cd_state under that identical lock, so it can
                    // never observe the pair (shared_tcp=None, cd_state=Yes).
                    let mut guard = shared_tcp.lock().unwrap();
                    if guard.is_none() {
                        match TcpStream::connect((host.as_str(), port)) {
                            Ok(stream) => {
                                tracing::info!("carrier detect asserted, opened TCP session");
                                *guard = Some(stream);
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "failed to open TCP session on CD rise");
                                drop(guard);
                                let _ = done_tx.send(ExitCode::ERR_TCP);
                                return;
                            }
                        }
                    }
                    cd_state.store(new_cd as u8, Ordering::Relaxed);
                }
                CarrierDetect::No => {
                    let mut guard = shared_tcp.lock().unwrap();
                    if let Some(stream) = guard.take() {
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        tracing::info!("carrier detect deasserted, closed TCP session");
                    }
                    cd_state.store(new_cd as u8, Ordering::Relaxed);
                }
                CarrierDetect::Undefined => {
                    cd_state.store(new_cd as u8, Ordering::Relaxed);
                }
            }
        }
        thread::sleep(CD_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_combines_as_bitwise_or() {
        let combined = ExitCode::ERR_SERIAL.combine(ExitCode::ERR_TCP);
        assert!(combined.contains(ExitCode::ERR_SERIAL));
        assert!(combined.contains(ExitCode::ERR_TCP));
        assert!(!combined.contains(ExitCode::ERR_TCP_INIT));
    }

    #[test]
    fn no_error_is_falsy() {
        assert!(ExitCode::NO_ERROR.is_none());
        assert!(!ExitCode::ERR_SERIAL.is_none());
    }

    #[test]
    fn process_exit_code_priorities_init_faults() {
        let combined = ExitCode::ERR_SERIAL.combine(ExitCode::ERR_TCP_INIT);
        assert_eq!(combined.process_exit_code(), 4);
        assert_eq!(ExitCode::ERR_SERIAL.process_exit_code(), 1);
        assert_eq!(ExitCode::ERR_TCP.process_exit_code(), 2);
        assert_eq!(ExitCode::ERR_SERIAL_INIT.process_exit_code(), 3);
        assert_eq!(ExitCode::NO_ERROR.process_exit_code(), 0);
    }
}

/// Exercises a whole `Forwarder::run()` in `direct` mode end-to-end, using a
/// PTY in place of a real modem-attached UART (the same substitution
/// `sergw::net::server`'s `itests` module makes for its own TCP<->serial
/// loop).
#[cfg(all(test, target_os = "linux"))]
mod itests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;

    fn create_pty() -> (std::fs::File, String) {
        use nix::pty::{openpty, OpenptyResult, Winsize};
        let OpenptyResult { master, slave, .. } = openpty(None::<&Winsize>, None).unwrap();
        let slave_symlink = format!("/proc/self/fd/{}", slave.as_raw_fd());
        let slave_path = std::fs::read_link(&slave_symlink).unwrap();
        drop(slave);
        (std::fs::File::from(master), slave_path.to_string_lossy().into_owned())
    }

    #[test]
    fn direct_mode_relays_bytes_both_ways_then_unwinds_on_hangup() {
        let (mut master, slave_path) = create_pty();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // Forwarder::run() dials host:port twice: once for the startup
        // probe (held 500ms then dropped) and once for the real,
        // eagerly-opened `direct`-mode session.
        let accept_thread = thread::spawn(move || {
            let (probe, _) = listener.accept().unwrap();
            drop(probe);
            let (session, _) = listener.accept().unwrap();
            session
        });

        let forwarder_thread = {
            let device = slave_path.clone();
            thread::spawn(move || {
                let forwarder = Forwarder::new(device, "127.0.0.1", port, CdSource::Direct);
                forwarder.run()
            })
        };

        let mut session = accept_thread.join().unwrap();
        session.set_nodelay(true).ok();

        master.write_all(b"hello").unwrap();
        let mut from_serial = [0u8; 5];
        session.read_exact(&mut from_serial).unwrap();
        assert_eq!(&from_serial, b"hello");

        session.write_all(b"world").unwrap();
        let mut from_tcp = [0u8; 5];
        master.read_exact(&mut from_tcp).unwrap();
        assert_eq!(&from_tcp, b"world");

        // Closing the PTY master makes the slave-side serial read fail
        // (EIO), which is the deterministic way to unwind S->T: an
        // orderly TCP half-close alone leaves T->S sleeping and retrying
        // forever per spec.md's "empty read, sleep 1s and re-check".
        drop(master);
        drop(session);
        let code = forwarder_thread.join().unwrap();
        assert!(code.contains(ExitCode::ERR_SERIAL));
    }

    /// Confirms the `S->T` direction tees every serial read into an
    /// attached `DialogueState`, not just the TCP writer (spec.md §2's
    /// "split tee into (a) TCP writer and (b) LineAssembler" data flow).
    #[test]
    fn serial_bytes_are_teed_into_attached_dialogue() {
        use crate::constants::CarrierDetect;
        use crate::dialogue::DialogueState;

        let (mut master, slave_path) = create_pty();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept_thread = thread::spawn(move || {
            let (probe, _) = listener.accept().unwrap();
            drop(probe);
            let (session, _) = listener.accept().unwrap();
            session
        });

        let dialogue = Arc::new(DialogueState::new(CarrierDetect::Undefined));
        let dialogue_for_forwarder = Arc::clone(&dialogue);
        let forwarder_thread = {
            let device = slave_path.clone();
            thread::spawn(move || {
                let forwarder = Forwarder::new(device, "127.0.0.1", port, CdSource::Direct)
                    .with_dialogue(dialogue_for_forwarder);
                forwarder.run()
            })
        };

        let mut session = accept_thread.join().unwrap();
        session.set_nodelay(true).ok();

        master.write_all(b"Vehicle Name: sebastian\n").unwrap();
        let mut from_serial = [0u8; 24];
        session.read_exact(&mut from_serial).unwrap();

        thread::sleep(Duration::from_millis(150));
        assert!(dialogue.cd());

        drop(master);
        drop(session);
        forwarder_thread.join().unwrap();
    }
}
