//! CLI surfaces for the two binaries, in sergw's `#[derive(Parser)]` style.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;

use crate::constants::SerialOptions;

/// Parses a comma-separated device list, e.g. `/dev/ttyUSB0,/dev/ttyUSB1`.
fn parse_csv_list(s: &str) -> Result<Vec<String>, String> {
    let devices: Vec<String> = s
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();
    if devices.is_empty() {
        return Err("no devices given".to_string());
    }
    Ok(devices)
}

/// Parses `dev=option,dev2=option2` into a per-device [`SerialOptions`] map.
/// A device with no `=option` suffix defaults to [`SerialOptions::None`].
fn parse_serial_options(s: &str) -> Result<HashMap<String, SerialOptions>, String> {
    let mut map = HashMap::new();
    for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (device, option) = match entry.split_once('=') {
            Some((d, o)) => (d, o),
            None => (entry, ""),
        };
        let parsed: SerialOptions = option.parse()?;
        map.insert(device.to_string(), parsed);
    }
    Ok(map)
}

/// Serial<->TCP dockserver forwarder, one TCP listener per configured device.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "Serial<->TCP dockserver forwarder", long_about = None)]
pub struct ConnectorArgs {
    /// Comma-separated serial devices to watch and forward, e.g. /dev/ttyUSB0,/dev/ttyUSB1
    #[arg(long, value_parser = parse_csv_list)]
    pub devices: Option<Vec<String>>,

    /// TCP server address to bind the forwarders to
    #[arg(long)]
    pub server: Option<String>,

    /// TCP port; every device's Forwarder dials the same server:port
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to a TOML configuration file, overriding the default search path
    #[arg(long)]
    pub configuration_file: Option<PathBuf>,

    /// Per-device serial options, e.g. /dev/ttyUSB0=direct,/dev/ttyUSB1=simulateCD
    #[arg(long, value_parser = parse_serial_options, default_value = "")]
    pub serial_options: HashMap<String, SerialOptions>,
}

/// Glider file decompression and rename sidecar.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about = "Glider file decompression + rename sidecar", long_about = None)]
pub struct DecompressorArgs {
    /// Root directory containing one subdirectory per glider to watch
    #[arg(long)]
    pub directory: PathBuf,
}
