//! TOML configuration loading for `serial-tcp-connector`, layered
//! defaults-first the way spec.md §6 specifies.
//!
//! Uses `figment`, following the layered-source composition style of
//! `crazyscot-qcp`'s configuration stack (`figment` + `dirs`), merged
//! built-in defaults ← `/etc` ← `~/.config` ← CLI overrides.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::providers::{Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::cli::ConnectorArgs;
use crate::constants::SerialOptions;

const SYSTEM_CONFIG_PATH: &str = "/etc/dockserver_utils/serialTCPConnector-config.toml";
const USER_CONFIG_RELATIVE: &str = "dockserver_utils/serialTCPConnector-config.toml";

const DEFAULT_CONFIG_HEADER: &str = "\
# Generated by serial-tcp-connector. Edit freely; this file is only
# (re)created when absent, never overwritten.
";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpSection {
    pub server: String,
    pub port: u16,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: 8181,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SerialSection {
    pub devices: Vec<String>,
    #[serde(default)]
    pub options: HashMap<String, SerialOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(rename = "TCP", default)]
    pub tcp: TcpSection,
    #[serde(rename = "Serial", default)]
    pub serial: SerialSection,
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(USER_CONFIG_RELATIVE))
}

/// Creates the user config file from defaults with a header comment if it
/// doesn't already exist, per spec.md §6 ("A missing user config is
/// created from defaults with a header comment").
fn ensure_user_config_exists(path: &PathBuf, defaults: &Config) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    let body = toml::to_string_pretty(defaults).context("serializing default configuration")?;
    std::fs::write(path, format!("{DEFAULT_CONFIG_HEADER}\n{body}"))
        .with_context(|| format!("writing default configuration to {}", path.display()))?;
    tracing::info!(path = %path.display(), "created default configuration file");
    Ok(())
}

/// Loads configuration merging, left to right: built-in defaults, the
/// system-wide config file (if present), the user config file (created
/// from defaults if absent), then CLI overrides.
pub fn load(args: &ConnectorArgs) -> Result<Config> {
    let defaults = Config {
        tcp: TcpSection::default(),
        serial: SerialSection::default(),
    };

    let mut figment = Figment::from(Serialized::defaults(&defaults));

    if PathBuf::from(SYSTEM_CONFIG_PATH).exists() {
        figment = figment.merge(Toml::file(SYSTEM_CONFIG_PATH));
    }

    let user_path = args.configuration_file.clone().or_else(user_config_path);
    if let Some(user_path) = &user_path {
        if args.configuration_file.is_none() {
            ensure_user_config_exists(user_path, &defaults)?;
        }
        if user_path.exists() {
            figment = figment.merge(Toml::file(user_path));
        }
    }

    let mut config: Config = figment.extract().context("merging configuration layers")?;

    if let Some(server) = &args.server {
        config.tcp.server = server.clone();
    }
    if let Some(port) = args.port {
        config.tcp.port = port;
    }
    if let Some(devices) = &args.devices {
        config.serial.devices = devices.clone();
    }
    for (device, option) in &args.serial_options {
        config.serial.options.insert(device.clone(), option.clone());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args_with_file(path: PathBuf) -> ConnectorArgs {
        ConnectorArgs {
            devices: None,
            server: None,
            port: None,
            configuration_file: Some(path),
            serial_options: HashMap::new(),
        }
    }

    #[test]
    fn defaults_apply_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing-config.toml");
        let config = load(&args_with_file(missing)).unwrap();
        assert_eq!(config.tcp.server, "localhost");
        assert_eq!(config.tcp.port, 8181);
        assert!(config.serial.devices.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
            [TCP]
            server = "dockserver.example"
            port = 9191

            [Serial]
            devices = ["/dev/ttyUSB0"]
            "#
        )
        .unwrap();

        let config = load(&args_with_file(path)).unwrap();
        assert_eq!(config.tcp.server, "dockserver.example");
        assert_eq!(config.tcp.port, 9191);
        assert_eq!(config.serial.devices, vec!["/dev/ttyUSB0".to_string()]);
    }

    #[test]
    fn cli_overrides_take_precedence_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[TCP]\nserver = \"fromfile\"\nport = 1111\n").unwrap();

        let mut args = args_with_file(path);
        args.server = Some("fromcli".to_string());
        args.port = Some(2222);

        let config = load(&args).unwrap();
        assert_eq!(config.tcp.server, "fromcli");
        assert_eq!(config.tcp.port, 2222);
    }

    #[test]
    fn toml_accepts_spec_literal_simulatecd_spelling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[Serial]\ndevices = [\"/dev/ttyUSB0\"]\noptions = { \"/dev/ttyUSB0\" = \"simulateCD\" }\n",
        )
        .unwrap();

        let config = load(&args_with_file(path)).unwrap();
        assert_eq!(
            config.serial.options.get("/dev/ttyUSB0"),
            Some(&SerialOptions::SimulateCd)
        );
    }
}
