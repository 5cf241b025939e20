use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::ConfigError;
use crate::filter::FilterKind;

const DEFAULT_CONFIG_PATH: &str = "/etc/pktfilter.conf";
const DEFAULT_PORT: u16 = 67;
const DEFAULT_LOG_FILTER: &str = "info";

/// Runtime settings for the packet filter tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Backend to use
    pub filter: FilterKind,
    /// UDP port to listen on
    pub port: u16,
    /// Interfaces to open sockets on; empty means all usable ones
    pub interfaces: Vec<String>,
    /// Receive and send broadcast where the interface supports it
    pub broadcast: bool,
    /// Default tracing filter when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            filter: FilterKind::Auto,
            port: DEFAULT_PORT,
            interfaces: Vec::new(),
            broadcast: true,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    /// Load from `PKTFILTER_CONFIG` (or the default path), then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("PKTFILTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&config_path)
    }

    /// Load from `path`, then apply environment overrides.
    ///
    /// A missing file leaves the defaults in place.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    config.set(key.trim(), value.trim())?;
                }
            }
        }

        // Allow environment variable overrides
        let overrides = [
            ("PKTFILTER_FILTER", "filter"),
            ("PKTFILTER_PORT", "port"),
            ("PKTFILTER_INTERFACES", "interfaces"),
            ("PKTFILTER_BROADCAST", "broadcast"),
            ("PKTFILTER_LOG", "log_filter"),
        ];
        for (var, key) in overrides {
            if let Ok(val) = std::env::var(var) {
                config.set(key, val.trim())?;
            }
        }

        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "filter" => self.filter = value.parse().map_err(|_| invalid())?,
            "port" => self.port = value.parse().map_err(|_| invalid())?,
            "interfaces" => {
                self.interfaces = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            "broadcast" => self.broadcast = parse_bool(value).ok_or_else(invalid)?,
            "log_filter" => self.log_filter = value.to_string(),
            _ => warn!("Ignoring unknown config key '{}'", key),
        }
        Ok(())
    }

    /// Whether sockets should be opened on the named interface.
    pub fn wants_iface(&self, name: &str) -> bool {
        self.interfaces.is_empty() || self.interfaces.iter().any(|i| i == name)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}
