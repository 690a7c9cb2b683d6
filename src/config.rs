//! Daemon configuration.
//!
//! Values come from built-in defaults, then a `key = value` file, then
//! `ALERTCAP_*` environment variables. The daemon applies command-line
//! flags last through [`Config::set`].

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::ProtocolNames;
use crate::watchlist::Watchlist;

const DEFAULT_CONFIG_PATH: &str = "/etc/alertcap.conf";
const DEFAULT_DIRECTORY: &str = "alert";
const DEFAULT_LOG_DIR: &str = "/var/log/alertcap";
const DEFAULT_TIMEOUT: u32 = 300;
const DEFAULT_RETRO_BUFFER: usize = 64;
const DEFAULT_FLOW_TIMEOUT: u64 = 120;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_LOG_LEVEL: &str = "info";
const SYSTEM_PROTOCOLS_FILE: &str = "/etc/protocols";

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "ALERTCAP_CONFIG";

/// Every recognised key. Each can also be set through `ALERTCAP_<KEY>`,
/// upper-cased with `-` replaced by `_`.
const KEYS: &[&str] = &[
    "directory",
    "log-dir",
    "timeout",
    "retro-buffer",
    "flow-timeout",
    "workers",
    "interface",
    "protocols-file",
    "watch-file",
    "watch-addresses",
    "watch-ports",
    "log-level",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Capture directory, relative to `log_dir` unless absolute
    pub directory: PathBuf,
    pub log_dir: PathBuf,
    /// Seconds a capture file may stay idle before it is closed
    pub timeout: u32,
    /// Packets kept per flow before its alert fires
    pub retro_buffer: usize,
    /// Seconds a flow may stay idle in the flow table
    pub flow_timeout: u64,
    pub workers: usize,
    pub interface: Option<String>,
    pub protocols_file: Option<PathBuf>,
    pub watch_file: Option<PathBuf>,
    pub watch_addresses: Vec<IpAddr>,
    pub watch_ports: Vec<u16>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            timeout: DEFAULT_TIMEOUT,
            retro_buffer: DEFAULT_RETRO_BUFFER,
            flow_timeout: DEFAULT_FLOW_TIMEOUT,
            workers: DEFAULT_WORKERS,
            interface: None,
            protocols_file: None,
            watch_file: None,
            watch_addresses: Vec::new(),
            watch_ports: Vec::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    /// Load defaults, the config file and environment overrides.
    ///
    /// An explicit `path` must exist. Without one, `ALERTCAP_CONFIG` or
    /// `/etc/alertcap.conf` is read if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        match path {
            Some(path) => config.apply_file(path)?,
            None => {
                let path = std::env::var(CONFIG_ENV)
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
                if path.exists() {
                    config.apply_file(&path)?;
                }
            }
        }

        config.apply_env()?;
        Ok(config)
    }

    /// Parse config file content on top of the defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_str(content)?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.apply_str(&content)
    }

    fn apply_str(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                self.set(key.trim(), value.trim())?;
            }
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        for key in KEYS {
            if let Ok(value) = std::env::var(env_name(key)) {
                self.set(key, value.trim())?;
            }
        }
        Ok(())
    }

    /// Set one key. Unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "directory" => self.directory = PathBuf::from(value),
            "log-dir" => self.log_dir = PathBuf::from(value),
            "timeout" => self.timeout = parse_timeout(value)?,
            "retro-buffer" => self.retro_buffer = parse_number(key, value)?,
            "flow-timeout" => {
                let secs: u64 = parse_number(key, value)?;
                if secs == 0 {
                    return Err(invalid(key, value));
                }
                self.flow_timeout = secs;
            }
            "workers" => {
                let workers: usize = parse_number(key, value)?;
                if workers == 0 {
                    return Err(invalid(key, value));
                }
                self.workers = workers;
            }
            "interface" => self.interface = non_empty(value).map(str::to_string),
            "protocols-file" => self.protocols_file = non_empty(value).map(PathBuf::from),
            "watch-file" => self.watch_file = non_empty(value).map(PathBuf::from),
            "watch-addresses" => self.watch_addresses = parse_list(key, value)?,
            "watch-ports" => self.watch_ports = parse_list(key, value)?,
            "log-level" => self.log_level = value.to_string(),
            _ => {}
        }
        Ok(())
    }

    /// Capture directory with `log_dir` applied.
    pub fn capture_dir(&self) -> PathBuf {
        if self.directory.is_absolute() {
            self.directory.clone()
        } else {
            self.log_dir.join(&self.directory)
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout))
    }

    pub fn flow_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_timeout)
    }

    /// Protocol names from the configured file, the system file when it
    /// exists, or the builtin table.
    pub fn protocols(&self) -> Result<ProtocolNames, ConfigError> {
        match &self.protocols_file {
            Some(path) => ProtocolNames::load(path),
            None if Path::new(SYSTEM_PROTOCOLS_FILE).exists() => {
                ProtocolNames::load(Path::new(SYSTEM_PROTOCOLS_FILE))
            }
            None => Ok(ProtocolNames::builtin()),
        }
    }

    /// The watchlist built from the file and the inline lists.
    pub fn watchlist(&self) -> Result<Watchlist, ConfigError> {
        let mut watchlist = match &self.watch_file {
            Some(path) => Watchlist::load(path)?,
            None => Watchlist::new(),
        };
        for address in &self.watch_addresses {
            watchlist.add_address(*address);
        }
        for port in &self.watch_ports {
            watchlist.add_port(*port);
        }
        Ok(watchlist)
    }
}

fn env_name(key: &str) -> String {
    format!("ALERTCAP_{}", key.to_uppercase().replace('-', "_"))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value).filter(|v| !v.is_empty())
}

/// Idle timeout in seconds: an unsigned 32-bit integer, at least 1.
fn parse_timeout(value: &str) -> Result<u32, ConfigError> {
    match value.parse::<u32>() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidTimeout(value.to_string())),
        Ok(secs) => Ok(secs),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn parse_list<T: std::str::FromStr>(key: &str, value: &str) -> Result<Vec<T>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse().map_err(|_| invalid(key, item)))
        .collect()
}
