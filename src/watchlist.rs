//! Address and port watchlist.
//!
//! Marks flows as alerted when either endpoint's address or port is
//! listed. Files hold one entry per line: an IP address or a port
//! number. Blank lines and `#` comments are ignored.

use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use crate::domain::FlowKey;
use crate::error::ConfigError;

/// Set of watched addresses and ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watchlist {
    addresses: HashSet<IpAddr>,
    ports: HashSet<u16>,
}

impl Watchlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_address(&mut self, address: IpAddr) {
        self.addresses.insert(address);
    }

    pub fn add_port(&mut self, port: u16) {
        self.ports.insert(port);
    }

    /// Parse a single entry, either an address or a port.
    pub fn add_entry(&mut self, entry: &str) -> Result<(), ConfigError> {
        let entry = entry.trim();
        if let Ok(address) = entry.parse::<IpAddr>() {
            self.add_address(address);
        } else if let Ok(port) = entry.parse::<u16>() {
            self.add_port(port);
        } else {
            return Err(ConfigError::InvalidValue {
                key: "watchlist".to_string(),
                value: entry.to_string(),
            });
        }
        Ok(())
    }

    /// Parse watchlist file content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut watchlist = Self::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            watchlist.add_entry(line)?;
        }
        Ok(watchlist)
    }

    /// Load a watchlist file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Whether either endpoint of the flow is watched.
    pub fn matches(&self, key: &FlowKey) -> bool {
        self.addresses.contains(&key.src)
            || self.addresses.contains(&key.dst)
            || self.ports.contains(&key.src_port)
            || self.ports.contains(&key.dst_port)
    }

    pub fn len(&self) -> usize {
        self.addresses.len() + self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.ports.is_empty()
    }
}
