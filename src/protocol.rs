//! IP protocol number to name lookup.
//!
//! Names come from a small builtin table, or from a file in
//! `/etc/protocols` format when one is available.

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Builtin names, used when no protocols file is loaded.
const BUILTIN: &[(u8, &str)] = &[
    (0, "HOPOPT"),
    (1, "ICMP"),
    (2, "IGMP"),
    (4, "IP-ENCAP"),
    (6, "TCP"),
    (8, "EGP"),
    (17, "UDP"),
    (41, "IPV6"),
    (43, "IPV6-ROUTE"),
    (44, "IPV6-FRAG"),
    (47, "GRE"),
    (50, "IPSEC-ESP"),
    (51, "IPSEC-AH"),
    (58, "IPV6-ICMP"),
    (59, "IPV6-NONXT"),
    (60, "IPV6-OPTS"),
    (89, "OSPFIGP"),
    (103, "PIM"),
    (112, "VRRP"),
    (132, "SCTP"),
    (136, "UDPLITE"),
];

/// Table of registered protocol names, indexed by protocol number.
#[derive(Debug, Clone)]
pub struct ProtocolNames {
    names: Vec<Option<String>>,
}

impl ProtocolNames {
    /// An empty table: every protocol is unregistered.
    pub fn empty() -> Self {
        Self {
            names: vec![None; 256],
        }
    }

    /// The builtin table of common protocols.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (id, name) in BUILTIN {
            table.register(*id, name);
        }
        table
    }

    /// Load a table from a file in `/etc/protocols` format.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parse `/etc/protocols` content.
    ///
    /// Each line is `name number [alias ...] [# comment]`. The first alias
    /// is preferred over the name since it carries the canonical spelling.
    pub fn parse(content: &str) -> Self {
        let mut table = Self::empty();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let mut fields = line.split_whitespace();
            let (Some(name), Some(number)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(id) = number.parse::<u8>() else {
                continue;
            };
            let canonical = fields.next().unwrap_or(name);
            table.register(id, canonical);
        }
        table
    }

    pub fn register(&mut self, id: u8, name: &str) {
        self.names[usize::from(id)] = Some(name.to_string());
    }

    /// Registered name for a protocol, if any.
    pub fn name(&self, id: u8) -> Option<&str> {
        self.names[usize::from(id)].as_deref()
    }

    /// Registered name, or the zero-padded protocol number when unregistered.
    pub fn display(&self, id: u8) -> Cow<'_, str> {
        match self.name(id) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("{:03}", id)),
        }
    }

    /// Number of registered protocols.
    pub fn len(&self) -> usize {
        self.names.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProtocolNames {
    fn default() -> Self {
        Self::builtin()
    }
}
