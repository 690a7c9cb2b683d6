//! Captured packet model.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Link-layer header type, using the pcap `LINKTYPE_*` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkType(pub u32);

impl LinkType {
    pub const NULL: Self = Self(0);
    pub const ETHERNET: Self = Self(1);
    pub const RAW: Self = Self(101);
    pub const LINUX_SLL: Self = Self(113);
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => write!(f, "NULL"),
            Self::ETHERNET => write!(f, "EN10MB"),
            Self::RAW => write!(f, "RAW"),
            Self::LINUX_SLL => write!(f, "LINUX_SLL"),
            Self(other) => write!(f, "LINKTYPE({other})"),
        }
    }
}

/// A raw packet as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    /// Capture time, relative to the UNIX epoch
    pub timestamp: Duration,
    /// Link-layer type of `data`
    pub link_type: LinkType,
    /// Captured bytes, starting at the link-layer header
    pub data: Vec<u8>,
    /// Length of the packet on the wire
    pub orig_len: u32,
}

impl CapturedPacket {
    /// Create a packet whose wire length equals its captured length.
    pub fn new(timestamp: Duration, link_type: LinkType, data: Vec<u8>) -> Self {
        let orig_len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self {
            timestamp,
            link_type,
            data,
            orig_len,
        }
    }

    /// Create a packet stamped with a wall-clock time.
    pub fn at(time: SystemTime, link_type: LinkType, data: Vec<u8>) -> Self {
        let timestamp = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self::new(timestamp, link_type, data)
    }

    /// Number of captured bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_uses_data_length() {
        let packet = CapturedPacket::new(Duration::from_secs(5), LinkType::ETHERNET, vec![0; 60]);
        assert_eq!(packet.orig_len, 60);
        assert_eq!(packet.len(), 60);
        assert!(!packet.is_empty());
    }

    #[test]
    fn test_at_converts_system_time() {
        let time = UNIX_EPOCH + Duration::from_millis(1_500);
        let packet = CapturedPacket::at(time, LinkType::RAW, vec![1, 2, 3]);
        assert_eq!(packet.timestamp, Duration::from_millis(1_500));
    }

    #[test]
    fn test_link_type_display() {
        assert_eq!(LinkType::ETHERNET.to_string(), "EN10MB");
        assert_eq!(LinkType(228).to_string(), "LINKTYPE(228)");
    }
}
