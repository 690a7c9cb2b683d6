//! pnet-based live capture.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use pnet::datalink::{self, Channel, Config, DataLinkReceiver, NetworkInterface};
use tracing::debug;

use super::PacketSource;
use crate::domain::{CapturedPacket, LinkType};
use crate::error::CaptureError;

/// How long a read may block before the running flag is checked again.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Live capture of Ethernet frames on one interface.
pub struct PnetCapture {
    interface: NetworkInterface,
    running: Arc<AtomicBool>,
}

impl PnetCapture {
    /// Create a new capture on the specified interface.
    pub fn new(interface_name: &str) -> Result<Self, CaptureError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == interface_name)
            .ok_or_else(|| CaptureError::InterfaceNotFound(interface_name.to_string()))?;

        Ok(Self::with_interface(interface))
    }

    /// Create a capture on the first suitable interface.
    ///
    /// Looks for an interface that is up and not a loopback.
    pub fn on_default_interface() -> Result<Self, CaptureError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty())
            .ok_or_else(|| {
                CaptureError::InterfaceNotFound("no suitable interface found".to_string())
            })?;

        Ok(Self::with_interface(interface))
    }

    fn with_interface(interface: NetworkInterface) -> Self {
        Self {
            interface,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// List all available network interfaces.
    pub fn list_interfaces() -> Vec<String> {
        datalink::interfaces()
            .into_iter()
            .map(|iface| {
                let status = if iface.is_up() { "UP" } else { "DOWN" };
                let ips: Vec<_> = iface.ips.iter().map(|ip| ip.to_string()).collect();
                format!(
                    "{}: {} [{}]",
                    iface.name,
                    status,
                    if ips.is_empty() {
                        "no IP".to_string()
                    } else {
                        ips.join(", ")
                    }
                )
            })
            .collect()
    }
}

impl PacketSource for PnetCapture {
    fn packets(&mut self) -> Result<Box<dyn Iterator<Item = CapturedPacket> + '_>, CaptureError> {
        let config = Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Config::default()
        };

        let rx = match datalink::channel(&self.interface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => rx,
            Ok(_) => {
                return Err(CaptureError::ChannelCreation(
                    "unsupported channel type".to_string(),
                ))
            }
            Err(e) => {
                let msg = e.to_string();
                if e.kind() == ErrorKind::PermissionDenied
                    || msg.contains("permission")
                    || msg.contains("Operation not permitted")
                {
                    return Err(CaptureError::InsufficientPermissions);
                }
                return Err(CaptureError::ChannelCreation(msg));
            }
        };

        Ok(Box::new(FrameIterator {
            rx,
            running: Arc::clone(&self.running),
        }))
    }

    fn interface_name(&self) -> &str {
        &self.interface.name
    }

    fn set_running(&mut self, running: Arc<AtomicBool>) {
        self.running = running;
    }
}

/// Iterator over frames received on the interface.
struct FrameIterator {
    rx: Box<dyn DataLinkReceiver>,
    running: Arc<AtomicBool>,
}

impl Iterator for FrameIterator {
    type Item = CapturedPacket;

    fn next(&mut self) -> Option<Self::Item> {
        while self.running.load(Ordering::SeqCst) {
            match self.rx.next() {
                Ok(frame) => {
                    return Some(CapturedPacket::at(
                        SystemTime::now(),
                        LinkType::ETHERNET,
                        frame.to_vec(),
                    ));
                }
                // Timeout is expected, check the running flag again
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => {
                    debug!("Capture error: {}", e);
                    continue;
                }
            }
        }
        None
    }
}
