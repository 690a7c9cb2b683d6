//! Packet sources.
//!
//! `PacketSource` is the seam between the daemon and where packets come
//! from: a live interface through pnet, or a pcap file being replayed.
//! [`decode::flow_key`] turns each captured frame into its flow key.

pub mod decode;
mod pcap_source;
mod pnet_capture;

pub use pcap_source::PcapFileSource;
pub use pnet_capture::PnetCapture;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::domain::CapturedPacket;
use crate::error::CaptureError;

/// Something that produces captured packets.
pub trait PacketSource: Send {
    /// Start producing packets.
    ///
    /// The iterator ends when the source is exhausted or the running flag
    /// is cleared.
    fn packets(&mut self) -> Result<Box<dyn Iterator<Item = CapturedPacket> + '_>, CaptureError>;

    /// Interface or file the packets come from.
    fn interface_name(&self) -> &str;

    /// Set the running flag for graceful shutdown.
    fn set_running(&mut self, running: Arc<AtomicBool>);
}
