//! Capture writer abstraction.
//!
//! The cache only sees the `CaptureWriter` and `WriterFactory` traits,
//! so the on-disk format can be swapped and tests can observe opens and
//! writes without touching the filesystem. `PcapFileWriter` is the
//! production implementation.

mod pcap_writer;

pub use pcap_writer::{PcapFileWriter, PcapWriterFactory, SNAPLEN};

use std::path::Path;

use crate::domain::{CapturedPacket, LinkType};
use crate::error::WriterError;

/// An open capture file bound to one link-layer type.
pub trait CaptureWriter: Send {
    /// Append one record with the packet's own timestamp and length.
    fn write_packet(&mut self, packet: &CapturedPacket) -> Result<(), WriterError>;

    /// Force everything written so far to stable storage.
    fn sync(&mut self) -> Result<(), WriterError>;

    /// Flush and close. Consumes the writer, so nothing can be appended afterwards.
    fn close(self: Box<Self>) -> Result<(), WriterError>;

    /// Link-layer type recorded in the file header.
    fn link_type(&self) -> LinkType;
}

/// Opens new capture writers.
pub trait WriterFactory: Send + Sync {
    fn open(&self, path: &Path, link_type: LinkType) -> Result<Box<dyn CaptureWriter>, WriterError>;
}
