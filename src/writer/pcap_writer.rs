//! pcap file writer built on the `pcap-file` crate.

use std::fs::File;
use std::path::{Path, PathBuf};

use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::DataLink;

use super::{CaptureWriter, WriterFactory};
use crate::domain::{CapturedPacket, LinkType};
use crate::error::WriterError;

/// Snapshot length written to every file header. Longer records are
/// truncated to it, keeping their original length.
pub const SNAPLEN: u32 = 262_144;

/// A classic pcap file on disk.
///
/// Records go straight to the file descriptor; `sync` then makes them
/// durable with `fdatasync` through a second handle on the same file.
pub struct PcapFileWriter {
    path: PathBuf,
    link_type: LinkType,
    writer: PcapWriter<File>,
    sync_handle: File,
}

impl PcapFileWriter {
    /// Create (or truncate) `path` and write the file header.
    pub fn create(path: &Path, link_type: LinkType) -> Result<Self, WriterError> {
        let file = File::create(path)?;
        let sync_handle = file.try_clone()?;

        let header = PcapHeader {
            snaplen: SNAPLEN,
            datalink: DataLink::from(link_type.0),
            ..Default::default()
        };
        let writer = PcapWriter::with_header(file, header)?;

        Ok(Self {
            path: path.to_path_buf(),
            link_type,
            writer,
            sync_handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureWriter for PcapFileWriter {
    fn write_packet(&mut self, packet: &CapturedPacket) -> Result<(), WriterError> {
        let captured = packet.data.len().min(SNAPLEN as usize);
        let record = PcapPacket::new(packet.timestamp, packet.orig_len, &packet.data[..captured]);
        self.writer.write_packet(&record)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), WriterError> {
        self.sync_handle.sync_data()?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), WriterError> {
        let Self {
            writer, sync_handle, ..
        } = *self;
        sync_handle.sync_data()?;
        drop(writer.into_writer());
        Ok(())
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }
}

/// Opens `PcapFileWriter`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcapWriterFactory;

impl WriterFactory for PcapWriterFactory {
    fn open(&self, path: &Path, link_type: LinkType) -> Result<Box<dyn CaptureWriter>, WriterError> {
        Ok(Box::new(PcapFileWriter::create(path, link_type)?))
    }
}
