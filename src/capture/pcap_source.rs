//! Offline replay of a pcap file.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pcap_file::pcap::PcapReader;
use tracing::warn;

use super::PacketSource;
use crate::domain::{CapturedPacket, LinkType};
use crate::error::CaptureError;

/// Reads packets from a classic pcap file, keeping their original
/// timestamps and link type.
pub struct PcapFileSource {
    path: PathBuf,
    name: String,
    running: Arc<AtomicBool>,
}

impl PcapFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self {
            path,
            name,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PacketSource for PcapFileSource {
    fn packets(&mut self) -> Result<Box<dyn Iterator<Item = CapturedPacket> + '_>, CaptureError> {
        let file = File::open(&self.path).map_err(|source| CaptureError::FileOpen {
            path: self.path.clone(),
            source,
        })?;
        let reader = PcapReader::new(BufReader::new(file))?;
        let link_type = LinkType(u32::from(reader.header().datalink));

        Ok(Box::new(RecordIterator {
            reader,
            link_type,
            running: Arc::clone(&self.running),
        }))
    }

    fn interface_name(&self) -> &str {
        &self.name
    }

    fn set_running(&mut self, running: Arc<AtomicBool>) {
        self.running = running;
    }
}

struct RecordIterator {
    reader: PcapReader<BufReader<File>>,
    link_type: LinkType,
    running: Arc<AtomicBool>,
}

impl Iterator for RecordIterator {
    type Item = CapturedPacket;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        match self.reader.next_packet()? {
            Ok(record) => Some(CapturedPacket {
                timestamp: record.timestamp,
                link_type: self.link_type,
                orig_len: record.orig_len,
                data: record.data.into_owned(),
            }),
            Err(e) => {
                warn!("Stopping replay at unreadable record: {}", e);
                None
            }
        }
    }
}
