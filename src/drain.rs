//! Draining a flow's pre-alert packets into its capture file.

use tracing::{debug, warn};

use crate::cache::CaptureFile;
use crate::domain::FlowGuard;

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Packets appended to the capture file
    pub written: usize,
    /// Packets removed from the buffer but not written
    pub failed: usize,
}

impl DrainReport {
    /// Total packets detached from the flow.
    pub fn detached(&self) -> usize {
        self.written + self.failed
    }
}

/// Move every buffered packet of the flow into `file`, oldest first.
///
/// The caller holds the flow lock (`flow`); the retro buffer lock is
/// taken here and released before returning. Afterwards the buffer is
/// empty and each packet it held was detached exactly once. A packet
/// that fails to write is logged and dropped.
pub fn drain_retro_buffer(flow: &FlowGuard<'_>, file: &mut CaptureFile) -> DrainReport {
    let mut report = DrainReport::default();
    let mut buffer = flow.retro();

    while let Some(packet) = buffer.pop() {
        match file.write(&packet) {
            Ok(()) => report.written += 1,
            Err(e) => {
                warn!("Dropped buffered packet for {:?}: {}", file.path(), e);
                report.failed += 1;
            }
        }
    }
    drop(buffer);

    if report.detached() > 0 {
        debug!(
            "Drained {} buffered packets of {} into {:?}",
            report.written,
            flow.flow().key(),
            file.path()
        );
    }
    report
}
