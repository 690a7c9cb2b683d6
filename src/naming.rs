//! Capture file naming.
//!
//! Maps a flow's identity and start time to the directory and file its
//! packets are written to:
//!
//! ```text
//! {root}/{YYYY-MM-DD}/{src}-{dst}/{src}:{sport}-{dst}:{dport}-{start}.{PROTO}.pcap
//! {root}/{YYYY-MM-DD}/{src}-{dst}/{src}-{dst}-{start}.ICMP.pcap
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::domain::FlowKey;
use crate::protocol::{ProtocolNames, IPPROTO_ICMP};

/// Length of the date prefix used for the per-day directory.
const DATE_PREFIX_LEN: usize = 10;

/// Where a flow's packets go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePath {
    pub directory: PathBuf,
    pub file: PathBuf,
}

/// ISO-8601 timestamp with microseconds and numeric UTC offset,
/// e.g. `2024-03-01T12:30:45.123456+0000`.
pub fn iso_time_string(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.6f%z").to_string()
}

/// Compute the capture directory and file for a flow.
pub fn capture_path(
    root: &Path,
    key: &FlowKey,
    start: &DateTime<Utc>,
    protocols: &ProtocolNames,
) -> CapturePath {
    let timebuf = iso_time_string(start);
    let day = &timebuf[..DATE_PREFIX_LEN.min(timebuf.len())];
    let src = key.src.to_string();
    let dst = key.dst.to_string();

    let directory = root.join(day).join(format!("{}-{}", src, dst));

    let filename = if key.protocol == IPPROTO_ICMP {
        format!("{}-{}-{}.ICMP.pcap", src, dst, timebuf)
    } else {
        format!(
            "{}:{}-{}:{}-{}.{}.pcap",
            src,
            key.src_port,
            dst,
            key.dst_port,
            timebuf,
            protocols.display(key.protocol)
        )
    };

    let file = directory.join(filename);
    CapturePath { directory, file }
}
