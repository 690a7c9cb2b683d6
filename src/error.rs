use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while turning a packet into a record on disk.
///
/// Every variant aborts only the packet being processed; the sink
/// releases its locks and keeps running.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Cannot create capture directory {path:?}: {source}")]
    DirectoryCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot create capture file {path:?}: {source}")]
    WriterOpenFailed {
        path: PathBuf,
        #[source]
        source: WriterError,
    },

    #[error("Failed to write packet to {path:?}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: WriterError,
    },
}

/// Errors from a single capture writer.
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pcap error: {0}")]
    Pcap(#[from] pcap_file::PcapError),

    #[error("Writer is closed")]
    Closed,
}

/// Startup configuration errors. These are fatal: the daemon does not start.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid timeout period: {0}")]
    InvalidTimeout(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors from the live packet source.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Network interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Failed to create datalink channel: {0}")]
    ChannelCreation(String),

    #[error("Insufficient permissions for packet capture (try root or CAP_NET_RAW)")]
    InsufficientPermissions,

    #[error("Cannot open capture file {path:?}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid capture file: {0}")]
    Pcap(#[from] pcap_file::PcapError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_error_mentions_path() {
        let err = SinkError::DirectoryCreateFailed {
            path: PathBuf::from("/nope/alert"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("/nope/alert"));
    }

    #[test]
    fn test_writer_error_from_io() {
        let err: WriterError = std::io::Error::from(std::io::ErrorKind::WriteZero).into();
        assert!(matches!(err, WriterError::Io(_)));
    }
}
