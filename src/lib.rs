//! Alert-triggered packet capture.
//!
//! Packets are grouped into flows. Until a flow raises an alert its
//! packets are held in a small per-flow retro buffer; from the first
//! alert on, every packet of the flow is appended to a pcap file named
//! after the flow, with the buffered history written first. Open files
//! live in a process-wide cache ordered by recency and are closed after
//! an idle timeout.
//!
//! # Architecture
//!
//! - [`capture`]: packet sources (live pnet capture, pcap replay) and frame decoding
//! - [`flow_table`] / [`watchlist`] / [`pipeline`]: flow tracking and the alert trigger
//! - [`sink`]: per-packet entry point, see [`PacketSink`]
//! - [`cache`]: open capture files, recency order, idle eviction
//! - [`drain`]: moves a flow's retro buffer into its new capture file
//! - [`naming`] / [`protocol`]: capture file paths
//! - [`writer`]: the pcap file format

pub mod cache;
pub mod capture;
pub mod config;
pub mod domain;
pub mod drain;
pub mod error;
pub mod flow_table;
pub mod naming;
pub mod pipeline;
pub mod protocol;
pub mod sink;
pub mod watchlist;
pub mod writer;

pub use cache::{CaptureCache, CaptureFile, Resolution};
pub use config::Config;
pub use domain::{CapturedPacket, Flow, FlowKey, LinkType};
pub use error::{CaptureError, ConfigError, SinkError, WriterError};
pub use flow_table::FlowTable;
pub use pipeline::{Disposition, Pipeline};
pub use protocol::ProtocolNames;
pub use sink::{PacketSink, ProcessOutcome, StatsSnapshot};
pub use watchlist::Watchlist;
