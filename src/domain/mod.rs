//! Domain models for alert-triggered capture.
//!
//! Flows and packets as the sink sees them, independent of how they
//! were captured or decoded.

mod flow;
mod packet;

pub use flow::{Flow, FlowGuard, FlowKey, FlowState, RetroBuffer};
pub use packet::{CapturedPacket, LinkType};
