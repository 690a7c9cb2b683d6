//! Flow tracking.
//!
//! Maps 5-tuples to shared [`Flow`]s. A packet travelling in the
//! reverse direction resolves to the flow created by the first packet
//! seen, whose key keeps that first-seen orientation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::{CapturedPacket, Flow, FlowKey};

/// Table of live flows.
#[derive(Debug)]
pub struct FlowTable {
    flows: Mutex<HashMap<FlowKey, Arc<Flow>>>,
    retro_capacity: usize,
    flow_timeout: Duration,
}

impl FlowTable {
    /// `retro_capacity` bounds each new flow's retro buffer; flows idle
    /// for `flow_timeout` are dropped by [`FlowTable::expire`].
    pub fn new(retro_capacity: usize, flow_timeout: Duration) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            retro_capacity,
            flow_timeout,
        }
    }

    /// Find the flow `key` belongs to in either direction, or start a new
    /// one at the packet's timestamp.
    pub fn get_or_insert(&self, key: FlowKey, packet: &CapturedPacket) -> Arc<Flow> {
        let mut flows = self.flows.lock();
        if let Some(flow) = flows.get(&key).or_else(|| flows.get(&key.reversed())) {
            return Arc::clone(flow);
        }

        let flow = Arc::new(Flow::new(key, packet_time(packet.timestamp), self.retro_capacity));
        flows.insert(key, Arc::clone(&flow));
        debug!("New flow {}", key);
        flow
    }

    /// Look up a flow without creating it.
    pub fn get(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        let flows = self.flows.lock();
        flows
            .get(key)
            .or_else(|| flows.get(&key.reversed()))
            .map(Arc::clone)
    }

    /// Drop flows whose last packet is older than the flow timeout,
    /// measured against the packet clock `now`. Returns how many went.
    ///
    /// Takes each flow's lock while the table lock is held.
    pub fn expire(&self, now: Duration) -> usize {
        let timeout = self.flow_timeout;
        let mut flows = self.flows.lock();
        let before = flows.len();
        flows.retain(|_, flow| now.saturating_sub(flow.lock().last_seen) < timeout);
        let expired = before - flows.len();
        if expired > 0 {
            debug!("Expired {} idle flows, {} remain", expired, flows.len());
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.lock().is_empty()
    }
}

/// Convert a packet timestamp to a wall-clock time.
fn packet_time(timestamp: Duration) -> DateTime<Utc> {
    i64::try_from(timestamp.as_secs())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, timestamp.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}
