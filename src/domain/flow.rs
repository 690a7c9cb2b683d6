//! Flow identity, flow state and the pre-alert retro buffer.
//!
//! A [`Flow`] carries two locks. The flow lock guards [`FlowState`];
//! the retro buffer lock guards the packets seen before the flow was
//! alerted. The buffer lock is only reachable through a held
//! [`FlowGuard`], so it is always nested under the flow lock.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};

use super::packet::CapturedPacket;

/// Transport 5-tuple identifying a flow, in the flow's first-seen direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IP protocol number (6 = TCP, 17 = UDP, ...)
    pub protocol: u8,
}

impl FlowKey {
    pub fn new(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16, protocol: u8) -> Self {
        Self {
            src,
            dst,
            src_port,
            dst_port,
            protocol,
        }
    }

    /// The same flow seen from the other endpoint.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Direction-independent form, identical for both directions of a flow.
    pub fn canonical(&self) -> Self {
        if (self.src, self.src_port) <= (self.dst, self.dst_port) {
            *self
        } else {
            self.reversed()
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {}",
            self.src, self.src_port, self.dst, self.dst_port, self.protocol
        )
    }
}

/// Mutable per-flow state, guarded by the flow lock.
#[derive(Debug, Clone, Default)]
pub struct FlowState {
    /// Set once any packet of the flow carried an alert
    pub alerted: bool,
    pub packets: u64,
    pub bytes: u64,
    /// Timestamp of the newest packet seen, relative to the UNIX epoch
    pub last_seen: Duration,
}

impl FlowState {
    /// Account for one more packet.
    pub fn record(&mut self, packet: &CapturedPacket) {
        self.packets += 1;
        self.bytes += u64::from(packet.orig_len);
        if packet.timestamp > self.last_seen {
            self.last_seen = packet.timestamp;
        }
    }
}

/// Bounded FIFO of packets captured before the flow's alert fired.
///
/// When full, the oldest packet is dropped to make room.
#[derive(Debug)]
pub struct RetroBuffer {
    packets: VecDeque<CapturedPacket>,
    capacity: usize,
    dropped: u64,
}

impl RetroBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a packet. Returns `false` if an older packet had to be dropped.
    pub fn push(&mut self, packet: CapturedPacket) -> bool {
        if self.capacity == 0 {
            self.dropped += 1;
            return false;
        }
        let mut kept_all = true;
        if self.packets.len() >= self.capacity {
            self.packets.pop_front();
            self.dropped += 1;
            kept_all = false;
        }
        self.packets.push_back(packet);
        kept_all
    }

    /// Detach the oldest buffered packet.
    pub fn pop(&mut self) -> Option<CapturedPacket> {
        self.packets.pop_front()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Packets discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// A network flow tracked by the pipeline.
pub struct Flow {
    key: FlowKey,
    start: DateTime<Utc>,
    state: Mutex<FlowState>,
    retro: Mutex<RetroBuffer>,
}

impl Flow {
    pub fn new(key: FlowKey, start: DateTime<Utc>, retro_capacity: usize) -> Self {
        Self {
            key,
            start,
            state: Mutex::new(FlowState::default()),
            retro: Mutex::new(RetroBuffer::new(retro_capacity)),
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Time the flow's first packet was seen.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start
    }

    /// Acquire the flow lock.
    pub fn lock(&self) -> FlowGuard<'_> {
        FlowGuard {
            flow: self,
            state: self.state.lock(),
        }
    }

    /// Whether the flow has been marked as containing an alert.
    pub fn has_alert(&self) -> bool {
        self.lock().alerted
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("key", &self.key)
            .field("start", &self.start)
            .finish_non_exhaustive()
    }
}

/// A held flow lock. Dereferences to the flow's [`FlowState`].
pub struct FlowGuard<'a> {
    flow: &'a Flow,
    state: MutexGuard<'a, FlowState>,
}

impl<'a> FlowGuard<'a> {
    pub fn flow(&self) -> &'a Flow {
        self.flow
    }

    /// Acquire the retro buffer lock, nested under this flow lock.
    pub fn retro(&self) -> MutexGuard<'_, RetroBuffer> {
        self.flow.retro.lock()
    }
}

impl Deref for FlowGuard<'_> {
    type Target = FlowState;

    fn deref(&self) -> &FlowState {
        &self.state
    }
}

impl DerefMut for FlowGuard<'_> {
    fn deref_mut(&mut self) -> &mut FlowState {
        &mut self.state
    }
}
