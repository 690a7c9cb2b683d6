//! Per-packet routing between the flow table, the watchlist and the sink.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::info;

use crate::domain::{CapturedPacket, FlowKey};
use crate::error::SinkError;
use crate::flow_table::FlowTable;
use crate::sink::{PacketSink, ProcessOutcome};
use crate::watchlist::Watchlist;

/// Where a packet ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Kept in the flow's retro buffer until an alert fires
    Buffered,
    /// Written to the flow's capture file
    Written(ProcessOutcome),
}

/// Shared handles needed to process packets. Cheap to clone per worker.
#[derive(Debug, Clone)]
pub struct Pipeline {
    flows: Arc<FlowTable>,
    watchlist: Arc<Watchlist>,
    sink: Arc<PacketSink>,
}

impl Pipeline {
    pub fn new(flows: Arc<FlowTable>, watchlist: Arc<Watchlist>, sink: Arc<PacketSink>) -> Self {
        Self {
            flows,
            watchlist,
            sink,
        }
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn sink(&self) -> &PacketSink {
        &self.sink
    }

    pub fn on_packet(
        &self,
        key: FlowKey,
        packet: CapturedPacket,
    ) -> Result<Disposition, SinkError> {
        self.on_packet_at(key, packet, SystemTime::now())
    }

    /// Account the packet to its flow, then buffer it or write it.
    ///
    /// A flow becomes alerted the first time the watchlist matches it
    /// and stays alerted for its lifetime.
    pub fn on_packet_at(
        &self,
        key: FlowKey,
        packet: CapturedPacket,
        now: SystemTime,
    ) -> Result<Disposition, SinkError> {
        let flow = self.flows.get_or_insert(key, &packet);

        let mut guard = flow.lock();
        guard.record(&packet);
        if !guard.alerted && self.watchlist.matches(flow.key()) {
            guard.alerted = true;
            info!("Alert on flow {} after {} packets", flow.key(), guard.packets);
        }
        if !guard.alerted {
            guard.retro().push(packet);
            return Ok(Disposition::Buffered);
        }
        drop(guard);

        if !self.sink.admit(Some(&flow)) {
            return Ok(Disposition::Buffered);
        }
        self.sink
            .process_at(&flow, &packet, now)
            .map(Disposition::Written)
    }

    /// Drop flows idle for longer than the flow timeout.
    pub fn expire_flows(&self, now: Duration) -> usize {
        self.flows.expire(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CaptureCache, Resolution};
    use crate::domain::LinkType;
    use crate::protocol::ProtocolNames;
    use pcap_file::pcap::PcapReader;
    use std::fs::File;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        pipeline: Pipeline,
    }

    fn fixture(watch: &[&str]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut watchlist = Watchlist::new();
        for entry in watch {
            watchlist.add_entry(entry).unwrap();
        }
        let cache = CaptureCache::new(temp.path().join("alert"), Duration::from_secs(300));
        let sink = PacketSink::new(cache, ProtocolNames::builtin());
        let pipeline = Pipeline::new(
            Arc::new(FlowTable::new(4, Duration::from_secs(120))),
            Arc::new(watchlist),
            Arc::new(sink),
        );
        Fixture {
            _temp: temp,
            pipeline,
        }
    }

    fn key(dport: u16) -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            1234,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dport,
            6,
        )
    }

    fn packet(tag: u8) -> CapturedPacket {
        CapturedPacket::new(Duration::from_secs(u64::from(tag)), LinkType::ETHERNET, vec![tag; 60])
    }

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1000)
    }

    #[test]
    fn test_unwatched_flow_is_buffered() {
        let fx = fixture(&["4444"]);
        let result = fx.pipeline.on_packet_at(key(80), packet(1), now()).unwrap();

        assert_eq!(result, Disposition::Buffered);
        let flow = fx.pipeline.flows().get(&key(80)).unwrap();
        assert_eq!(flow.lock().retro().len(), 1);
        assert_eq!(fx.pipeline.sink().cache().count(), 0);
    }

    #[test]
    fn test_watched_flow_is_written() {
        let fx = fixture(&["80"]);
        let result = fx.pipeline.on_packet_at(key(80), packet(1), now()).unwrap();

        let Disposition::Written(outcome) = result else {
            panic!("expected a write, got {:?}", result);
        };
        assert_eq!(outcome.resolution, Resolution::Created);
        assert_eq!(outcome.drained, 0);
        assert!(fx.pipeline.flows().get(&key(80)).unwrap().has_alert());
    }

    #[test]
    fn test_reply_direction_shares_capture_file() {
        let fx = fixture(&["80"]);
        let first = fx.pipeline.on_packet_at(key(80), packet(1), now()).unwrap();
        let reply = fx
            .pipeline
            .on_packet_at(key(80).reversed(), packet(2), now())
            .unwrap();

        match (first, reply) {
            (Disposition::Written(a), Disposition::Written(b)) => {
                assert_eq!(a.path, b.path);
                assert_eq!(b.resolution, Resolution::Reused);
            }
            other => panic!("unexpected dispositions {:?}", other),
        }
        assert_eq!(fx.pipeline.sink().cache().count(), 1);
    }

    #[test]
    fn test_history_written_once_flow_alerts() {
        let fx = fixture(&["10.0.0.2"]);
        let quiet = Pipeline::new(
            Arc::clone(&fx.pipeline.flows),
            Arc::new(Watchlist::new()),
            Arc::clone(&fx.pipeline.sink),
        );
        quiet.on_packet_at(key(80), packet(1), now()).unwrap();
        quiet.on_packet_at(key(80), packet(2), now()).unwrap();

        let result = fx.pipeline.on_packet_at(key(80), packet(3), now()).unwrap();

        let Disposition::Written(outcome) = result else {
            panic!("expected a write, got {:?}", result);
        };
        assert_eq!(outcome.drained, 2);
        let mut reader = PcapReader::new(File::open(&outcome.path).unwrap()).unwrap();
        let mut tags = Vec::new();
        while let Some(record) = reader.next_packet() {
            tags.push(record.unwrap().data[0]);
        }
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[test]
    fn test_retro_buffer_keeps_newest_packets() {
        let fx = fixture(&[]);
        for tag in 1..=6 {
            fx.pipeline.on_packet_at(key(80), packet(tag), now()).unwrap();
        }

        let flow = fx.pipeline.flows().get(&key(80)).unwrap();
        let guard = flow.lock();
        assert_eq!(guard.packets, 6);
        assert_eq!(guard.retro().len(), 4);
        assert_eq!(guard.retro().dropped(), 2);
    }

    #[test]
    fn test_expire_flows_uses_packet_clock() {
        let fx = fixture(&[]);
        fx.pipeline.on_packet_at(key(80), packet(1), now()).unwrap();
        assert_eq!(fx.pipeline.expire_flows(Duration::from_secs(60)), 0);
        assert_eq!(fx.pipeline.expire_flows(Duration::from_secs(500)), 1);
        assert!(fx.pipeline.flows().is_empty());
    }
}
