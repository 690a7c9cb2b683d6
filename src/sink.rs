//! Per-packet entry point of the alert capture sink.
//!
//! The pipeline calls [`PacketSink::admit`] and then
//! [`PacketSink::process`] for every packet of a flow that carries an
//! alert. Processing names the flow's capture file, resolves it in the
//! cache, drains the flow's pre-alert packets into a newly opened file,
//! appends the packet with a durable flush and finally sweeps idle files.
//!
//! # Lock order
//!
//! ```text
//! flow lock ──► cache lock ──► retro buffer lock
//! ```
//!
//! The flow lock is taken first and held until the drain is done; the
//! cache lock is taken while it is held and kept until the eviction
//! sweep ends. The retro buffer lock is innermost and only reachable
//! through the held flow lock. Nothing here takes a flow lock while
//! holding the cache lock, so two workers on different flows cannot
//! deadlock.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tracing::warn;

use crate::cache::{CaptureCache, Resolution};
use crate::domain::{CapturedPacket, Flow};
use crate::drain::{drain_retro_buffer, DrainReport};
use crate::error::SinkError;
use crate::naming;
use crate::protocol::ProtocolNames;

/// What happened to one processed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Capture file the packet was written to
    pub path: PathBuf,
    pub resolution: Resolution,
    /// Buffered packets written ahead of this one
    pub drained: usize,
    /// Idle files closed by the sweep after the write
    pub evicted: usize,
}

/// Running counters for the sink.
#[derive(Debug, Default)]
pub struct SinkStats {
    packets_written: AtomicU64,
    packets_drained: AtomicU64,
    files_opened: AtomicU64,
    files_evicted: AtomicU64,
    failures: AtomicU64,
}

/// A point-in-time copy of [`SinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_written: u64,
    pub packets_drained: u64,
    pub files_opened: u64,
    pub files_evicted: u64,
    pub failures: u64,
}

impl SinkStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_written: self.packets_written.load(Ordering::Relaxed),
            packets_drained: self.packets_drained.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            files_evicted: self.files_evicted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: usize) {
        if n > 0 {
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

/// Writes every packet of alerted flows to per-flow capture files.
#[derive(Debug)]
pub struct PacketSink {
    cache: CaptureCache,
    protocols: ProtocolNames,
    stats: SinkStats,
}

impl PacketSink {
    pub fn new(cache: CaptureCache, protocols: ProtocolNames) -> Self {
        Self {
            cache,
            protocols,
            stats: SinkStats::default(),
        }
    }

    pub fn cache(&self) -> &CaptureCache {
        &self.cache
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a packet should be processed: it must belong to a flow,
    /// and that flow must have been marked as containing an alert (by
    /// this packet or an earlier one).
    pub fn admit(&self, flow: Option<&Flow>) -> bool {
        flow.is_some_and(Flow::has_alert)
    }

    /// Admit and process in one call. `Ok(None)` means the packet was not admitted.
    pub fn handle(
        &self,
        flow: Option<&Flow>,
        packet: &CapturedPacket,
    ) -> Result<Option<ProcessOutcome>, SinkError> {
        match flow {
            Some(flow) if self.admit(Some(flow)) => self.process(flow, packet).map(Some),
            _ => Ok(None),
        }
    }

    /// Write `packet` to its flow's capture file, using the current time
    /// for idle tracking.
    pub fn process(&self, flow: &Flow, packet: &CapturedPacket) -> Result<ProcessOutcome, SinkError> {
        self.process_at(flow, packet, SystemTime::now())
    }

    /// Write `packet` to its flow's capture file as of `now`.
    pub fn process_at(
        &self,
        flow: &Flow,
        packet: &CapturedPacket,
        now: SystemTime,
    ) -> Result<ProcessOutcome, SinkError> {
        let flow_guard = flow.lock();
        let target = naming::capture_path(
            self.cache.root(),
            flow.key(),
            &flow.start_time(),
            &self.protocols,
        );

        let mut cache = self.cache.lock();
        let (file, resolution) =
            match cache.resolve_or_create(&target.file, &target.directory, packet.link_type, now) {
                Ok(found) => found,
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };

        let drained = if resolution.is_created() {
            self.stats.files_opened.fetch_add(1, Ordering::Relaxed);
            drain_retro_buffer(&flow_guard, file)
        } else {
            DrainReport::default()
        };
        drop(flow_guard);

        let written = file.write(packet).and_then(|()| file.sync());
        file.touch(now);
        let path = target.file;

        let evicted = cache.evict_idle(now);
        drop(cache);

        SinkStats::add(&self.stats.packets_drained, drained.written);
        SinkStats::add(&self.stats.files_evicted, evicted);

        match written {
            Ok(()) => {
                self.stats.packets_written.fetch_add(1, Ordering::Relaxed);
                Ok(ProcessOutcome {
                    path,
                    resolution,
                    drained: drained.written,
                    evicted,
                })
            }
            Err(source) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Dropped packet for {:?}: {}", path, source);
                Err(SinkError::WriteFailed { path, source })
            }
        }
    }

    /// Close every open capture file. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        self.cache.teardown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FlowKey, LinkType};
    use crate::writer::testing::MemoryFactory;
    use chrono::{TimeZone, Utc};
    use pcap_file::pcap::PcapReader;
    use std::fs::File;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn tcp_flow(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Flow {
        let key = FlowKey::new(
            IpAddr::V4(Ipv4Addr::from(src)),
            sport,
            IpAddr::V4(Ipv4Addr::from(dst)),
            dport,
            6,
        );
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Flow::new(key, start, 16)
    }

    fn flow_f() -> Flow {
        tcp_flow([10, 0, 0, 1], 1234, [10, 0, 0, 2], 80)
    }

    fn flow_g() -> Flow {
        tcp_flow([192, 168, 1, 5], 40000, [192, 168, 1, 9], 443)
    }

    fn packet(tag: u8, secs: u64) -> CapturedPacket {
        CapturedPacket::new(Duration::from_secs(secs), LinkType::ETHERNET, vec![tag; 60])
    }

    fn alert_with_history(flow: &Flow, history: &[u8]) {
        let mut guard = flow.lock();
        for (i, tag) in history.iter().enumerate() {
            guard.retro().push(packet(*tag, i as u64));
        }
        guard.alerted = true;
    }

    fn pcap_sink(temp: &TempDir) -> PacketSink {
        let cache = CaptureCache::new(temp.path().join("alert"), TIMEOUT);
        PacketSink::new(cache, ProtocolNames::builtin())
    }

    fn record_tags(path: &Path) -> Vec<u8> {
        let mut reader = PcapReader::new(File::open(path).unwrap()).unwrap();
        let mut tags = Vec::new();
        while let Some(record) = reader.next_packet() {
            tags.push(record.unwrap().data[0]);
        }
        tags
    }

    mod admit_tests {
        use super::*;

        #[test]
        fn rejects_missing_flow() {
            let temp = TempDir::new().unwrap();
            assert!(!pcap_sink(&temp).admit(None));
        }

        #[test]
        fn rejects_flow_without_alert() {
            let temp = TempDir::new().unwrap();
            assert!(!pcap_sink(&temp).admit(Some(&flow_f())));
        }

        #[test]
        fn accepts_alerted_flow() {
            let temp = TempDir::new().unwrap();
            let flow = flow_f();
            flow.lock().alerted = true;
            assert!(pcap_sink(&temp).admit(Some(&flow)));
        }

        #[test]
        fn handle_skips_unadmitted_packets() {
            let temp = TempDir::new().unwrap();
            let sink = pcap_sink(&temp);
            assert_eq!(sink.handle(Some(&flow_f()), &packet(1, 0)).unwrap(), None);
            assert_eq!(sink.handle(None, &packet(1, 0)).unwrap(), None);
            assert_eq!(sink.cache().count(), 0);
        }
    }

    mod scenario_tests {
        use super::*;

        #[test]
        fn first_alert_packet_drains_history() {
            let temp = TempDir::new().unwrap();
            let sink = pcap_sink(&temp);
            let flow = flow_f();
            alert_with_history(&flow, &[1, 2, 3]);

            let outcome = sink.process_at(&flow, &packet(4, 10), at(0)).unwrap();

            assert_eq!(outcome.resolution, Resolution::Created);
            assert_eq!(outcome.drained, 3);
            assert!(outcome
                .path
                .ends_with("2024-03-01/10.0.0.1-10.0.0.2/10.0.0.1:1234-10.0.0.2:80-2024-03-01T12:00:00.000000+0000.TCP.pcap"));
            assert_eq!(record_tags(&outcome.path), vec![1, 2, 3, 4]);
            assert!(flow.lock().retro().is_empty());
            assert_eq!(sink.cache().count(), 1);
        }

        #[test]
        fn second_packet_reuses_file() {
            let temp = TempDir::new().unwrap();
            let sink = pcap_sink(&temp);
            let flow = flow_f();
            alert_with_history(&flow, &[1, 2, 3]);

            let first = sink.process_at(&flow, &packet(4, 10), at(0)).unwrap();
            let second = sink.process_at(&flow, &packet(5, 11), at(1)).unwrap();

            assert_eq!(second.path, first.path);
            assert_eq!(second.resolution, Resolution::Reused);
            assert_eq!(second.drained, 0);
            assert_eq!(record_tags(&second.path), vec![1, 2, 3, 4, 5]);
            assert_eq!(sink.cache().count(), 1);
        }

        #[test]
        fn reused_file_does_not_redrain() {
            let temp = TempDir::new().unwrap();
            let sink = pcap_sink(&temp);
            let flow = flow_f();
            alert_with_history(&flow, &[1]);
            sink.process_at(&flow, &packet(2, 10), at(0)).unwrap();

            flow.lock().retro().push(packet(9, 11));
            let outcome = sink.process_at(&flow, &packet(3, 12), at(1)).unwrap();

            assert_eq!(outcome.drained, 0);
            assert_eq!(record_tags(&outcome.path), vec![1, 2, 3]);
            assert_eq!(flow.lock().retro().len(), 1);
        }

        #[test]
        fn idle_flow_evicted_by_other_flow() {
            let temp = TempDir::new().unwrap();
            let sink = pcap_sink(&temp);
            let f = flow_f();
            let g = flow_g();
            alert_with_history(&f, &[]);
            alert_with_history(&g, &[]);

            let f_path = sink.process_at(&f, &packet(1, 0), at(0)).unwrap().path;
            sink.process_at(&f, &packet(2, 1), at(1)).unwrap();
            let outcome = sink.process_at(&g, &packet(3, 301), at(301)).unwrap();

            assert_eq!(outcome.evicted, 1);
            assert_eq!(sink.cache().count(), 1);
            assert_eq!(sink.cache().paths(), vec![outcome.path.clone()]);
            assert_eq!(record_tags(&f_path), vec![1, 2]);
            assert_eq!(sink.stats().files_evicted, 1);
        }

        #[test]
        fn directory_failure_returns_error() {
            let temp = TempDir::new().unwrap();
            let sink = pcap_sink(&temp);
            std::fs::write(temp.path().join("alert"), b"in the way").unwrap();
            let flow = flow_f();
            alert_with_history(&flow, &[1, 2]);

            let result = sink.process_at(&flow, &packet(3, 0), at(0));

            assert!(matches!(result, Err(SinkError::DirectoryCreateFailed { .. })));
            assert_eq!(sink.cache().count(), 0);
            assert_eq!(flow.lock().retro().len(), 2);
            assert_eq!(sink.stats().failures, 1);
        }

        #[test]
        fn concurrent_flows_do_not_deadlock() {
            let temp = TempDir::new().unwrap();
            let sink = Arc::new(pcap_sink(&temp));
            let flows = [Arc::new(flow_f()), Arc::new(flow_g())];
            for flow in &flows {
                alert_with_history(flow, &[7]);
            }

            std::thread::scope(|scope| {
                for flow in &flows {
                    let sink = Arc::clone(&sink);
                    let flow = Arc::clone(flow);
                    scope.spawn(move || {
                        for n in 0..20u8 {
                            sink.process_at(&flow, &packet(n, u64::from(n)), at(u64::from(n)))
                                .unwrap();
                        }
                    });
                }
            });

            assert_eq!(sink.cache().count(), 2);
            for path in sink.cache().paths() {
                assert_eq!(record_tags(&path).len(), 21);
            }
        }
    }

    mod failure_tests {
        use super::*;

        fn memory_sink(temp: &TempDir, factory: &MemoryFactory) -> PacketSink {
            let cache =
                CaptureCache::with_factory(temp.path(), TIMEOUT, Box::new(factory.clone()));
            PacketSink::new(cache, ProtocolNames::builtin())
        }

        #[test]
        fn write_failure_keeps_file_open() {
            let temp = TempDir::new().unwrap();
            let factory = MemoryFactory::default();
            let sink = memory_sink(&temp, &factory);
            let flow = flow_f();
            alert_with_history(&flow, &[]);
            sink.process_at(&flow, &packet(1, 0), at(0)).unwrap();

            *factory.fail_write.lock() = true;
            let result = sink.process_at(&flow, &packet(2, 1), at(100));

            assert!(matches!(result, Err(SinkError::WriteFailed { .. })));
            assert_eq!(sink.cache().count(), 1);
            let path = sink.cache().paths().remove(0);
            assert_eq!(sink.cache().lock().get(&path).unwrap().last_active(), at(100));
            assert_eq!(factory.opens(&path), 1);
        }

        #[test]
        fn every_packet_is_synced() {
            let temp = TempDir::new().unwrap();
            let factory = MemoryFactory::default();
            let sink = memory_sink(&temp, &factory);
            let flow = flow_f();
            alert_with_history(&flow, &[]);

            for n in 0..3 {
                sink.process_at(&flow, &packet(n, 0), at(0)).unwrap();
            }

            assert_eq!(factory.recorded.lock().syncs, 3);
        }

        #[test]
        fn open_failure_keeps_history_for_retry() {
            let temp = TempDir::new().unwrap();
            let factory = MemoryFactory::default();
            let sink = memory_sink(&temp, &factory);
            let flow = flow_f();
            alert_with_history(&flow, &[1, 2]);

            *factory.fail_open.lock() = true;
            assert!(matches!(
                sink.process_at(&flow, &packet(3, 0), at(0)),
                Err(SinkError::WriterOpenFailed { .. })
            ));
            *factory.fail_open.lock() = false;
            let outcome = sink.process_at(&flow, &packet(4, 1), at(1)).unwrap();

            assert_eq!(outcome.drained, 2);
            let tags: Vec<u8> = factory.packets(&outcome.path).iter().map(|p| p.data[0]).collect();
            assert_eq!(tags, vec![1, 2, 4]);
        }

        #[test]
        fn many_threads_keep_count_consistent() {
            let temp = TempDir::new().unwrap();
            let factory = MemoryFactory::default();
            let sink = Arc::new(memory_sink(&temp, &factory));
            let flows: Vec<Arc<Flow>> = (0..8u8)
                .map(|i| Arc::new(tcp_flow([10, 1, 0, i], 1000 + u16::from(i), [10, 2, 0, 1], 80)))
                .collect();
            for flow in &flows {
                alert_with_history(flow, &[0]);
            }

            std::thread::scope(|scope| {
                for worker in 0..4 {
                    let sink = Arc::clone(&sink);
                    let flows = flows.clone();
                    scope.spawn(move || {
                        for round in 0..25 {
                            let flow = &flows[(worker + round) % flows.len()];
                            sink.process_at(flow, &packet(1, 0), at(0)).unwrap();
                        }
                    });
                }
            });

            assert_eq!(sink.cache().count(), 8);
            let stats = sink.stats();
            assert_eq!(stats.packets_written, 100);
            assert_eq!(stats.files_opened, 8);
            assert_eq!(stats.packets_drained, 8);
        }

        #[test]
        fn shutdown_closes_all_files() {
            let temp = TempDir::new().unwrap();
            let factory = MemoryFactory::default();
            let sink = memory_sink(&temp, &factory);
            let f = flow_f();
            let g = flow_g();
            alert_with_history(&f, &[]);
            alert_with_history(&g, &[]);
            sink.process_at(&f, &packet(1, 0), at(0)).unwrap();
            sink.process_at(&g, &packet(1, 0), at(0)).unwrap();

            assert_eq!(sink.shutdown(), 2);
            assert_eq!(sink.cache().count(), 0);
            assert_eq!(factory.closed().len(), 2);
        }
    }
}
