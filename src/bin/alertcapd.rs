use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use alertcap::capture::{decode, PacketSource, PcapFileSource, PnetCapture};
use alertcap::{CaptureCache, CapturedPacket, Config, FlowKey, FlowTable, PacketSink, Pipeline};

/// Packets queued per worker before the capture thread blocks.
const QUEUE_DEPTH: usize = 1024;
/// How often, in packet time, idle flows are dropped from the flow table.
const FLOW_EXPIRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "alertcapd")]
#[command(about = "Alert capture daemon - writes one pcap file per alerted flow")]
struct Args {
    /// Config file (default: $ALERTCAP_CONFIG or /etc/alertcap.conf)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network interface to capture on (e.g., eth0)
    #[arg(short, long)]
    interface: Option<String>,

    /// Replay a pcap file instead of capturing live
    #[arg(short, long, conflicts_with = "interface")]
    read: Option<PathBuf>,

    /// Capture directory, relative to the log directory unless absolute
    #[arg(short, long)]
    directory: Option<String>,

    /// Seconds before an idle capture file is closed
    #[arg(short, long)]
    timeout: Option<String>,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<String>,

    /// Address or port to watch (repeatable)
    #[arg(long = "watch", value_name = "ADDR|PORT")]
    watch: Vec<String>,

    /// Log level when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    /// List network interfaces and exit
    #[arg(long)]
    list_interfaces: bool,
}

impl Args {
    /// Command-line values, keyed like the config file.
    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut overrides = Vec::new();
        if let Some(v) = &self.interface {
            overrides.push(("interface", v.clone()));
        }
        if let Some(v) = &self.directory {
            overrides.push(("directory", v.clone()));
        }
        if let Some(v) = &self.timeout {
            overrides.push(("timeout", v.clone()));
        }
        if let Some(v) = &self.workers {
            overrides.push(("workers", v.clone()));
        }
        if let Some(v) = &self.log_level {
            overrides.push(("log-level", v.clone()));
        }
        overrides
    }
}

type Job = (FlowKey, CapturedPacket);

fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_interfaces {
        for line in PnetCapture::list_interfaces() {
            println!("{}", line);
        }
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    for (key, value) in args.overrides() {
        config
            .set(key, &value)
            .with_context(|| format!("Invalid --{} option", key))?;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    run(config, &args)
}

fn run(config: Config, args: &Args) -> Result<()> {
    let protocols = config.protocols().context("Failed to load protocol names")?;
    let mut watchlist = config.watchlist().context("Failed to load watchlist")?;
    for entry in &args.watch {
        watchlist
            .add_entry(entry)
            .with_context(|| format!("Invalid --watch entry {:?}", entry))?;
    }
    if watchlist.is_empty() {
        warn!("Watchlist is empty, no flow will raise an alert");
    }

    let mut source: Box<dyn PacketSource> = match (&args.read, &config.interface) {
        (Some(path), _) => Box::new(PcapFileSource::new(path)),
        (None, Some(name)) => Box::new(PnetCapture::new(name)?),
        (None, None) => Box::new(PnetCapture::on_default_interface()?),
    };
    let packet_clock = args.read.is_some();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl-C handler")?;
    source.set_running(running);

    let capture_dir = config.capture_dir();
    info!("Starting alertcapd on {}", source.interface_name());
    info!(
        "Capture directory {:?}, idle timeout {}s, {} workers, {} watch entries",
        capture_dir,
        config.timeout,
        config.workers,
        watchlist.len()
    );

    let sink = Arc::new(PacketSink::new(
        CaptureCache::new(capture_dir, config.idle_timeout()),
        protocols,
    ));
    let flows = Arc::new(FlowTable::new(config.retro_buffer, config.flow_timeout()));
    let pipeline = Pipeline::new(flows, Arc::new(watchlist), Arc::clone(&sink));

    let (senders, handles) = spawn_workers(config.workers, &pipeline, packet_clock)?;
    let dispatched = dispatch(source.as_mut(), &senders, &pipeline);
    drop(senders);

    for handle in handles {
        if handle.join().is_err() {
            error!("Worker thread panicked");
        }
    }

    let closed = sink.shutdown();
    let stats = sink.stats();
    info!(
        "Stopped: {} packets written ({} from retro buffers), {} files opened, {} evicted, {} closed at shutdown, {} failures",
        stats.packets_written,
        stats.packets_drained,
        stats.files_opened,
        stats.files_evicted,
        closed,
        stats.failures
    );

    dispatched.map(|_| ())
}

fn spawn_workers(
    count: usize,
    pipeline: &Pipeline,
    packet_clock: bool,
) -> Result<(Vec<SyncSender<Job>>, Vec<JoinHandle<()>>)> {
    let mut senders = Vec::with_capacity(count);
    let mut handles = Vec::with_capacity(count);

    for id in 0..count {
        let (tx, rx) = mpsc::sync_channel::<Job>(QUEUE_DEPTH);
        let pipeline = pipeline.clone();
        let handle = thread::Builder::new()
            .name(format!("alertcap-worker-{}", id))
            .spawn(move || {
                for (key, packet) in rx {
                    let result = if packet_clock {
                        let now = UNIX_EPOCH + packet.timestamp;
                        pipeline.on_packet_at(key, packet, now)
                    } else {
                        pipeline.on_packet(key, packet)
                    };
                    if let Err(e) = result {
                        debug!("Worker {} dropped packet: {}", id, e);
                    }
                }
            })
            .context("Failed to spawn worker thread")?;
        senders.push(tx);
        handles.push(handle);
    }

    Ok((senders, handles))
}

/// Feed decoded packets to the workers until the source ends.
/// Returns the number of packets dispatched.
fn dispatch(
    source: &mut dyn PacketSource,
    senders: &[SyncSender<Job>],
    pipeline: &Pipeline,
) -> Result<u64> {
    let mut dispatched = 0u64;
    let mut skipped = 0u64;
    let mut last_expiry = Duration::ZERO;

    for packet in source.packets().context("Failed to start packet capture")? {
        let Some(key) = decode::flow_key(packet.link_type, &packet.data) else {
            skipped += 1;
            continue;
        };

        let timestamp = packet.timestamp;
        let worker = worker_for(&key, senders.len());
        if senders[worker].send((key, packet)).is_err() {
            error!("Worker {} is gone, stopping capture", worker);
            break;
        }
        dispatched += 1;

        if timestamp.saturating_sub(last_expiry) >= FLOW_EXPIRY_INTERVAL {
            pipeline.expire_flows(timestamp);
            last_expiry = timestamp;
        }
    }

    info!("Capture ended: {} packets dispatched, {} non-IP skipped", dispatched, skipped);
    Ok(dispatched)
}

/// Both directions of a flow go to the same worker.
fn worker_for(key: &FlowKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.canonical().hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}
