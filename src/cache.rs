//! Flow-keyed cache of open capture files.
//!
//! The cache owns every open [`CaptureFile`], keyed by file path and
//! ordered by last use: the head of the order is the least recently
//! used file, the tail the most recently used one. Files are closed when
//! they sit idle for at least the configured timeout, or at teardown.
//!
//! All state sits behind a single lock. [`CaptureCache::lock`] returns a
//! [`CacheGuard`] through which lookups, creation and eviction happen,
//! so no cache entry is ever reachable outside the critical section.
//!
//! Recency is tracked with a sequence number per entry and a
//! `BTreeMap<seq, path>`; promoting an entry moves it to a fresh,
//! larger sequence number.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::DirBuilder;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::domain::{CapturedPacket, LinkType};
use crate::error::{SinkError, WriterError};
use crate::writer::{CaptureWriter, PcapWriterFactory, WriterFactory};

/// Permissions for newly created capture directories.
#[cfg(unix)]
const DIRECTORY_MODE: u32 = 0o750;

/// One open capture file.
pub struct CaptureFile {
    path: PathBuf,
    writer: Option<Box<dyn CaptureWriter>>,
    last_active: SystemTime,
    records: u64,
    seq: u64,
}

impl CaptureFile {
    pub fn new(path: PathBuf, writer: Box<dyn CaptureWriter>, opened_at: SystemTime) -> Self {
        Self {
            path,
            writer: Some(writer),
            last_active: opened_at,
            records: 0,
            seq: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Time of the most recent write.
    pub fn last_active(&self) -> SystemTime {
        self.last_active
    }

    /// Records appended through this handle.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn link_type(&self) -> Option<LinkType> {
        self.writer.as_ref().map(|w| w.link_type())
    }

    /// Append one packet. Fails with `WriterError::Closed` once closed.
    pub fn write(&mut self, packet: &CapturedPacket) -> Result<(), WriterError> {
        let writer = self.writer.as_mut().ok_or(WriterError::Closed)?;
        writer.write_packet(packet)?;
        self.records += 1;
        Ok(())
    }

    /// Durably flush everything written so far.
    pub fn sync(&mut self) -> Result<(), WriterError> {
        self.writer.as_mut().ok_or(WriterError::Closed)?.sync()
    }

    /// Record activity at `now`. Never moves `last_active` backwards.
    pub fn touch(&mut self, now: SystemTime) {
        if now > self.last_active {
            self.last_active = now;
        }
    }

    /// How long the file has been idle as of `now`.
    pub fn idle_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_active).unwrap_or(Duration::ZERO)
    }

    /// Flush and close the writer. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), WriterError> {
        match self.writer.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CaptureFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureFile")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("last_active", &self.last_active)
            .field("records", &self.records)
            .finish()
    }
}

/// How `resolve_or_create` satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// An already open file was reused
    Reused,
    /// A new file was opened
    Created,
}

impl Resolution {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created)
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<PathBuf, CaptureFile>,
    /// Recency order, oldest first
    order: BTreeMap<u64, PathBuf>,
    next_seq: u64,
    /// Path of the file used by the last packet; always the tail when set
    active_hint: Option<PathBuf>,
}

impl CacheState {
    /// Close every entry, oldest first.
    fn close_all(&mut self) -> usize {
        let mut closed = 0;
        while let Some((_, path)) = self.order.pop_first() {
            if let Some(mut file) = self.entries.remove(&path) {
                if let Err(e) = file.close() {
                    warn!("Error closing alert pcap file {:?}: {}", path, e);
                }
                closed += 1;
            }
        }
        self.entries.clear();
        self.active_hint = None;
        closed
    }
}

/// Process-wide set of open capture files.
pub struct CaptureCache {
    root: PathBuf,
    idle_timeout: Duration,
    factory: Box<dyn WriterFactory>,
    state: Mutex<CacheState>,
}

impl CaptureCache {
    /// Create a cache writing pcap files under `root`.
    pub fn new(root: impl Into<PathBuf>, idle_timeout: Duration) -> Self {
        Self::with_factory(root, idle_timeout, Box::new(PcapWriterFactory))
    }

    /// Create a cache with a custom writer factory.
    pub fn with_factory(
        root: impl Into<PathBuf>,
        idle_timeout: Duration,
        factory: Box<dyn WriterFactory>,
    ) -> Self {
        Self {
            root: root.into(),
            idle_timeout,
            factory,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Acquire the cache lock.
    pub fn lock(&self) -> CacheGuard<'_> {
        CacheGuard {
            cache: self,
            state: self.state.lock(),
        }
    }

    /// Number of open files.
    pub fn count(&self) -> usize {
        self.lock().count()
    }

    /// Paths of open files, least recently used first.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().paths()
    }

    /// Close every open file regardless of idle time.
    pub fn teardown(&self) -> usize {
        let closed = self.state.lock().close_all();
        if closed > 0 {
            info!("Closed {} alert pcap files at teardown", closed);
        }
        closed
    }
}

impl Drop for CaptureCache {
    fn drop(&mut self) {
        self.state.get_mut().close_all();
    }
}

impl fmt::Debug for CaptureCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureCache")
            .field("root", &self.root)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// A held cache lock.
pub struct CacheGuard<'a> {
    cache: &'a CaptureCache,
    state: MutexGuard<'a, CacheState>,
}

impl CacheGuard<'_> {
    /// Find the open file for `path`, or open a new one.
    ///
    /// A hit on the active hint returns the tail entry directly. Any other
    /// hit is promoted to the tail. On a miss `directory` is created if
    /// needed and a writer bound to `link_type` is opened; if either step
    /// fails nothing is added to the cache.
    pub fn resolve_or_create(
        &mut self,
        path: &Path,
        directory: &Path,
        link_type: LinkType,
        now: SystemTime,
    ) -> Result<(&mut CaptureFile, Resolution), SinkError> {
        let cache = self.cache;
        let state = &mut *self.state;
        let hinted = state.active_hint.as_deref() == Some(path);
        let seq = state.next_seq;

        match state.entries.entry(path.to_path_buf()) {
            Entry::Occupied(slot) => {
                let file = slot.into_mut();
                if !hinted {
                    state.order.remove(&file.seq);
                    state.order.insert(seq, path.to_path_buf());
                    state.next_seq += 1;
                    file.seq = seq;
                    state.active_hint = Some(path.to_path_buf());
                }
                Ok((file, Resolution::Reused))
            }
            Entry::Vacant(slot) => {
                ensure_directory(directory)?;
                let writer = cache.factory.open(path, link_type).map_err(|source| {
                    error!("Cannot create alert pcap file {:?}: {}", path, source);
                    SinkError::WriterOpenFailed {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                info!("Opened alert pcap file {:?} ({})", path, link_type);

                let mut file = CaptureFile::new(path.to_path_buf(), writer, now);
                file.seq = seq;
                state.order.insert(seq, path.to_path_buf());
                state.next_seq += 1;
                state.active_hint = Some(path.to_path_buf());
                Ok((slot.insert(file), Resolution::Created))
            }
        }
    }

    /// Close files idle for at least the timeout, starting from the least
    /// recently used. Stops at the first file that is not idle. Returns
    /// the number of files closed.
    pub fn evict_idle(&mut self, now: SystemTime) -> usize {
        let timeout = self.cache.idle_timeout;
        let state = &mut *self.state;
        let mut evicted = 0;

        while let Some((_, head)) = state.order.first_key_value() {
            if let Some(file) = state.entries.get(head) {
                if file.idle_for(now) < timeout {
                    break;
                }
            }
            let Some((_, path)) = state.order.pop_first() else {
                break;
            };

            if let Some(mut file) = state.entries.remove(&path) {
                let idle = file.idle_for(now);
                match file.close() {
                    Ok(()) => info!(
                        "Closed alert pcap file {:?} after {}s idle ({} records)",
                        path,
                        idle.as_secs(),
                        file.records()
                    ),
                    Err(e) => warn!("Error closing alert pcap file {:?}: {}", path, e),
                }
            }
            if state.active_hint.as_deref() == Some(path.as_path()) {
                state.active_hint = None;
            }
            evicted += 1;
        }

        evicted
    }

    pub fn count(&self) -> usize {
        self.state.entries.len()
    }

    /// Paths of open files, least recently used first.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.state.order.values().cloned().collect()
    }

    pub fn get(&self, path: &Path) -> Option<&CaptureFile> {
        self.state.entries.get(path)
    }

    /// Path of the file used by the last resolved packet, if still open.
    pub fn active_hint(&self) -> Option<&Path> {
        self.state.active_hint.as_deref()
    }
}

/// Create `directory` and its parents. An existing directory is fine.
fn ensure_directory(directory: &Path) -> Result<(), SinkError> {
    if directory.is_dir() {
        return Ok(());
    }

    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIRECTORY_MODE);
    }

    match builder.create(directory) {
        Ok(()) => {
            info!("Created alert pcap directory {:?}", directory);
            Ok(())
        }
        Err(_) if directory.is_dir() => Ok(()),
        Err(source) => {
            error!("Cannot create alert pcap directory {:?}: {}", directory, source);
            Err(SinkError::DirectoryCreateFailed {
                path: directory.to_path_buf(),
                source,
            })
        }
    }
}
