//! IPv4 ban list with wildcard patterns and whole-file persistence
//!
//! A pattern has exactly four dot-separated segments. The first two must be
//! concrete octets; the third and fourth may be `*`, which matches any value:
//!
//! ```text
//! 203.0.113.7      a single address
//! 203.0.113.*      the /24 around it
//! 203.0.*.*        the /16 around it
//! ```
//!
//! The registry keeps its patterns in memory and rewrites the backing store
//! in full after every change. A failed write is logged and reported to the
//! caller, but the in-memory change stays applied so a storage outage never
//! weakens protection. The next successful change rewrites the whole file.
//!
//! Temporary entries are held in memory only. They ban like any other entry
//! but are never written to the store, so a restart cannot turn them into
//! permanent bans.

use crate::error::ModerationError;
use log::{info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One segment of an address pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Octet {
    Exact(u8),
    Any,
}

/// A validated four-segment IPv4 pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPattern {
    octets: [Octet; 4],
}

impl AddressPattern {
    /// Pattern matching exactly one address.
    pub fn exact(addr: Ipv4Addr) -> Self {
        let [a, b, c, d] = addr.octets();
        Self {
            octets: [
                Octet::Exact(a),
                Octet::Exact(b),
                Octet::Exact(c),
                Octet::Exact(d),
            ],
        }
    }

    pub fn octets(&self) -> [Octet; 4] {
        self.octets
    }

    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        self.octets
            .iter()
            .zip(addr.octets())
            .all(|(segment, value)| match segment {
                Octet::Exact(expected) => *expected == value,
                Octet::Any => true,
            })
    }
}

impl FromStr for AddressPattern {
    type Err = ModerationError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let reject = || ModerationError::InvalidAddressPattern(text.to_string());
        let segments: Vec<&str> = text.trim().split('.').collect();
        if segments.len() != 4 {
            return Err(reject());
        }

        let mut octets = [Octet::Any; 4];
        for (index, segment) in segments.iter().enumerate() {
            octets[index] = if *segment == "*" {
                // Wildcards are limited to the last two octets
                if index < 2 {
                    return Err(reject());
                }
                Octet::Any
            } else {
                if segment.is_empty()
                    || segment.len() > 3
                    || !segment.bytes().all(|b| b.is_ascii_digit())
                {
                    return Err(reject());
                }
                Octet::Exact(segment.parse::<u8>().map_err(|_| reject())?)
            };
        }

        Ok(Self { octets })
    }
}

impl fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, octet) in self.octets.iter().enumerate() {
            if index > 0 {
                f.write_str(".")?;
            }
            match octet {
                Octet::Exact(value) => write!(f, "{}", value)?,
                Octet::Any => f.write_str("*")?,
            }
        }
        Ok(())
    }
}

/// Normalizes a peer address for ban matching. IPv4-mapped IPv6 peers are
/// matched as their IPv4 address; other IPv6 peers cannot be banned here.
pub fn ipv4_of(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Backing storage for the ban list.
pub trait BanStore: Send + Sync {
    /// Reads the raw stored text. A missing store reads as empty.
    fn load(&self) -> Result<String, ModerationError>;

    /// Replaces the stored list with `patterns`, already sorted.
    fn save(&mut self, patterns: &[String]) -> Result<(), ModerationError>;
}

fn render(patterns: &[String]) -> String {
    let mut text = patterns.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

/// Synchronous file store using write-to-temp then rename.
#[derive(Debug, Clone)]
pub struct FileBanStore {
    path: PathBuf,
}

impl FileBanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BanStore for FileBanStore {
    fn load(&self) -> Result<String, ModerationError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, patterns: &[String]) -> Result<(), ModerationError> {
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, render(patterns))?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

type Snapshot = (u64, Vec<String>);

/// File store whose writes happen on a background task.
///
/// `save` only queues the snapshot, so callers on the tick loop never wait on
/// disk. The worker coalesces queued snapshots and writes the newest one;
/// write failures are logged there.
///
/// Until the newest snapshot is on disk, `load` returns that snapshot rather
/// than the stale file. The queued write replaces the file anyway, so a
/// reload always sees what the file is about to contain.
pub struct BackgroundBanStore {
    file: FileBanStore,
    snapshots: mpsc::UnboundedSender<Snapshot>,
    pending: Arc<Mutex<Option<Snapshot>>>,
    next_seq: u64,
}

impl BackgroundBanStore {
    /// Spawns the writer task. Must be called inside a tokio runtime.
    pub fn spawn(file: FileBanStore) -> (Self, JoinHandle<()>) {
        let (snapshots, mut rx) = mpsc::unbounded_channel::<Snapshot>();
        let pending: Arc<Mutex<Option<Snapshot>>> = Arc::new(Mutex::new(None));
        let path = file.path().to_path_buf();
        let written = Arc::clone(&pending);

        let handle = tokio::spawn(async move {
            while let Some((mut seq, mut snapshot)) = rx.recv().await {
                // Only the newest snapshot matters
                while let Ok((newer_seq, newer)) = rx.try_recv() {
                    seq = newer_seq;
                    snapshot = newer;
                }

                let temp_path = path.with_extension("tmp");
                let result = async {
                    tokio::fs::write(&temp_path, render(&snapshot)).await?;
                    tokio::fs::rename(&temp_path, &path).await
                }
                .await;

                match result {
                    Ok(()) => {
                        info!("Saved {} ban entries to {}", snapshot.len(), path.display());
                        if let Ok(mut pending) = written.lock() {
                            if pending.as_ref().is_some_and(|(newest, _)| *newest == seq) {
                                *pending = None;
                            }
                        }
                    }
                    Err(e) => warn!("Failed to write ban list {}: {}", path.display(), e),
                }
            }
        });

        let store = Self {
            file,
            snapshots,
            pending,
            next_seq: 0,
        };
        (store, handle)
    }
}

impl BanStore for BackgroundBanStore {
    fn load(&self) -> Result<String, ModerationError> {
        if let Ok(pending) = self.pending.lock() {
            if let Some((_, snapshot)) = pending.as_ref() {
                return Ok(render(snapshot));
            }
        }
        self.file.load()
    }

    fn save(&mut self, patterns: &[String]) -> Result<(), ModerationError> {
        self.next_seq += 1;
        let snapshot = (self.next_seq, patterns.to_vec());
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(snapshot.clone());
        }
        self.snapshots
            .send(snapshot)
            .map_err(|_| ModerationError::PersistenceFailure("ban list writer stopped".to_string()))
    }
}

/// In-memory store, shareable so tests can inspect what was written.
#[derive(Debug, Clone, Default)]
pub struct MemoryBanStore {
    contents: Arc<Mutex<String>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryBanStore {
    pub fn with_contents(text: &str) -> Self {
        let store = Self::default();
        store.set_contents(text);
        store
    }

    pub fn contents(&self) -> String {
        self.contents.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn set_contents(&self, text: &str) {
        if let Ok(mut contents) = self.contents.lock() {
            *contents = text.to_string();
        }
    }

    /// Makes subsequent saves fail, simulating an unwritable disk.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }
}

impl BanStore for MemoryBanStore {
    fn load(&self) -> Result<String, ModerationError> {
        Ok(self.contents())
    }

    fn save(&mut self, patterns: &[String]) -> Result<(), ModerationError> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(ModerationError::PersistenceFailure(
                "store is unwritable".to_string(),
            ));
        }
        self.set_contents(&render(patterns));
        Ok(())
    }
}

/// Result of a ban list change.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Whether the in-memory set changed
    pub changed: bool,
    /// Set when the change could not be written to the store
    pub persist_error: Option<ModerationError>,
}

pub struct BanRegistry {
    patterns: BTreeMap<String, AddressPattern>,
    /// In-memory only, never saved
    temporary: BTreeMap<String, AddressPattern>,
    store: Box<dyn BanStore>,
}

impl BanRegistry {
    /// Creates an empty registry. Call [`BanRegistry::reload`] to read the store.
    pub fn new(store: Box<dyn BanStore>) -> Self {
        Self {
            patterns: BTreeMap::new(),
            temporary: BTreeMap::new(),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBanStore::default()))
    }

    pub fn is_banned(&self, addr: IpAddr) -> bool {
        ipv4_of(addr).is_some_and(|v4| self.is_banned_v4(v4))
    }

    pub fn is_banned_v4(&self, addr: Ipv4Addr) -> bool {
        self.patterns
            .values()
            .chain(self.temporary.values())
            .any(|pattern| pattern.matches(addr))
    }

    /// Whether `pattern` is listed, compared in normalized form.
    pub fn contains(&self, pattern: &str) -> bool {
        AddressPattern::from_str(pattern)
            .map(|p| {
                let key = p.to_string();
                self.patterns.contains_key(&key) || self.temporary.contains_key(&key)
            })
            .unwrap_or(false)
    }

    pub fn is_temporary(&self, pattern: &str) -> bool {
        AddressPattern::from_str(pattern)
            .map(|p| self.temporary.contains_key(&p.to_string()))
            .unwrap_or(false)
    }

    /// Adds a permanent pattern. Malformed patterns are rejected before
    /// anything changes. A temporary entry for the same pattern is promoted.
    pub fn add(&mut self, pattern: &str) -> Result<Mutation, ModerationError> {
        let parsed = AddressPattern::from_str(pattern)?;
        let key = parsed.to_string();
        if self.patterns.contains_key(&key) {
            return Ok(Mutation {
                changed: false,
                persist_error: None,
            });
        }

        self.temporary.remove(&key);
        self.patterns.insert(key.clone(), parsed);
        info!("Banned {}", key);
        Ok(Mutation {
            changed: true,
            persist_error: self.flush(),
        })
    }

    /// Adds an entry that is never persisted. Returns false when the pattern
    /// is already listed in either form.
    pub fn add_temporary(&mut self, pattern: &str) -> Result<bool, ModerationError> {
        let parsed = AddressPattern::from_str(pattern)?;
        let key = parsed.to_string();
        if self.patterns.contains_key(&key) || self.temporary.contains_key(&key) {
            return Ok(false);
        }

        self.temporary.insert(key.clone(), parsed);
        info!("Temporarily banned {}", key);
        Ok(true)
    }

    /// Removes a pattern in whichever form it is listed. The store is only
    /// rewritten when a permanent entry went away.
    pub fn remove(&mut self, pattern: &str) -> Result<Mutation, ModerationError> {
        let key = AddressPattern::from_str(pattern)?.to_string();
        let was_temporary = self.temporary.remove(&key).is_some();
        let was_permanent = self.patterns.remove(&key).is_some();
        if !was_temporary && !was_permanent {
            return Ok(Mutation {
                changed: false,
                persist_error: None,
            });
        }

        info!("Unbanned {}", key);
        Ok(Mutation {
            changed: true,
            persist_error: if was_permanent { self.flush() } else { None },
        })
    }

    /// Lifts a temporary entry. Permanent entries are left alone.
    pub fn remove_temporary(&mut self, pattern: &str) -> bool {
        AddressPattern::from_str(pattern)
            .map(|p| self.temporary.remove(&p.to_string()).is_some())
            .unwrap_or(false)
    }

    /// Sorted snapshot of every pattern, temporary ones included.
    pub fn list(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .patterns
            .keys()
            .chain(self.temporary.keys())
            .cloned()
            .collect();
        all.sort();
        all
    }

    /// One page of the sorted snapshot, `page` counting from zero.
    pub fn list_page(&self, page: usize, per_page: usize) -> Vec<String> {
        self.list()
            .into_iter()
            .skip(page.saturating_mul(per_page))
            .take(per_page)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len() + self.temporary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.temporary.is_empty()
    }

    pub fn temporary_len(&self) -> usize {
        self.temporary.len()
    }

    /// Replaces the permanent set with the store's contents and returns its
    /// size. Temporary entries survive, unless the store now lists them.
    ///
    /// Blank lines and `#` comments are skipped; malformed lines are logged
    /// and skipped so a hand-edited file cannot prevent startup. When the
    /// store cannot be read the current set is kept.
    pub fn reload(&mut self) -> Result<usize, ModerationError> {
        let text = self.store.load()?;
        let mut patterns = BTreeMap::new();

        for (line_num, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match AddressPattern::from_str(trimmed) {
                Ok(pattern) => {
                    patterns.insert(pattern.to_string(), pattern);
                }
                Err(_) => warn!("Skipping invalid ban entry on line {}: {}", line_num + 1, trimmed),
            }
        }

        self.temporary.retain(|key, _| !patterns.contains_key(key));
        self.patterns = patterns;
        info!("Loaded {} ban entries", self.patterns.len());
        Ok(self.patterns.len())
    }

    /// Writes the full sorted permanent list to the store.
    pub fn flush(&mut self) -> Option<ModerationError> {
        let snapshot: Vec<String> = self.patterns.keys().cloned().collect();
        match self.store.save(&snapshot) {
            Ok(()) => None,
            Err(e) => {
                warn!("Ban list change is in memory only: {}", e);
                Some(e)
            }
        }
    }
}
