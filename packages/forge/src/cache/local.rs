//! The local (L1) cache tier.
//!
//! One implementation serves both flavors: [`TargetCache`] maps target
//! fingerprints to output digests, [`ActionCache`] maps action fingerprints
//! to recorded results. Readers share a lock; writers are exclusive; the
//! LRU clock is bumped lock-free so concurrent `is_cached` probes never
//! contend.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use color_eyre::Result;
use dashmap::DashMap;
use tracing::{debug, instrument, trace};

use crate::{
    cache::{CacheEntry, index, index::Stored},
    cas::BlobStore,
    config::CacheConfig,
    hash::Fingerprint,
};

const TARGET_MAGIC: [u8; 4] = *b"FTGT";
const ACTION_MAGIC: [u8; 4] = *b"FACT";

/// Compact once more than half the appended records are dead weight.
const COMPACT_TOMBSTONE_RATIO: f64 = 0.5;

/// The target-level result cache.
pub type TargetCache = LocalCache<crate::cache::TargetEntry>;

/// The action-level result cache.
pub type ActionCache = LocalCache<crate::cache::ActionEntry>;

/// A fingerprint-keyed cache persisted in an append-mostly index file.
pub struct LocalCache<E: CacheEntry> {
    path: PathBuf,
    magic: [u8; 4],
    cas: Arc<BlobStore>,
    config: CacheConfig,

    entries: RwLock<HashMap<Fingerprint, Stored<E>>>,
    /// Lock-free LRU clock, merged into `entries` at flush.
    access: DashMap<Fingerprint, jiff::Timestamp>,
    /// Appended records since the last compaction, for the tombstone ratio.
    appended: std::sync::atomic::AtomicUsize,
    tombstones: std::sync::atomic::AtomicUsize,
}

impl TargetCache {
    /// Open the target cache under the cache root.
    pub fn open_targets(config: CacheConfig, cas: Arc<BlobStore>) -> Result<Self> {
        Self::open(
            config.root.join("targets").join("index.bin"),
            TARGET_MAGIC,
            config,
            cas,
        )
    }
}

impl ActionCache {
    /// Open the action cache under the cache root.
    pub fn open_actions(config: CacheConfig, cas: Arc<BlobStore>) -> Result<Self> {
        Self::open(
            config.root.join("actions").join("index.bin"),
            ACTION_MAGIC,
            config,
            cas,
        )
    }
}

impl<E: CacheEntry> LocalCache<E> {
    fn open(path: PathBuf, magic: [u8; 4], config: CacheConfig, cas: Arc<BlobStore>) -> Result<Self> {
        let entries = index::load(&path, magic)?;
        debug!(?path, entries = entries.len(), "opened cache");
        Ok(Self {
            path,
            magic,
            cas,
            config,
            entries: RwLock::new(entries),
            access: DashMap::new(),
            appended: Default::default(),
            tombstones: Default::default(),
        })
    }

    /// Whether a valid entry exists for the fingerprint.
    pub fn is_cached(&self, fingerprint: &Fingerprint) -> bool {
        self.lookup(fingerprint).is_some()
    }

    /// Fetch a valid entry.
    ///
    /// An entry counts as a hit only if it has not expired and every blob
    /// it names is still present in the CAS; anything else is evicted and
    /// reported as a miss.
    #[instrument(name = "LocalCache::lookup", skip_all)]
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<E> {
        let entry = {
            let entries = self.entries.read().expect("cache lock");
            entries.get(fingerprint).map(|stored| stored.entry.clone())
        };
        let entry = entry?;

        let now = jiff::Timestamp::now();
        let expired = age_of(&entry, now) > entry.max_age(&self.config);
        let complete = !expired
            && entry
                .keys()
                .iter()
                .all(|key| self.cas.has(key).unwrap_or(false));

        if !complete {
            trace!(%fingerprint, expired, "invalid entry, evicting");
            self.invalidate(fingerprint);
            return None;
        }

        self.access.insert(fingerprint.clone(), now);
        Some(entry)
    }

    /// Record an entry. Idempotent: re-recording the same entry leaves the
    /// cache observably unchanged.
    #[instrument(name = "LocalCache::update", skip_all)]
    pub fn update(&self, fingerprint: &Fingerprint, entry: E) -> Result<()> {
        let stored = Stored {
            entry,
            last_access: jiff::Timestamp::now(),
        };
        index::append_put(&self.path, self.magic, fingerprint, &stored)?;
        self.appended
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        {
            let mut entries = self.entries.write().expect("cache lock");
            entries.insert(fingerprint.clone(), stored);
        }

        if let Some(max_entries) = self.config.max_entries {
            self.evict_to_count(max_entries)?;
        }
        Ok(())
    }

    /// Drop one entry.
    pub fn invalidate(&self, fingerprint: &Fingerprint) {
        let removed = {
            let mut entries = self.entries.write().expect("cache lock");
            entries.remove(fingerprint).is_some()
        };
        if removed {
            self.access.remove(fingerprint);
            if let Err(err) = index::append_tombstone(&self.path, self.magic, fingerprint) {
                // Metadata loss is recoverable; the reload simply sees the
                // stale entry and re-validates it against the CAS.
                trace!(?err, "failed to append tombstone");
            }
            self.tombstones
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Drop everything.
    pub fn clear(&self) -> Result<()> {
        {
            let mut entries = self.entries.write().expect("cache lock");
            entries.clear();
        }
        self.access.clear();
        index::rewrite::<E>(&self.path, self.magic, &HashMap::new())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every fingerprint currently cached.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.entries
            .read()
            .expect("cache lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Every CAS digest named by a live entry: the GC mark set contribution
    /// of this cache.
    pub fn live_digests(&self) -> Vec<crate::hash::Digest> {
        self.entries
            .read()
            .expect("cache lock")
            .values()
            .flat_map(|stored| {
                stored
                    .entry
                    .keys()
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Apply the eviction policy: expired entries first, then LRU down to
    /// the count and size knobs. Returns the number evicted.
    #[instrument(name = "LocalCache::evict", skip_all)]
    pub fn evict(&self) -> Result<usize> {
        let now = jiff::Timestamp::now();
        let mut evicted = 0;

        // Phase 1: age.
        let expired = {
            let entries = self.entries.read().expect("cache lock");
            entries
                .iter()
                .filter(|(_, stored)| age_of(&stored.entry, now) > stored.entry.max_age(&self.config))
                .map(|(fingerprint, _)| fingerprint.clone())
                .collect::<Vec<_>>()
        };
        for fingerprint in expired {
            self.invalidate(&fingerprint);
            evicted += 1;
        }

        // Phase 2: LRU by count.
        if let Some(max_entries) = self.config.max_entries {
            evicted += self.evict_to_count(max_entries)?;
        }

        // Phase 3: LRU by size.
        if let Some(max_size) = self.config.max_size {
            let mut by_access = self.entries_by_access();
            let mut total: u64 = {
                let entries = self.entries.read().expect("cache lock");
                entries.values().map(|stored| stored.entry.bytes()).sum()
            };
            while total > max_size {
                let Some((fingerprint, bytes)) = by_access.pop() else {
                    break;
                };
                self.invalidate(&fingerprint);
                total = total.saturating_sub(bytes);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = self.len(), "eviction pass");
        }
        Ok(evicted)
    }

    fn evict_to_count(&self, max_entries: usize) -> Result<usize> {
        let mut by_access = self.entries_by_access();
        let mut evicted = 0;
        while self.len() > max_entries {
            let Some((fingerprint, _)) = by_access.pop() else {
                break;
            };
            self.invalidate(&fingerprint);
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Live entries sorted most-recently-used first, so `pop` yields the
    /// least recently used.
    fn entries_by_access(&self) -> Vec<(Fingerprint, u64)> {
        let entries = self.entries.read().expect("cache lock");
        let mut by_access = entries
            .iter()
            .map(|(fingerprint, stored)| {
                let access = self
                    .access
                    .get(fingerprint)
                    .map(|at| *at)
                    .unwrap_or(stored.last_access);
                (access, fingerprint.clone(), stored.entry.bytes())
            })
            .collect::<Vec<_>>();
        by_access.sort_by(|a, b| b.0.cmp(&a.0));
        by_access
            .into_iter()
            .map(|(_, fingerprint, bytes)| (fingerprint, bytes))
            .collect()
    }

    /// Persist the current state, folding in access-time updates and
    /// compacting away tombstones.
    #[instrument(name = "LocalCache::flush", skip_all)]
    pub fn flush(&self) -> Result<()> {
        let mut entries = self.entries.write().expect("cache lock");
        for item in self.access.iter() {
            if let Some(stored) = entries.get_mut(item.key()) {
                stored.last_access = *item.value();
            }
        }
        index::rewrite(&self.path, self.magic, &entries)?;
        self.appended
            .store(0, std::sync::atomic::Ordering::Relaxed);
        self.tombstones
            .store(0, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Compact if tombstones dominate the appended log.
    pub fn maybe_compact(&self) -> Result<()> {
        let appended = self.appended.load(std::sync::atomic::Ordering::Relaxed);
        let tombstones = self.tombstones.load(std::sync::atomic::Ordering::Relaxed);
        if appended + tombstones == 0 {
            return Ok(());
        }
        let ratio = tombstones as f64 / (appended + tombstones) as f64;
        if ratio > COMPACT_TOMBSTONE_RATIO {
            self.flush()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn age_of<E: CacheEntry>(entry: &E, now: jiff::Timestamp) -> std::time::Duration {
    let seconds = (now.as_second() - entry.recorded_at().as_second()).max(0);
    std::time::Duration::from_secs(seconds as u64)
}
