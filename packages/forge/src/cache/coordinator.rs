//! The cache coordinator: one facade over every tier.
//!
//! Lookups consult local tiers first and fall through to the remote; a
//! remote hit pulls the entry's blobs into the CAS and promotes the entry
//! into the local tier, so the next lookup for the same key is satisfied
//! locally. Updates write the local tier synchronously and queue a remote
//! push. All traffic is narrated through the event bus; publishers never
//! block.

use std::sync::Arc;

use color_eyre::Result;
use tracing::{debug, instrument, warn};

use crate::{
    cache::{ActionCache, ActionEntry, CacheEntry as _, TargetCache, TargetEntry},
    cas::{BlobStore, GcSummary},
    config::CacheConfig,
    events::{Event, EventBus, Tier},
    hash::{Digest, Fingerprint},
};

use super::RemoteCache;

/// Unified cache facade.
pub struct CacheCoordinator {
    cas: Arc<BlobStore>,
    targets: TargetCache,
    actions: ActionCache,
    remote: Option<RemoteCache>,
    events: EventBus,
    config: CacheConfig,
}

impl CacheCoordinator {
    /// Open every configured tier under the cache root.
    #[instrument(name = "CacheCoordinator::open", skip_all)]
    pub fn open(config: CacheConfig, events: EventBus) -> Result<Self> {
        let cas = Arc::new(BlobStore::open(&config.root)?);
        let targets = TargetCache::open_targets(config.clone(), Arc::clone(&cas))?;
        let actions = ActionCache::open_actions(config.clone(), Arc::clone(&cas))?;
        let remote = match &config.remote {
            Some(remote_config) => Some(RemoteCache::connect(remote_config)?),
            None => None,
        };
        Ok(Self {
            cas,
            targets,
            actions,
            remote,
            events,
            config,
        })
    }

    /// The blob store shared by every tier.
    pub fn cas(&self) -> &Arc<BlobStore> {
        &self.cas
    }

    /// The cache root directory.
    pub fn cache_root(&self) -> &std::path::Path {
        &self.config.root
    }

    /// Whether a target fingerprint would hit, without restoring anything.
    pub fn is_cached_target(&self, fingerprint: &Fingerprint, correlation: &str) -> bool {
        self.lookup_target(fingerprint, correlation).is_some()
    }

    /// Fetch a target entry, trying local then remote.
    #[instrument(name = "CacheCoordinator::lookup_target", skip(self))]
    pub fn lookup_target(&self, fingerprint: &Fingerprint, correlation: &str) -> Option<TargetEntry> {
        if let Some(entry) = self.targets.lookup(fingerprint) {
            self.events
                .emit(correlation, Event::CacheHit { tier: Tier::Local });
            return Some(entry);
        }

        if let Some(entry) = self.remote_target(fingerprint) {
            self.events
                .emit(correlation, Event::CacheHit { tier: Tier::Remote });
            return Some(entry);
        }

        self.events.emit(correlation, Event::CacheMiss);
        None
    }

    /// Whether an action fingerprint would hit.
    pub fn is_cached_action(&self, fingerprint: &Fingerprint, correlation: &str) -> bool {
        self.lookup_action(fingerprint, correlation).is_some()
    }

    /// Fetch an action entry, trying local then remote.
    #[instrument(name = "CacheCoordinator::lookup_action", skip(self))]
    pub fn lookup_action(&self, fingerprint: &Fingerprint, correlation: &str) -> Option<ActionEntry> {
        if let Some(entry) = self.actions.lookup(fingerprint) {
            self.events
                .emit(correlation, Event::ActionHit { tier: Tier::Local });
            return Some(entry);
        }

        if let Some(entry) = self.remote_action(fingerprint) {
            self.events
                .emit(correlation, Event::ActionHit { tier: Tier::Remote });
            return Some(entry);
        }

        self.events.emit(correlation, Event::ActionMiss);
        None
    }

    /// Record a target result: local write now, remote push queued.
    #[instrument(name = "CacheCoordinator::update_target", skip(self, entry))]
    pub fn update_target(
        &self,
        fingerprint: &Fingerprint,
        entry: TargetEntry,
        correlation: &str,
    ) -> Result<()> {
        self.targets.update(fingerprint, entry.clone())?;
        self.events.emit(correlation, Event::CacheUpdate);

        if let Some(remote) = &self.remote {
            // A target entry names its output manifest; the push must
            // carry the manifest and every blob the manifest names.
            let mut keys = entry.keys().into_iter().cloned().collect::<Vec<_>>();
            keys.extend(self.manifest_keys(&entry.output));
            let blobs = self.collect_blobs(keys.iter());
            remote.push_target(fingerprint.clone(), entry, blobs);
            self.events.emit(correlation, Event::RemotePush);
        }
        Ok(())
    }

    /// Record an action result: local write now, remote push queued.
    #[instrument(name = "CacheCoordinator::update_action", skip(self, entry))]
    pub fn update_action(
        &self,
        fingerprint: &Fingerprint,
        entry: ActionEntry,
        correlation: &str,
    ) -> Result<()> {
        self.actions.update(fingerprint, entry.clone())?;
        self.events.emit(correlation, Event::CacheUpdate);

        if let Some(remote) = &self.remote {
            let blobs = self.collect_blobs(entry.keys());
            remote.push_action(fingerprint.clone(), entry, blobs);
            self.events.emit(correlation, Event::RemotePush);
        }
        Ok(())
    }

    /// Apply local eviction policy to both caches, emitting an event when
    /// anything was removed.
    pub fn evict(&self) -> Result<usize> {
        let evicted = self.targets.evict()? + self.actions.evict()?;
        if evicted > 0 {
            self.events
                .emit("cache", Event::CacheEviction { count: evicted });
        }
        self.targets.maybe_compact()?;
        self.actions.maybe_compact()?;
        Ok(evicted)
    }

    /// Mark-sweep the CAS against both caches' live entries.
    #[instrument(name = "CacheCoordinator::run_gc", skip_all)]
    pub fn run_gc(&self) -> Result<GcSummary> {
        self.events.emit("cache", Event::GcStart);

        let mut live = self.targets.live_digests();
        live.extend(self.actions.live_digests());
        let summary = self.cas.gc(live.iter(), self.config.max_age)?;

        self.events.emit(
            "cache",
            Event::GcComplete {
                swept: summary.swept,
                bytes: summary.bytes,
            },
        );
        Ok(summary)
    }

    /// Run GC if the store has outgrown the configured size threshold.
    pub fn maybe_gc(&self) -> Result<Option<GcSummary>> {
        let Some(max_size) = self.config.max_size else {
            return Ok(None);
        };
        if self.cas.size()? <= max_size {
            return Ok(None);
        }
        debug!(max_size, "size threshold crossed, running gc");
        self.run_gc().map(Some)
    }

    /// Persist cache metadata and stop background work.
    pub fn flush(&self) -> Result<()> {
        self.targets.flush()?;
        self.actions.flush()?;
        if let Some(remote) = &self.remote {
            remote.shutdown();
        }
        Ok(())
    }

    /// Remote target hit: pull blobs, promote the entry locally
    /// (cache-fill), so subsequent lookups stay local.
    fn remote_target(&self, fingerprint: &Fingerprint) -> Option<TargetEntry> {
        let remote = self.remote.as_ref().filter(|remote| remote.enabled())?;
        let entry = remote.get_target(fingerprint)?;

        // Pull the manifest first, then everything it names.
        if !self.pull_blobs(remote, entry.keys()) {
            return None;
        }
        let manifest_keys = self.manifest_keys(&entry.output);
        if !self.pull_blobs(remote, manifest_keys.iter()) {
            return None;
        }

        self.events.emit(fingerprint.to_hex(), Event::RemotePull);
        if let Err(err) = self.targets.update(fingerprint, entry.clone()) {
            warn!(?err, "failed to promote remote target entry");
        }
        Some(entry)
    }

    /// The blobs named by a target's output manifest, if the manifest is
    /// present and readable.
    fn manifest_keys(&self, manifest_digest: &Digest) -> Vec<Digest> {
        let Ok(Some(content)) = self.cas.get(manifest_digest) else {
            return Vec::new();
        };
        serde_json::from_slice::<Vec<crate::cache::OutputFile>>(&content)
            .map(|manifest| manifest.into_iter().map(|output| output.key).collect())
            .unwrap_or_default()
    }

    /// Remote action hit with the same promotion contract.
    fn remote_action(&self, fingerprint: &Fingerprint) -> Option<ActionEntry> {
        let remote = self.remote.as_ref().filter(|remote| remote.enabled())?;
        let entry = remote.get_action(fingerprint)?;

        if !self.pull_blobs(remote, ActionEntry::keys(&entry)) {
            return None;
        }
        self.events.emit(fingerprint.to_hex(), Event::RemotePull);
        if let Err(err) = self.actions.update(fingerprint, entry.clone()) {
            warn!(?err, "failed to promote remote action entry");
        }
        Some(entry)
    }

    /// Fetch every missing blob named by a remote entry into the CAS.
    /// Returns false (treat as miss) if any blob cannot be materialized.
    fn pull_blobs<'a>(
        &self,
        remote: &RemoteCache,
        keys: impl IntoIterator<Item = &'a Digest>,
    ) -> bool {
        for key in keys {
            if self.cas.has(key).unwrap_or(false) {
                continue;
            }
            let Some(content) = remote.get_blob(key) else {
                warn!(%key, "remote entry names an unavailable blob, treating as miss");
                return false;
            };
            match self.cas.put(&content) {
                Ok(stored) if stored == *key => {}
                Ok(stored) => {
                    warn!(expected = %key, actual = %stored, "remote blob content mismatch");
                    return false;
                }
                Err(err) => {
                    warn!(?err, "failed to store pulled blob");
                    return false;
                }
            }
        }
        true
    }

    /// Read the named blobs out of the CAS for a remote push.
    fn collect_blobs<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a Digest>,
    ) -> Vec<(Digest, Vec<u8>)> {
        keys.into_iter()
            .filter_map(|key| match self.cas.get(key) {
                Ok(Some(content)) => Some((key.clone(), content)),
                _ => {
                    warn!(%key, "blob missing while collecting push payload");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelSink, StampedEvent};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn coordinator() -> (tempfile::TempDir, CacheCoordinator, flume::Receiver<StampedEvent>) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder().root(dir.path().to_path_buf()).build();
        let (sink, rx) = ChannelSink::bounded(64);
        let coordinator = CacheCoordinator::open(config, EventBus::new(Arc::new(sink))).unwrap();
        (dir, coordinator, rx)
    }

    fn fingerprint(seed: &str) -> Fingerprint {
        Fingerprint::from_fields([seed])
    }

    fn drain(rx: &flume::Receiver<StampedEvent>) -> Vec<&'static str> {
        rx.try_iter().map(|event| event.event.kind()).collect()
    }

    #[test]
    fn target_miss_then_hit() {
        let (_dir, coordinator, rx) = coordinator();
        let fp = fingerprint("target");

        assert!(!coordinator.is_cached_target(&fp, "//a:a"));
        pretty_assert_eq!(drain(&rx), vec!["cache_miss"]);

        let output = coordinator.cas().put(b"output").unwrap();
        let entry = TargetEntry::builder()
            .output(output)
            .bytes(6)
            .at(jiff::Timestamp::now())
            .build();
        coordinator.update_target(&fp, entry.clone(), "//a:a").unwrap();
        pretty_assert_eq!(drain(&rx), vec!["cache_update"]);

        pretty_assert_eq!(coordinator.lookup_target(&fp, "//a:a"), Some(entry));
        pretty_assert_eq!(drain(&rx), vec!["cache_hit"]);
    }

    #[test]
    fn action_roundtrip_with_events() {
        let (_dir, coordinator, rx) = coordinator();
        let fp = fingerprint("action");

        assert!(!coordinator.is_cached_action(&fp, "//a:a#compile:a.c"));

        let stdout = coordinator.cas().put(b"").unwrap();
        let entry = ActionEntry::builder()
            .outputs(vec![])
            .stdout(stdout.clone())
            .stderr(stdout)
            .exit_code(0)
            .duration_ms(5)
            .at(jiff::Timestamp::now())
            .build();
        coordinator
            .update_action(&fp, entry.clone(), "//a:a#compile:a.c")
            .unwrap();

        pretty_assert_eq!(
            coordinator.lookup_action(&fp, "//a:a#compile:a.c"),
            Some(entry)
        );
        pretty_assert_eq!(
            drain(&rx),
            vec!["action_miss", "cache_update", "action_hit"]
        );
    }

    #[test]
    fn gc_keeps_cached_outputs() {
        let (_dir, coordinator, _rx) = coordinator();
        let fp = fingerprint("target");

        let live = coordinator.cas().put(b"live output").unwrap();
        let dead = coordinator.cas().put(b"unreferenced").unwrap();
        let entry = TargetEntry::builder()
            .output(live.clone())
            .bytes(11)
            .at(jiff::Timestamp::now())
            .build();
        coordinator.update_target(&fp, entry, "//a:a").unwrap();

        // Force immediate eligibility by shrinking the grace window.
        let summary = coordinator
            .cas()
            .gc(coordinator.targets.live_digests().iter(), std::time::Duration::ZERO)
            .unwrap();
        pretty_assert_eq!(summary.swept, 1);
        assert!(coordinator.cas().has(&live).unwrap());
        assert!(!coordinator.cas().has(&dead).unwrap());
    }
}
