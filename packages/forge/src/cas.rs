//! The content-addressed blob store.
//!
//! The intention of the CAS is that it should be as "stupid" as possible:
//! - Purely concerned with storing/retrieving bytes, keyed by their hash.
//! - Exactly one copy per unique content, however many entries reference it.
//! - Does not contain implementation details of the caches layered above.
//!
//! ## File structure
//!
//! Blobs live at `blobs/<hex[0..2]>/<hex>`: a 256-way fan-out so no single
//! directory grows unboundedly. Writes land in `blobs/.tmp/` first and are
//! committed with an atomic rename; stale temp files from crashed runs are
//! swept on open.
//!
//! ## Integrity
//!
//! Every read re-hashes the content. A blob whose content no longer matches
//! its address is moved to `blobs/.quarantine/` and reported to the caller
//! as absent; the caches above treat that as a miss and re-produce it.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use humansize::{DECIMAL, format_size};
use tracing::{debug, instrument, trace, warn};

use crate::{error::IntegrityError, fs, hash::Digest};

/// Summary of one garbage collection pass.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct GcSummary {
    /// Blobs deleted.
    pub swept: usize,
    /// Bytes reclaimed.
    pub bytes: u64,
    /// Blobs retained (live, referenced, or within the grace window).
    pub kept: usize,
}

/// Content-addressed blob storage on the local filesystem.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    /// In-memory pin counts. A pinned blob survives GC regardless of the
    /// mark phase; pins protect blobs between `put` and the cache update
    /// that makes them live.
    refs: DashMap<Digest, u64>,
}

impl BlobStore {
    /// Open the store under the cache root, recovering from interrupted
    /// writes.
    #[instrument(name = "BlobStore::open", skip_all)]
    pub fn open(cache_root: &Path) -> Result<Self> {
        let root = cache_root.join("blobs");
        fs::create_dir_all(&root)?;

        // Partial writes from a crashed run are unreachable (never renamed
        // into place), so removing them is always safe.
        let tmp = root.join(".tmp");
        fs::create_dir_all(&tmp)?;
        for entry in fs::read_dir_opt(&tmp)? {
            warn!(path = ?entry.path(), "removing stale temporary blob");
            fs::remove_file_if_exists(entry.path())?;
        }

        Ok(Self {
            root,
            refs: DashMap::new(),
        })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[..2]).join(&hex)
    }

    /// Store content, returning its digest.
    ///
    /// Idempotent: storing identical content returns the same digest and
    /// leaves exactly one copy on disk.
    #[instrument(name = "BlobStore::put", skip_all, fields(bytes = content.len()))]
    pub fn put(&self, content: &[u8]) -> Result<Digest> {
        let digest = Digest::from_buffer(content);
        let path = self.blob_path(&digest);
        if fs::metadata_opt(&path)?.is_some() {
            trace!(%digest, "blob already present");
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self
            .root
            .join(".tmp")
            .join(format!("{}.{}", digest.to_hex(), uuid::Uuid::new_v4()));
        fs::write(&tmp, content)?;

        match std::fs::rename(&tmp, &path) {
            Ok(()) => {
                trace!(%digest, "stored blob");
                Ok(digest)
            }
            Err(err) => {
                fs::remove_file_if_exists(&tmp)?;
                // A concurrent writer beat us to the rename; the content is
                // identical by construction.
                if fs::metadata_opt(&path)?.is_some() {
                    Ok(digest)
                } else {
                    Err(err).with_context(|| format!("commit blob {digest}"))
                }
            }
        }
    }

    /// Store many blobs, returning their digests in input order.
    pub fn put_batch<'a>(
        &self,
        contents: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Vec<Digest>> {
        contents.into_iter().map(|content| self.put(content)).collect()
    }

    /// Fetch a blob, verifying its integrity.
    ///
    /// Returns `None` for missing blobs and for blobs that failed
    /// verification (which are quarantined as a side effect).
    #[instrument(name = "BlobStore::get", skip(self))]
    pub fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(digest);
        let Some(content) = fs::read_buffered_opt(&path)? else {
            return Ok(None);
        };

        let actual = Digest::from_buffer(&content);
        if actual != *digest {
            let err = IntegrityError {
                key: digest.to_hex(),
                actual: actual.to_hex(),
            };
            warn!(%err, "quarantining corrupt blob");
            self.quarantine(digest, &path)?;
            return Ok(None);
        }

        // Record the access so GC's grace window measures from last use.
        let now = filetime::FileTime::from_system_time(SystemTime::now());
        if let Err(err) = filetime::set_file_mtime(&path, now) {
            trace!(?err, "failed to touch blob access time");
        }

        Ok(Some(content))
    }

    /// Fetch many blobs; missing or corrupt blobs yield `None` slots.
    pub fn get_batch<'a>(
        &self,
        digests: impl IntoIterator<Item = &'a Digest>,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        digests.into_iter().map(|digest| self.get(digest)).collect()
    }

    /// Whether a blob is present (without verifying content).
    #[instrument(name = "BlobStore::has", skip(self))]
    pub fn has(&self, digest: &Digest) -> Result<bool> {
        Ok(fs::metadata_opt(self.blob_path(digest))?.is_some())
    }

    /// Check many digests at once.
    pub fn has_batch<'a>(
        &self,
        digests: impl IntoIterator<Item = &'a Digest>,
    ) -> Result<Vec<bool>> {
        digests.into_iter().map(|digest| self.has(digest)).collect()
    }

    /// Pin a blob against garbage collection.
    pub fn reference(&self, digest: &Digest) {
        *self.refs.entry(digest.clone()).or_insert(0) += 1;
    }

    /// Release a pin taken by [`BlobStore::reference`].
    pub fn release(&self, digest: &Digest) {
        if let Some(mut count) = self.refs.get_mut(digest) {
            *count = count.saturating_sub(1);
        }
    }

    fn pinned(&self, digest: &Digest) -> bool {
        self.refs.get(digest).map(|count| *count > 0).unwrap_or(false)
    }

    fn quarantine(&self, digest: &Digest, path: &Path) -> Result<()> {
        let jail = self.root.join(".quarantine");
        fs::create_dir_all(&jail)?;
        fs::rename(path, jail.join(digest.to_hex()))
    }

    /// Total bytes currently stored.
    pub fn size(&self) -> Result<u64> {
        let mut total = 0;
        for entry in self.walk_blobs() {
            total += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
        Ok(total)
    }

    /// Mark-sweep garbage collection.
    ///
    /// `live` is every digest referenced by a live cache entry (the mark
    /// phase input). Unmarked, unpinned blobs whose last access is older
    /// than `grace` are deleted.
    #[instrument(name = "BlobStore::gc", skip_all)]
    pub fn gc<'a>(
        &self,
        live: impl IntoIterator<Item = &'a Digest>,
        grace: Duration,
    ) -> Result<GcSummary> {
        let live = live
            .into_iter()
            .map(|digest| digest.to_hex())
            .collect::<std::collections::HashSet<_>>();
        let cutoff = SystemTime::now().checked_sub(grace);

        let mut summary = GcSummary::default();
        for entry in self.walk_blobs() {
            let name = entry.file_name().to_string_lossy().to_string();
            let marked = live.contains(&name);
            let pinned = Digest::from_hex(&name)
                .map(|digest| self.pinned(&digest))
                .unwrap_or(false);

            let expired = match (cutoff, entry.metadata()) {
                (Some(cutoff), Ok(meta)) => meta
                    .modified()
                    .map(|modified| modified <= cutoff)
                    .unwrap_or(true),
                // Grace window longer than the epoch, or unreadable
                // metadata: keep the blob.
                _ => false,
            };

            if marked || pinned || !expired {
                summary.kept += 1;
                continue;
            }

            let bytes = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    summary.swept += 1;
                    summary.bytes += bytes;
                    trace!(blob = %name, "swept blob");
                }
                Err(err) => warn!(blob = %name, ?err, "failed to sweep blob"),
            }
        }

        debug!(
            swept = summary.swept,
            reclaimed = %format_size(summary.bytes, DECIMAL),
            kept = summary.kept,
            "garbage collection complete"
        );
        Ok(summary)
    }

    fn walk_blobs(&self) -> impl Iterator<Item = walkdir::DirEntry> + '_ {
        walkdir::WalkDir::new(&self.root)
            .min_depth(2)
            .into_iter()
            .filter_entry(|entry| {
                // Skip the staging and quarantine areas entirely.
                entry.depth() > 1
                    || entry
                        .file_name()
                        .to_str()
                        .map(|name| !name.starts_with('.'))
                        .unwrap_or(true)
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn round_trip() {
        let (_dir, store) = store();
        let digest = store.put(b"hello world").unwrap();

        assert!(store.has(&digest).unwrap());
        pretty_assert_eq!(store.get(&digest).unwrap(), Some(b"hello world".to_vec()));
    }

    #[test]
    fn put_is_idempotent() {
        let (dir, store) = store();
        let first = store.put(b"content").unwrap();
        let second = store.put(b"content").unwrap();
        pretty_assert_eq!(first, second);

        // Exactly one copy on disk.
        let count = walkdir::WalkDir::new(dir.path().join("blobs"))
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .count();
        pretty_assert_eq!(count, 1);
    }

    #[test]
    fn missing_blob_is_none() {
        let (_dir, store) = store();
        let digest = Digest::from_buffer(b"never stored");
        pretty_assert_eq!(store.get(&digest).unwrap(), None);
        assert!(!store.has(&digest).unwrap());
    }

    #[test]
    fn distinct_content_distinct_digests() {
        let (_dir, store) = store();
        let a = store.put(b"a").unwrap();
        let b = store.put(b"b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn corrupt_blob_is_quarantined() {
        let (dir, store) = store();
        let digest = store.put(b"original").unwrap();

        // Flip the content on disk behind the store's back.
        let hex = digest.to_hex();
        let path = dir.path().join("blobs").join(&hex[..2]).join(&hex);
        std::fs::write(&path, b"tampered").unwrap();

        pretty_assert_eq!(store.get(&digest).unwrap(), None);
        assert!(!path.exists());
        assert!(dir.path().join("blobs/.quarantine").join(&hex).exists());
    }

    #[test]
    fn stale_tmp_files_are_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("blobs/.tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("leftover.123"), b"partial").unwrap();

        let _store = BlobStore::open(dir.path()).unwrap();
        assert!(std::fs::read_dir(&tmp).unwrap().next().is_none());
    }

    #[test]
    fn gc_respects_marks_pins_and_grace() {
        let (_dir, store) = store();
        let live = store.put(b"live").unwrap();
        let pinned = store.put(b"pinned").unwrap();
        let dead = store.put(b"dead").unwrap();
        store.reference(&pinned);

        // Zero grace: everything unmarked and unpinned is eligible.
        let summary = store.gc([&live], Duration::ZERO).unwrap();
        pretty_assert_eq!(summary.swept, 1);
        pretty_assert_eq!(summary.kept, 2);

        assert!(store.has(&live).unwrap());
        assert!(store.has(&pinned).unwrap());
        assert!(!store.has(&dead).unwrap());

        // Releasing the pin makes the blob eligible.
        store.release(&pinned);
        let summary = store.gc([&live], Duration::ZERO).unwrap();
        pretty_assert_eq!(summary.swept, 1);
        assert!(!store.has(&pinned).unwrap());
    }

    #[test]
    fn gc_grace_window_keeps_recent_blobs() {
        let (_dir, store) = store();
        let recent = store.put(b"recent").unwrap();

        let summary = store.gc([], Duration::from_secs(3600)).unwrap();
        pretty_assert_eq!(summary.swept, 0);
        assert!(store.has(&recent).unwrap());
    }

    #[test]
    fn batch_operations() {
        let (_dir, store) = store();
        let digests = store.put_batch([b"one".as_slice(), b"two".as_slice()]).unwrap();
        pretty_assert_eq!(digests.len(), 2);

        let present = store.has_batch(digests.iter()).unwrap();
        pretty_assert_eq!(present, vec![true, true]);

        let contents = store.get_batch(digests.iter()).unwrap();
        pretty_assert_eq!(contents[0], Some(b"one".to_vec()));
        pretty_assert_eq!(contents[1], Some(b"two".to_vec()));
    }
}
