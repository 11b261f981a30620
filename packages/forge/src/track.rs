//! Two-tier file change detection.
//!
//! The tracker keeps one row per source file: a cheap stat-based metadata
//! digest and the full content digest. Checking a file recomputes only the
//! metadata digest; the content is rehashed only when the metadata moved.
//! A `touch` without a content change therefore costs one stat and one
//! small hash, and because everything downstream is keyed on the content
//! digest, it invalidates nothing.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use filetime::FileTime;
use tracing::{debug, instrument, trace};

use color_eyre::{Result, eyre::Context};

use crate::{
    codec,
    fs,
    hash::{Digest, hash_file},
};

const MAGIC: [u8; 4] = *b"FTRK";
const VERSION: u8 = 1;

/// One tracked source file.
#[derive(Clone, PartialEq, Eq, Debug)]
struct Row {
    meta: Digest,
    content: Digest,
    mtime_nanos: i128,
    size: u64,
}

/// Counters describing how much work change detection avoided.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct TrackerStats {
    /// Files whose metadata digest was unchanged (no rehash).
    pub meta_hits: u64,
    /// Files whose content had to be rehashed.
    pub rehashes: u64,
}

/// Persistent two-tier change tracker.
///
/// Rows live in memory during a run and are flushed to
/// `<cache-root>/incremental/tracker.bin`. Losing the file is harmless: the
/// next run rehashes everything once and rebuilds it.
pub struct FileTracker {
    path: PathBuf,
    workspace: PathBuf,
    rows: DashMap<String, Row>,
    stats: DashMap<&'static str, u64>,
}

impl FileTracker {
    /// Load the tracker, or start empty if the file is missing or stale.
    #[instrument(name = "FileTracker::load", skip_all)]
    pub fn load(cache_root: &Path, workspace: impl Into<PathBuf>) -> Result<Self> {
        let path = cache_root.join("incremental").join("tracker.bin");
        let tracker = Self {
            path,
            workspace: workspace.into(),
            rows: DashMap::new(),
            stats: DashMap::new(),
        };

        match fs::read_buffered_opt(&tracker.path)? {
            None => {}
            Some(buf) => match tracker.parse(&buf) {
                Ok(count) => debug!(count, "loaded tracker rows"),
                Err(err) => {
                    debug!(?err, "discarding unreadable tracker file");
                    tracker.rows.clear();
                }
            },
        }
        Ok(tracker)
    }

    fn parse(&self, buf: &[u8]) -> Result<usize> {
        let mut reader = codec::check_header(buf, MAGIC, VERSION)?;
        let mut count = 0;
        while !reader.is_empty() {
            let path = reader.str().context("read path")?.to_string();
            let meta = Digest::from_bytes(reader.bytes().context("read metadata digest")?)?;
            let content = Digest::from_bytes(reader.bytes().context("read content digest")?)?;
            let mtime_nanos = i128::from_le_bytes(
                reader
                    .take(16)
                    .context("read mtime")?
                    .try_into()
                    .expect("16 byte slice"),
            );
            let size = reader.varint().context("read size")?;
            self.rows.insert(
                path,
                Row {
                    meta,
                    content,
                    mtime_nanos,
                    size,
                },
            );
            count += 1;
        }
        Ok(count)
    }

    /// Check one file, returning its content digest.
    ///
    /// `rel` is relative to the workspace root. Files with unchanged
    /// metadata return the cached content digest without touching the file
    /// content; anything else is rehashed and the row replaced.
    #[instrument(name = "FileTracker::check", skip(self))]
    pub fn check(&self, rel: &str) -> Result<Digest> {
        let abs = self.workspace.join(rel);
        let meta = std::fs::metadata(&abs).with_context(|| format!("stat source: {abs:?}"))?;
        let mtime = FileTime::from_last_modification_time(&meta);
        let mtime_nanos = i128::from(mtime.unix_seconds()) * 1_000_000_000
            + i128::from(mtime.nanoseconds());
        let size = meta.len();
        let meta_digest = metadata_digest(rel, size, mtime_nanos);

        if let Some(row) = self.rows.get(rel) {
            if row.meta == meta_digest {
                trace!(?rel, "metadata unchanged");
                self.bump("meta_hits");
                return Ok(row.content.clone());
            }
        }

        let content = hash_file(&abs)?;
        trace!(?rel, digest = %content, "rehashed content");
        self.bump("rehashes");
        self.rows.insert(
            rel.to_string(),
            Row {
                meta: meta_digest,
                content: content.clone(),
                mtime_nanos,
                size,
            },
        );
        Ok(content)
    }

    /// Drop the row for a path.
    ///
    /// Used by the proactive mode: when a watcher reports a change, the row
    /// is removed so the next check skips straight to rehashing.
    pub fn invalidate(&self, rel: &str) {
        self.rows.remove(rel);
    }

    /// Persist all rows.
    #[instrument(name = "FileTracker::flush", skip(self))]
    pub fn flush(&self) -> Result<()> {
        let mut buf = Vec::new();
        codec::put_header(&mut buf, MAGIC, VERSION);

        // Stable output order keeps the file byte-identical across flushes
        // with identical rows.
        let mut rows = self
            .rows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect::<Vec<_>>();
        rows.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (path, row) in rows {
            codec::put_str(&mut buf, &path);
            codec::put_bytes(&mut buf, row.meta.as_bytes());
            codec::put_bytes(&mut buf, row.content.as_bytes());
            buf.extend_from_slice(&row.mtime_nanos.to_le_bytes());
            codec::put_varint(&mut buf, row.size);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, &buf)
    }

    /// Counters for this run.
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            meta_hits: self.stats.get("meta_hits").map(|v| *v).unwrap_or(0),
            rehashes: self.stats.get("rehashes").map(|v| *v).unwrap_or(0),
        }
    }

    fn bump(&self, key: &'static str) {
        *self.stats.entry(key).or_insert(0) += 1;
    }
}

/// Digest over a file's stat signature.
///
/// The path is included so rows cannot be confused across files with
/// coincidentally identical stat signatures.
fn metadata_digest(rel: &str, size: u64, mtime_nanos: i128) -> Digest {
    Digest::from_fields([
        rel.as_bytes(),
        &size.to_le_bytes()[..],
        &mtime_nanos.to_le_bytes()[..],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, FileTracker) {
        let cache = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let tracker = FileTracker::load(cache.path(), workspace.path()).unwrap();
        (cache, workspace, tracker)
    }

    #[test]
    fn unchanged_file_hits_metadata_tier() {
        let (_cache, workspace, tracker) = setup();
        std::fs::write(workspace.path().join("a.c"), b"int a;").unwrap();

        let first = tracker.check("a.c").unwrap();
        let second = tracker.check("a.c").unwrap();
        pretty_assert_eq!(first, second);

        let stats = tracker.stats();
        pretty_assert_eq!(stats.rehashes, 1);
        pretty_assert_eq!(stats.meta_hits, 1);
    }

    #[test]
    fn touch_without_change_keeps_digest() {
        let (_cache, workspace, tracker) = setup();
        let path = workspace.path().join("a.c");
        std::fs::write(&path, b"int a;").unwrap();

        let first = tracker.check("a.c").unwrap();

        // Bump mtime without changing content.
        filetime::set_file_mtime(&path, FileTime::from_unix_time(2_000_000_000, 0)).unwrap();
        let second = tracker.check("a.c").unwrap();

        // The metadata tier misses but the content digest is identical, so
        // downstream keys are unaffected.
        pretty_assert_eq!(first, second);
        pretty_assert_eq!(tracker.stats().rehashes, 2);
    }

    #[test]
    fn content_change_is_always_seen() {
        let (_cache, workspace, tracker) = setup();
        let path = workspace.path().join("a.c");
        std::fs::write(&path, b"int a;").unwrap();
        let first = tracker.check("a.c").unwrap();

        std::fs::write(&path, b"int b;").unwrap();
        let second = tracker.check("a.c").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn rows_survive_flush_and_reload() {
        let cache = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("a.c"), b"int a;").unwrap();

        let tracker = FileTracker::load(cache.path(), workspace.path()).unwrap();
        let digest = tracker.check("a.c").unwrap();
        tracker.flush().unwrap();

        let reloaded = FileTracker::load(cache.path(), workspace.path()).unwrap();
        let again = reloaded.check("a.c").unwrap();
        pretty_assert_eq!(digest, again);
        pretty_assert_eq!(reloaded.stats().meta_hits, 1);
        pretty_assert_eq!(reloaded.stats().rehashes, 0);
    }

    #[test]
    fn invalidate_forces_rehash() {
        let (_cache, workspace, tracker) = setup();
        std::fs::write(workspace.path().join("a.c"), b"int a;").unwrap();

        tracker.check("a.c").unwrap();
        tracker.invalidate("a.c");
        tracker.check("a.c").unwrap();
        pretty_assert_eq!(tracker.stats().rehashes, 2);
    }
}
