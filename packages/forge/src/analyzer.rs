//! Incremental dependency analysis.
//!
//! For every source file of a target, the analyzer produces a
//! [`FileAnalysis`]: the file's content digest plus its extracted imports.
//! Analyses are cached under the content digest, so the cache survives
//! renames, flag toggles, and anything else that does not touch file
//! content; only the cheap two-tier change check runs on warm builds.

mod scan;
mod store;

pub use scan::scan;
pub use store::AnalysisStore;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use color_eyre::{Result, eyre::Context};
use lazy_regex::regex::Regex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::{
    hash::Digest,
    target::{Language, Target},
    track::FileTracker,
};

/// How an import refers to its subject.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    /// Refers to a file within the same package or workspace.
    Relative,
    /// Refers to a third-party module.
    External,
    /// Refers to the language's standard library.
    Stdlib,
}

impl ImportKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            ImportKind::Relative => 0,
            ImportKind::External => 1,
            ImportKind::Stdlib => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ImportKind::Relative),
            1 => Some(ImportKind::External),
            2 => Some(ImportKind::Stdlib),
            _ => None,
        }
    }
}

/// One import extracted from a source file.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Import {
    /// The import text as written.
    pub raw: String,
    /// Classification of the import.
    pub kind: ImportKind,
    /// 1-based line the import appeared on.
    pub line: u32,
}

/// The cached analysis of one source file.
///
/// Stored under its content digest, so two identical files (wherever they
/// live) share one entry.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FileAnalysis {
    /// Path the file was first analyzed under, relative to the workspace.
    pub path: String,
    /// Content digest; also the cache key.
    pub digest: Digest,
    /// Extracted imports in source order.
    pub imports: Vec<Import>,
    /// Problems encountered while scanning.
    pub errors: Vec<String>,
    /// Whether the scan completed; invalid analyses have best-effort
    /// imports only.
    pub valid: bool,
}

/// Counters describing one `analyze` call.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct AnalysisMetrics {
    pub files: usize,
    pub cache_hits: usize,
    pub scanned: usize,
    pub duration: Duration,
}

/// The aggregated analysis of one target.
#[derive(Clone, Debug)]
pub struct TargetAnalysis {
    /// Per-file analyses in canonical (sorted path) order.
    pub files: Vec<FileAnalysis>,
    /// Deduplicated union of all imports across the target's files.
    pub imports: Vec<Import>,
    pub metrics: AnalysisMetrics,
}

impl TargetAnalysis {
    /// Content digests of the target's sources, in canonical order.
    pub fn source_digests(&self) -> impl Iterator<Item = &Digest> {
        self.files.iter().map(|file| &file.digest)
    }
}

/// The incremental analyzer.
pub struct Analyzer {
    workspace: PathBuf,
    tracker: FileTracker,
    store: AnalysisStore,
}

impl Analyzer {
    /// Open an analyzer over the provided workspace, persisting under the
    /// cache root.
    pub fn open(cache_root: &Path, workspace: impl Into<PathBuf>) -> Result<Self> {
        let workspace = workspace.into();
        let tracker = FileTracker::load(cache_root, &workspace)?;
        let store = AnalysisStore::open(cache_root)?;
        Ok(Self {
            workspace,
            tracker,
            store,
        })
    }

    /// Analyze every source of the target.
    #[instrument(name = "Analyzer::analyze", skip_all, fields(label = %target.label))]
    pub fn analyze(&self, target: &Target) -> Result<TargetAnalysis> {
        let start = Instant::now();
        let sources = self.expand_sources(target)?;

        // Hash (or re-validate) every source in parallel; this is the hot
        // stat-heavy part of warm builds.
        let digests = sources
            .par_iter()
            .map(|rel| self.tracker.check(rel).map(|digest| (rel.clone(), digest)))
            .collect::<Result<Vec<_>>>()?;

        let mut files = Vec::with_capacity(digests.len());
        let mut cache_hits = 0;
        let mut scanned = 0;
        for (rel, digest) in digests {
            if let Some(analysis) = self.store.load(&digest)? {
                trace!(?rel, "analysis cache hit");
                cache_hits += 1;
                files.push(analysis);
                continue;
            }

            let analysis = self.scan_file(target.language, &rel, digest)?;
            self.store.save(&analysis)?;
            scanned += 1;
            files.push(analysis);
        }

        let imports = files
            .iter()
            .flat_map(|file| file.imports.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let metrics = AnalysisMetrics {
            files: files.len(),
            cache_hits,
            scanned,
            duration: start.elapsed(),
        };
        debug!(?metrics, "analyzed target");
        Ok(TargetAnalysis {
            files,
            imports,
            metrics,
        })
    }

    /// Drop cached state for a path reported changed by a watcher.
    pub fn invalidate(&self, rel: &str) {
        self.tracker.invalidate(rel);
    }

    /// Persist tracker rows; analysis entries are written through.
    pub fn flush(&self) -> Result<()> {
        self.tracker.flush()
    }

    fn scan_file(&self, language: Language, rel: &str, digest: Digest) -> Result<FileAnalysis> {
        let abs = self.workspace.join(rel);
        let content = crate::fs::read_buffered(&abs)?;
        Ok(match String::from_utf8(content) {
            Ok(text) => {
                let imports = scan(language, &text);
                FileAnalysis {
                    path: rel.to_string(),
                    digest,
                    imports,
                    errors: Vec::new(),
                    valid: true,
                }
            }
            Err(_) => FileAnalysis {
                path: rel.to_string(),
                digest,
                imports: Vec::new(),
                errors: vec!["source is not valid UTF-8".to_string()],
                valid: false,
            },
        })
    }

    /// Expand declared sources, resolving `*`/`**` globs against the
    /// workspace. The result is sorted and deduplicated so downstream
    /// fingerprints see a canonical order.
    fn expand_sources(&self, target: &Target) -> Result<Vec<String>> {
        let mut expanded = BTreeSet::new();
        for pattern in &target.sources {
            if !pattern.contains('*') {
                expanded.insert(pattern.clone());
                continue;
            }

            let matcher = glob_regex(pattern)
                .with_context(|| format!("compile source glob: {pattern:?}"))?;
            for entry in walkdir::WalkDir::new(&self.workspace)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
            {
                let rel = match entry.path().strip_prefix(&self.workspace) {
                    Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                    Err(_) => continue,
                };
                if matcher.is_match(&rel) {
                    expanded.insert(rel);
                }
            }
        }
        Ok(expanded.into_iter().collect())
    }
}

/// Compile a source glob into an anchored regex.
///
/// Supports `**` (any path segments), `*` (within one segment), and `?`.
fn glob_regex(pattern: &str) -> Result<Regex> {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Consume a following separator so `a/**/b` matches `a/b`.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        regex.push_str("(?:.*/)?");
                    } else {
                        regex.push_str(".*");
                    }
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            ch if "\\.+()[]{}^$|".contains(ch) => {
                regex.push('\\');
                regex.push(ch);
            }
            ch => regex.push(ch),
        }
    }
    regex.push('$');
    Regex::new(&regex).context("compile glob regex")
}
