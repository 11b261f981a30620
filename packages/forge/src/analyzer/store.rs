//! On-disk storage for file analyses.
//!
//! Entries live under `<cache-root>/incremental/<hex[0..2]>/<hex>`, one
//! small binary file per content digest. The format is a schema version
//! byte followed by length-prefixed fields; unknown versions and corrupt
//! entries are treated as misses and overwritten by the next scan.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::{instrument, trace, warn};

use color_eyre::{Result, eyre::Context, eyre::bail};

use crate::{
    analyzer::{FileAnalysis, Import, ImportKind},
    codec,
    fs,
    hash::Digest,
};

const VERSION: u8 = 1;

/// Content-addressed analysis storage with an in-memory layer.
pub struct AnalysisStore {
    root: PathBuf,
    memory: DashMap<Digest, FileAnalysis>,
}

impl AnalysisStore {
    /// Open the store under the cache root.
    pub fn open(cache_root: &Path) -> Result<Self> {
        let root = cache_root.join("incremental");
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            memory: DashMap::new(),
        })
    }

    fn entry_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[..2]).join(&hex)
    }

    /// Load the analysis for a content digest, if present.
    #[instrument(name = "AnalysisStore::load", skip(self))]
    pub fn load(&self, digest: &Digest) -> Result<Option<FileAnalysis>> {
        if let Some(hit) = self.memory.get(digest) {
            return Ok(Some(hit.clone()));
        }

        let path = self.entry_path(digest);
        let Some(buf) = fs::read_buffered_opt(&path)? else {
            return Ok(None);
        };
        match decode(&buf) {
            Ok(analysis) if analysis.digest == *digest => {
                self.memory.insert(digest.clone(), analysis.clone());
                Ok(Some(analysis))
            }
            Ok(analysis) => {
                warn!(?path, stored = %analysis.digest, "analysis entry under wrong digest, discarding");
                fs::remove_file_if_exists(&path)?;
                Ok(None)
            }
            Err(err) => {
                warn!(?path, ?err, "unreadable analysis entry, discarding");
                fs::remove_file_if_exists(&path)?;
                Ok(None)
            }
        }
    }

    /// Persist an analysis under its content digest.
    ///
    /// Writes are idempotent: saving an analysis that is already stored
    /// rewrites an identical file.
    #[instrument(name = "AnalysisStore::save", skip_all, fields(digest = %analysis.digest))]
    pub fn save(&self, analysis: &FileAnalysis) -> Result<()> {
        let path = self.entry_path(&analysis.digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let buf = encode(analysis);
        trace!(bytes = buf.len(), "encoded analysis entry");
        fs::write(&path, &buf)?;
        self.memory.insert(analysis.digest.clone(), analysis.clone());
        Ok(())
    }
}

fn encode(analysis: &FileAnalysis) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(VERSION);
    codec::put_str(&mut buf, &analysis.path);
    codec::put_bytes(&mut buf, analysis.digest.as_bytes());
    buf.push(analysis.valid as u8);

    codec::put_varint(&mut buf, analysis.errors.len() as u64);
    for error in &analysis.errors {
        codec::put_str(&mut buf, error);
    }

    codec::put_varint(&mut buf, analysis.imports.len() as u64);
    for import in &analysis.imports {
        buf.push(import.kind.tag());
        codec::put_str(&mut buf, &import.raw);
        codec::put_varint(&mut buf, u64::from(import.line));
    }
    buf
}

fn decode(buf: &[u8]) -> Result<FileAnalysis> {
    let mut reader = codec::Reader::new(buf);
    let version = reader.u8().context("read schema version")?;
    if version != VERSION {
        bail!("unsupported analysis schema version: {version}");
    }

    let path = reader.str().context("read path")?.to_string();
    let digest = Digest::from_bytes(reader.bytes().context("read digest")?)?;
    let valid = reader.u8().context("read validity flag")? != 0;

    let error_count = reader.varint().context("read error count")?;
    let mut errors = Vec::with_capacity(error_count as usize);
    for _ in 0..error_count {
        errors.push(reader.str().context("read error")?.to_string());
    }

    let import_count = reader.varint().context("read import count")?;
    let mut imports = Vec::with_capacity(import_count as usize);
    for _ in 0..import_count {
        let tag = reader.u8().context("read import kind")?;
        let kind = ImportKind::from_tag(tag)
            .ok_or_else(|| color_eyre::eyre::eyre!("unknown import kind tag: {tag}"))?;
        let raw = reader.str().context("read import text")?.to_string();
        let line = reader.varint().context("read import line")? as u32;
        imports.push(Import { raw, kind, line });
    }

    Ok(FileAnalysis {
        path,
        digest,
        imports,
        errors,
        valid,
    })
}
