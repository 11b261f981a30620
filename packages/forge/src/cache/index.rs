//! The append-mostly index file format.
//!
//! `index.bin` starts with `{magic(4), schema-version(u8)}` followed by a
//! sequence of records, each either an upsert (fingerprint plus a JSON
//! payload) or a tombstone. Updates append; loads replay. A corrupt tail is
//! truncated to the last good record, and a corrupt header abandons the
//! file entirely; the CAS is the ground truth, so the worst case is
//! re-deriving entries.

use std::{collections::HashMap, path::Path};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{codec, fs, hash::{Digest, Fingerprint}};

const VERSION: u8 = 1;

const TAG_PUT: u8 = 1;
const TAG_TOMBSTONE: u8 = 2;

/// One stored entry plus its LRU clock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Stored<E> {
    pub entry: E,
    /// Last time the entry was returned by a lookup (or written).
    pub last_access: jiff::Timestamp,
}

/// Load an index file into a map.
///
/// Returns an empty map when the file is missing, has an unacceptable
/// header, or is corrupt from the first record; a corrupt tail keeps the
/// readable prefix.
pub(crate) fn load<E: DeserializeOwned>(
    path: &Path,
    magic: [u8; 4],
) -> Result<HashMap<Fingerprint, Stored<E>>> {
    let Some(buf) = fs::read_buffered_opt(path)? else {
        return Ok(HashMap::new());
    };

    let mut reader = match codec::check_header(&buf, magic, VERSION) {
        Ok(reader) => reader,
        Err(err) => {
            warn!(?path, ?err, "rejecting index header, rebuilding from scratch");
            return Ok(HashMap::new());
        }
    };

    let mut entries = HashMap::new();
    let mut records = 0usize;
    loop {
        if reader.is_empty() {
            break;
        }
        let record_start = reader.position();
        match read_record::<E>(&mut reader) {
            Ok(Record::Put(fingerprint, stored)) => {
                entries.insert(fingerprint, stored);
                records += 1;
            }
            Ok(Record::Tombstone(fingerprint)) => {
                entries.remove(&fingerprint);
                records += 1;
            }
            Err(err) => {
                warn!(
                    ?path,
                    ?err,
                    offset = record_start,
                    "corrupt index tail, keeping {records} records"
                );
                break;
            }
        }
    }

    debug!(?path, records, entries = entries.len(), "loaded index");
    Ok(entries)
}

enum Record<E> {
    Put(Fingerprint, Stored<E>),
    Tombstone(Fingerprint),
}

fn read_record<E: DeserializeOwned>(reader: &mut codec::Reader<'_>) -> Result<Record<E>> {
    let tag = reader.u8().context("read record tag")?;
    let fingerprint = Fingerprint::from(Digest::from_bytes(
        reader.bytes().context("read fingerprint")?,
    )?);
    match tag {
        TAG_PUT => {
            let payload = reader.bytes().context("read payload")?;
            let stored = serde_json::from_slice(payload).context("decode payload")?;
            Ok(Record::Put(fingerprint, stored))
        }
        TAG_TOMBSTONE => Ok(Record::Tombstone(fingerprint)),
        other => color_eyre::eyre::bail!("unknown record tag: {other}"),
    }
}

/// Append one upsert record.
pub(crate) fn append_put<E: Serialize>(
    path: &Path,
    magic: [u8; 4],
    fingerprint: &Fingerprint,
    stored: &Stored<E>,
) -> Result<()> {
    ensure_header(path, magic)?;
    let mut buf = Vec::new();
    buf.push(TAG_PUT);
    codec::put_bytes(&mut buf, fingerprint.as_bytes());
    let payload = serde_json::to_vec(stored).context("encode payload")?;
    codec::put_bytes(&mut buf, &payload);
    fs::append(path, &buf)
}

/// Append one tombstone record.
pub(crate) fn append_tombstone(
    path: &Path,
    magic: [u8; 4],
    fingerprint: &Fingerprint,
) -> Result<()> {
    ensure_header(path, magic)?;
    let mut buf = Vec::new();
    buf.push(TAG_TOMBSTONE);
    codec::put_bytes(&mut buf, fingerprint.as_bytes());
    fs::append(path, &buf)
}

/// Rewrite the file to contain exactly the provided entries.
///
/// Used for compaction and for persisting access-time updates at flush.
/// The rewrite goes through a temp file and rename so readers never see a
/// half-written index.
pub(crate) fn rewrite<E: Serialize>(
    path: &Path,
    magic: [u8; 4],
    entries: &HashMap<Fingerprint, Stored<E>>,
) -> Result<()> {
    let mut buf = Vec::new();
    codec::put_header(&mut buf, magic, VERSION);

    // Stable order: deterministic files are diffable and testable.
    let mut fingerprints = entries.keys().collect::<Vec<_>>();
    fingerprints.sort();
    for fingerprint in fingerprints {
        let stored = &entries[fingerprint];
        buf.push(TAG_PUT);
        codec::put_bytes(&mut buf, fingerprint.as_bytes());
        let payload = serde_json::to_vec(stored).context("encode payload")?;
        codec::put_bytes(&mut buf, &payload);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("bin.tmp");
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)
}

fn ensure_header(path: &Path, magic: [u8; 4]) -> Result<()> {
    if fs::metadata_opt(path)?.is_some() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = Vec::new();
    codec::put_header(&mut buf, magic, VERSION);
    fs::write(path, &buf)
}
