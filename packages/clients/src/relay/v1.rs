//! Relay v1 API types and client.

use std::collections::{BTreeMap, BTreeSet};

use bon::Builder;
use color_eyre::eyre::{Context, bail};
use derive_more::{Debug, Display, From};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{instrument, trace};

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::Client;

/// The key to a content-addressed storage blob.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct Key(Vec<u8>);

impl Key {
    /// View the key as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Attempt to parse the key from a hex string.
    #[instrument(fields(hex = hex.as_ref()))]
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        let len = bytes.len();
        trace!(?len, "decoded hex");
        if len != 32 {
            bail!("invalid hash length");
        }
        Ok(Self(bytes))
    }

    /// View the key as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parse a key from raw bytes (the inverse of `as_bytes`).
    ///
    /// This is used when deserializing keys from index files or other binary
    /// formats. The bytes must be exactly 32 bytes (a blake3 hash).
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> color_eyre::Result<Self> {
        let bytes = bytes.as_ref();
        let len = bytes.len();
        if len != 32 {
            bail!("invalid hash length: expected 32 bytes, got {len}");
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Create a key from a blake3 hash.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self(hash.as_bytes().to_vec())
    }

    /// Hash the contents of a buffer to create a key.
    ///
    /// This computes the blake3 hash of the provided buffer and returns the
    /// resulting key. Use this when you have file contents or other data
    /// that you want to content-address. This is NOT for parsing keys that
    /// are already in binary format: use `from_bytes` for that.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let mut hasher = blake3::Hasher::new();
        hasher.update(buffer);
        let hash = hasher.finalize();
        Self::from_blake3(hash)
    }

    /// Hash the contents of the iterator in order.
    ///
    /// Each element is prefixed with its little-endian `u64` length before
    /// being mixed in, so that `["ab", "c"]` and `["a", "bc"]` hash to
    /// different keys. Composite cache keys are built exclusively through
    /// this method.
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            let field = field.as_ref();
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        let hash = hasher.finalize();
        Self::from_blake3(hash)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

impl PartialEq<blake3::Hash> for Key {
    fn eq(&self, other: &blake3::Hash) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<blake3::Hash> for &Key {
    fn eq(&self, other: &blake3::Hash) -> bool {
        self.0 == other.as_bytes()
    }
}

impl Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// A cache entry fingerprint.
///
/// Fingerprints are composite keys over everything that identifies a unit of
/// work (inputs, command, environment, dependency fingerprints). They share
/// the representation of [`Key`] but are deliberately a distinct type: a
/// fingerprint names a cache entry, a key names a blob.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, From, Serialize, Deserialize,
)]
#[display("{_0}")]
#[debug("{_0:?}")]
pub struct Fingerprint(Key);

impl Fingerprint {
    /// View the fingerprint as a hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Attempt to parse the fingerprint from a hex string.
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        Key::from_hex(hex).map(Self)
    }

    /// View the fingerprint as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Build a fingerprint from length-prefixed fields.
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        Self(Key::from_fields(fields))
    }
}

/// A single output file recorded by a cached action.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, Builder)]
#[builder(on(String, into))]
#[non_exhaustive]
pub struct OutputFile {
    /// Path of the output, relative to the sandbox root.
    pub path: String,
    /// Key of the output content in the CAS.
    pub key: Key,
    /// Whether the file was executable.
    #[builder(default)]
    pub executable: bool,
}

/// A cached result for a whole target.
///
/// Values name blobs in the CAS; the entry itself carries only metadata.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct TargetEntry {
    /// Key of the target's composite output manifest in the CAS.
    pub output: Key,
    /// Total size of the referenced outputs, in bytes.
    pub bytes: u64,
    /// When the entry was recorded.
    pub at: jiff::Timestamp,
}

/// A cached result for a single action.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ActionEntry {
    /// Output files produced by the action.
    pub outputs: Vec<OutputFile>,
    /// Key of the captured stdout in the CAS.
    pub stdout: Key,
    /// Key of the captured stderr in the CAS.
    pub stderr: Key,
    /// Exit code reported by the action.
    pub exit_code: i32,
    /// Wall-clock duration of the execution, in milliseconds.
    pub duration_ms: u64,
    /// Total size of the referenced outputs, in bytes.
    #[builder(default)]
    pub bytes: u64,
    /// When the entry was recorded.
    pub at: jiff::Timestamp,
}

impl ActionEntry {
    /// Whether the recorded execution succeeded.
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    /// All CAS keys referenced by this entry.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.outputs
            .iter()
            .map(|output| &output.key)
            .chain([&self.stdout, &self.stderr])
    }
}

/// Request to check which blobs exist on the remote.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, From)]
#[non_exhaustive]
pub struct CasCheckRequest {
    pub keys: BTreeSet<Key>,
}

impl CasCheckRequest {
    /// Create a new instance from the provided keys.
    pub fn new(keys: impl IntoIterator<Item = impl Into<Key>>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Response listing which of the requested blobs exist on the remote.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize, From)]
pub struct CasCheckResponse {
    pub present: BTreeSet<Key>,
}

/// Request to store a set of cache entries.
///
/// Entries are keyed by fingerprint; targets and actions use separate
/// endpoints with the same envelope shape.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct EntryPutRequest<E> {
    pub entries: BTreeMap<Fingerprint, E>,
}

impl<E> EntryPutRequest<E> {
    /// Create a new instance from the provided entries.
    pub fn new(entries: impl IntoIterator<Item = (Fingerprint, E)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

/// Response from fetching cache entries by fingerprint.
///
/// Fingerprints that miss on the remote are simply absent from the map.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EntryGetResponse<E> {
    pub entries: BTreeMap<Fingerprint, E>,
}

impl<E> Default for EntryGetResponse<E> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn key_hex_round_trip() {
        let key = Key::from_buffer(b"some content");
        let hex = key.to_hex();
        let parsed = Key::from_hex(&hex).unwrap();
        pretty_assert_eq!(parsed, key);
    }

    #[test]
    fn key_rejects_bad_length() {
        assert!(Key::from_hex("abcd").is_err());
        assert!(Key::from_bytes([0u8; 16]).is_err());
    }

    #[test]
    fn from_fields_is_prefix_safe() {
        let a = Key::from_fields(["ab", "c"]);
        let b = Key::from_fields(["a", "bc"]);
        assert_ne!(a, b);

        let c = Key::from_fields(["abc"]);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn key_serde_as_hex() {
        let key = Key::from_buffer(b"serde");
        let json = serde_json::to_string(&key).unwrap();
        pretty_assert_eq!(json, format!("\"{}\"", key.to_hex()));

        let parsed = serde_json::from_str::<Key>(&json).unwrap();
        pretty_assert_eq!(parsed, key);
    }

    #[test]
    fn action_entry_keys() {
        let entry = ActionEntry::builder()
            .outputs(vec![
                OutputFile::builder()
                    .path("out/a.o")
                    .key(Key::from_buffer(b"a.o"))
                    .build(),
            ])
            .stdout(Key::from_buffer(b"stdout"))
            .stderr(Key::from_buffer(b"stderr"))
            .exit_code(0)
            .duration_ms(12)
            .at(jiff::Timestamp::UNIX_EPOCH)
            .build();

        assert!(entry.ok());
        pretty_assert_eq!(entry.keys().count(), 3);
    }
}
