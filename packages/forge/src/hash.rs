//! Hashing operations and types.
//!
//! All cache keys and blob addresses in the engine are 32-byte blake3
//! digests. The wire representation lives in the `clients` package; this
//! module re-exports it and adds the filesystem-facing operations.

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use tracing::{instrument, trace};

pub use clients::relay::v1::{Fingerprint, Key as Digest};

use crate::fs;

/// Hash the contents of the file at the specified path.
#[instrument(name = "hash_file")]
pub fn hash_file(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Digest> {
    let path = path.as_ref();
    let file = fs::open_file(path)?;

    let mut reader = std::io::BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let bytes = std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("hash file: {path:?}"))?;

    let hash = hasher.finalize();
    trace!(?path, ?bytes, "hash file");
    Ok(Digest::from_blake3(hash))
}

/// Hash a sequence of digests in order.
///
/// Shorthand over [`Digest::from_fields`] for the common case of composing
/// digests into a new digest.
pub fn hash_digests<'a>(digests: impl IntoIterator<Item = &'a Digest>) -> Digest {
    Digest::from_fields(digests.into_iter().map(|digest| digest.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn file_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.txt");
        std::fs::write(&path, b"the quick brown fox").unwrap();

        let from_file = hash_file(&path).unwrap();
        let from_buffer = Digest::from_buffer(b"the quick brown fox");
        pretty_assert_eq!(from_file, from_buffer);
    }

    #[test]
    fn digest_composition_is_order_sensitive() {
        let a = Digest::from_buffer(b"a");
        let b = Digest::from_buffer(b"b");
        assert_ne!(hash_digests([&a, &b]), hash_digests([&b, &a]));
    }
}
