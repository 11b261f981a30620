//! The tiered result caches.
//!
//! Two local caches share one implementation: the target cache maps target
//! fingerprints to output digests, and the action cache maps action
//! fingerprints to recorded execution results. Both store metadata in an
//! append-mostly `index.bin` and name blobs held by the CAS; the CAS is the
//! ground truth, and any index that cannot be trusted is rebuilt empty.
//!
//! [`CacheCoordinator`] is the facade the rest of the engine talks to: it
//! layers the optional remote tier behind the local ones, promotes remote
//! hits locally, pushes local updates out asynchronously, and emits cache
//! events.

mod coordinator;
mod index;
mod local;
mod remote;

pub use coordinator::CacheCoordinator;
pub use local::{ActionCache, LocalCache, TargetCache};
pub use remote::RemoteCache;

pub use clients::relay::v1::{ActionEntry, OutputFile, TargetEntry};

use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::{config::CacheConfig, hash::Digest};

/// Behavior the local cache needs from an entry type.
pub trait CacheEntry: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Every CAS blob this entry names. A hit requires all of them to be
    /// present.
    fn keys(&self) -> Vec<&Digest>;

    /// Size of the referenced outputs, for the size eviction knob.
    fn bytes(&self) -> u64;

    /// When the entry was recorded.
    fn recorded_at(&self) -> jiff::Timestamp;

    /// How long entries of this shape live. Failed actions expire faster
    /// than successes.
    fn max_age(&self, config: &CacheConfig) -> Duration;
}

impl CacheEntry for TargetEntry {
    fn keys(&self) -> Vec<&Digest> {
        vec![&self.output]
    }

    fn bytes(&self) -> u64 {
        self.bytes
    }

    fn recorded_at(&self) -> jiff::Timestamp {
        self.at
    }

    fn max_age(&self, config: &CacheConfig) -> Duration {
        config.max_age
    }
}

impl CacheEntry for ActionEntry {
    fn keys(&self) -> Vec<&Digest> {
        // The inherent `ActionEntry::keys` iterator, not this trait method.
        ActionEntry::keys(self).collect()
    }

    fn bytes(&self) -> u64 {
        self.bytes
    }

    fn recorded_at(&self) -> jiff::Timestamp {
        self.at
    }

    fn max_age(&self, config: &CacheConfig) -> Duration {
        if self.ok() {
            config.max_age
        } else {
            config.failed_max_age
        }
    }
}
