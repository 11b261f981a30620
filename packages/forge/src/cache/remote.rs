//! The remote (L2) cache tier.
//!
//! Wraps the relay client with the engine's failure policy: every remote
//! error is a miss for reads and a drop for writes, logged and never
//! surfaced to the build. Pushes ride a bounded queue drained by a
//! background thread so the hot path never waits on the network.

use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use color_eyre::Result;
use tracing::{debug, instrument, trace, warn};

use clients::relay::v1::Client;

use crate::{
    cache::{ActionEntry, TargetEntry},
    config::RemoteConfig,
    hash::{Digest, Fingerprint},
};

/// Capacity of the push queue. Overflow drops the oldest-intent push with a
/// warning; remote state is advisory, so losing a push costs a future cache
/// miss, nothing more.
const PUSH_QUEUE_DEPTH: usize = 256;

/// One queued push.
pub(crate) enum Push {
    Target {
        fingerprint: Fingerprint,
        entry: TargetEntry,
        blobs: Vec<(Digest, Vec<u8>)>,
    },
    Action {
        fingerprint: Fingerprint,
        entry: ActionEntry,
        blobs: Vec<(Digest, Vec<u8>)>,
    },
}

/// Remote tier handle.
///
/// Shareable across worker threads; shutdown is interior so the owning
/// coordinator can live in an `Arc`.
pub struct RemoteCache {
    client: Arc<Client>,
    push: Mutex<Option<flume::Sender<Push>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    enabled: bool,
}

impl RemoteCache {
    /// Connect to the configured relay.
    ///
    /// The connection is not probed here: an unreachable remote shows up as
    /// misses, exactly like a reachable-but-empty one.
    pub fn connect(config: &RemoteConfig) -> Result<Self> {
        let client = Arc::new(Client::new(
            config.url.clone(),
            config.timeout,
            config.compress,
        )?);

        let (push, worker) = if config.push {
            let (tx, rx) = flume::bounded::<Push>(PUSH_QUEUE_DEPTH);
            let client = Arc::clone(&client);
            let worker = std::thread::Builder::new()
                .name("forge-remote-push".to_string())
                .spawn(move || push_loop(client, rx))
                .expect("spawn remote push thread");
            (Some(tx), Some(worker))
        } else {
            (None, None)
        };

        Ok(Self {
            client,
            push: Mutex::new(push),
            worker: Mutex::new(worker),
            enabled: config.enabled,
        })
    }

    /// Whether lookups should consult this tier.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fetch a target entry; any error is a miss.
    #[instrument(name = "RemoteCache::get_target", skip(self))]
    pub fn get_target(&self, fingerprint: &Fingerprint) -> Option<TargetEntry> {
        match self.client.target_get(fingerprint) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(?err, "remote target lookup failed, treating as miss");
                None
            }
        }
    }

    /// Fetch an action entry; any error is a miss.
    #[instrument(name = "RemoteCache::get_action", skip(self))]
    pub fn get_action(&self, fingerprint: &Fingerprint) -> Option<ActionEntry> {
        match self.client.action_get(fingerprint) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(?err, "remote action lookup failed, treating as miss");
                None
            }
        }
    }

    /// Fetch a blob; any error is a miss.
    #[instrument(name = "RemoteCache::get_blob", skip(self))]
    pub fn get_blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        match self.client.cas_read(digest) {
            Ok(content) => content,
            Err(err) => {
                warn!(?err, "remote blob read failed, treating as miss");
                None
            }
        }
    }

    /// Queue a target entry (and its blobs) for push. Never blocks.
    pub fn push_target(
        &self,
        fingerprint: Fingerprint,
        entry: TargetEntry,
        blobs: Vec<(Digest, Vec<u8>)>,
    ) {
        self.enqueue(Push::Target {
            fingerprint,
            entry,
            blobs,
        });
    }

    /// Queue an action entry (and its blobs) for push. Never blocks.
    pub fn push_action(
        &self,
        fingerprint: Fingerprint,
        entry: ActionEntry,
        blobs: Vec<(Digest, Vec<u8>)>,
    ) {
        self.enqueue(Push::Action {
            fingerprint,
            entry,
            blobs,
        });
    }

    fn enqueue(&self, push: Push) {
        let sender = self.push.lock().expect("push lock");
        let Some(sender) = sender.as_ref() else {
            return;
        };
        if let Err(flume::TrySendError::Full(_)) = sender.try_send(push) {
            warn!("remote push queue full, dropping push");
        }
    }

    /// Drain the push queue and stop the worker. Idempotent.
    pub fn shutdown(&self) {
        drop(self.push.lock().expect("push lock").take());
        let worker = self.worker.lock().expect("worker lock").take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("remote push worker panicked");
            }
        }
    }
}

impl Drop for RemoteCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn push_loop(client: Arc<Client>, rx: flume::Receiver<Push>) {
    // Receiving until the sender drops drains everything queued before
    // shutdown.
    for push in rx.iter() {
        let outcome = match push {
            Push::Target {
                fingerprint,
                entry,
                blobs,
            } => client
                .cas_write_batch(blobs)
                .and_then(|()| client.target_put(&fingerprint, &entry)),
            Push::Action {
                fingerprint,
                entry,
                blobs,
            } => client
                .cas_write_batch(blobs)
                .and_then(|()| client.action_put(&fingerprint, &entry)),
        };
        match outcome {
            Ok(()) => trace!("pushed entry to remote"),
            Err(err) => debug!(?err, "remote push failed, dropping"),
        }
    }
}
