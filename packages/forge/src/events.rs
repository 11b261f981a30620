//! Typed build and cache events.
//!
//! The cache coordinator, scheduler, and executor publish events through an
//! [`EventSink`]. Sinks must never block the hot path: the provided channel
//! sink drops events when its buffer is full, and the null sink swallows
//! everything (used in tests and when no observer is attached).

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use tracing::trace;

/// Something observable that happened during a run.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Event {
    /// A target fingerprint was satisfied by a cache tier.
    CacheHit { tier: Tier },
    /// A target fingerprint missed every tier.
    CacheMiss,
    /// A target entry was recorded.
    CacheUpdate,
    /// Entries were evicted from a local tier.
    CacheEviction { count: usize },
    /// An entry or blob was pushed to the remote tier.
    RemotePush,
    /// An entry or blob was pulled from the remote tier.
    RemotePull,
    /// Garbage collection started.
    GcStart,
    /// Garbage collection finished.
    GcComplete { swept: usize, bytes: u64 },
    /// An action fingerprint was satisfied by a cache tier.
    ActionHit { tier: Tier },
    /// An action fingerprint missed every tier.
    ActionMiss,
    /// An action was dispatched for execution.
    ActionStart,
    /// An action finished executing.
    ActionComplete { ok: bool, duration_ms: u64 },
}

impl Event {
    /// The stable name of this event kind.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// Which cache tier satisfied a lookup.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    Remote,
}

/// An [`Event`] stamped with a monotonic timestamp and correlation id.
///
/// The timestamp is the offset from the bus epoch, so subscribers can order
/// events without trusting the wall clock. The correlation id is the target
/// label or action id the event concerns.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct StampedEvent {
    pub at: Duration,
    pub correlation: String,
    pub event: Event,
}

/// Destination for published events.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Implementations must not block; dropping the event
    /// is preferred over stalling the caller.
    fn emit(&self, event: StampedEvent);
}

/// A sink that discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _: StampedEvent) {}
}

/// A sink backed by a bounded channel.
///
/// When the buffer is full the event is dropped and counted, never blocking
/// the publisher.
pub struct ChannelSink {
    tx: flume::Sender<StampedEvent>,
}

impl ChannelSink {
    /// Create a sink and its receiving half with the provided buffer size.
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<StampedEvent>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: StampedEvent) {
        if let Err(flume::TrySendError::Full(event)) = self.tx.try_send(event) {
            trace!(kind = event.event.kind(), "dropped event: sink full");
        }
    }
}

/// Shared publisher handle.
///
/// Cheap to clone; all clones share one epoch so timestamps from different
/// components are comparable.
#[derive(Clone)]
pub struct EventBus {
    sink: Arc<dyn EventSink>,
    epoch: Instant,
}

impl EventBus {
    /// Create a bus publishing into the provided sink.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            epoch: Instant::now(),
        }
    }

    /// Create a bus that discards all events.
    pub fn null() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Publish one event correlated with a target label or action id.
    pub fn emit(&self, correlation: impl Into<String>, event: Event) {
        self.sink.emit(StampedEvent {
            at: self.epoch.elapsed(),
            correlation: correlation.into(),
            event,
        });
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}
