//! Graph node state.
//!
//! Node status lives in an atomic so workers can observe and advance it
//! without locking; edge lists are immutable once the graph is built. All
//! transitions go through [`try_transition`][TargetNode::try_transition]
//! style compare-and-swap so an illegal transition is a visible failure,
//! not a silent overwrite.

use std::sync::{
    Mutex,
    atomic::{AtomicU8, AtomicU32, Ordering},
};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    hash::{Digest, Fingerprint},
    target::Target,
};

/// Index of a target node within its graph.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("n{_0}")]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle state of a node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting on dependencies.
    #[display("pending")]
    Pending,
    /// All dependencies satisfied; eligible for dispatch.
    #[display("ready")]
    Ready,
    /// Claimed by a worker.
    #[display("running")]
    Running,
    /// Work completed successfully.
    #[display("succeeded")]
    Succeeded,
    /// Work failed terminally (retries exhausted or not retryable).
    #[display("failed")]
    Failed,
    /// The run was aborted before or during this node's work.
    #[display("cancelled")]
    Cancelled,
    /// Satisfied from cache without executing. Counts as success for
    /// readiness purposes.
    #[display("skipped (cached)")]
    Cached,
    /// Skipped because an upstream dependency failed.
    #[display("skipped")]
    Skipped,
}

impl NodeStatus {
    /// Whether this status satisfies dependents.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Cached)
    }

    /// Whether this status is terminal.
    pub fn terminal(self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Running)
    }

    pub(crate) fn encode(self) -> u8 {
        match self {
            NodeStatus::Pending => 0,
            NodeStatus::Ready => 1,
            NodeStatus::Running => 2,
            NodeStatus::Succeeded => 3,
            NodeStatus::Failed => 4,
            NodeStatus::Cancelled => 5,
            NodeStatus::Cached => 6,
            NodeStatus::Skipped => 7,
        }
    }

    pub(crate) fn decode(code: u8) -> NodeStatus {
        match code {
            0 => NodeStatus::Pending,
            1 => NodeStatus::Ready,
            2 => NodeStatus::Running,
            3 => NodeStatus::Succeeded,
            4 => NodeStatus::Failed,
            5 => NodeStatus::Cancelled,
            6 => NodeStatus::Cached,
            _ => NodeStatus::Skipped,
        }
    }
}

/// A target wrapped with runtime state.
#[derive(Debug)]
pub struct TargetNode {
    pub id: NodeId,
    pub target: Target,

    /// Direct dependencies (edges point at what this node needs).
    pub deps: Vec<NodeId>,
    /// Direct dependents (reverse edges).
    pub dependents: Vec<NodeId>,

    /// Upper bound of the remaining longest path from this node to any
    /// root, used as a scheduling hint. Zero for roots.
    pub critical_path: u64,

    status: AtomicU8,
    pending_deps: AtomicU32,
    retries: AtomicU32,

    fingerprint: Mutex<Option<Fingerprint>>,
    output: Mutex<Option<Digest>>,
    error: Mutex<Option<String>>,
}

impl TargetNode {
    pub(crate) fn new(id: NodeId, target: Target) -> Self {
        Self {
            id,
            target,
            deps: Vec::new(),
            dependents: Vec::new(),
            critical_path: 0,
            status: AtomicU8::new(NodeStatus::Pending.encode()),
            pending_deps: AtomicU32::new(0),
            retries: AtomicU32::new(0),
            fingerprint: Mutex::new(None),
            output: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    /// Current status.
    pub fn status(&self) -> NodeStatus {
        NodeStatus::decode(self.status.load(Ordering::Acquire))
    }

    /// Transition `from -> to`, failing if another thread moved first.
    pub fn try_transition(&self, from: NodeStatus, to: NodeStatus) -> bool {
        self.status
            .compare_exchange(
                from.encode(),
                to.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Force a status. Reserved for graph-level operations (skip cascades,
    /// cancellation, checkpoint restore) that own the ordering.
    pub(crate) fn set_status(&self, status: NodeStatus) {
        self.status.store(status.encode(), Ordering::Release);
    }

    pub(crate) fn init_pending_deps(&self, count: u32) {
        self.pending_deps.store(count, Ordering::Release);
    }

    /// Decrement the pending-dependency counter, returning the new value.
    pub(crate) fn dep_satisfied(&self) -> u32 {
        self.pending_deps.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Remaining unsatisfied dependencies.
    pub fn pending_deps(&self) -> u32 {
        self.pending_deps.load(Ordering::Acquire)
    }

    /// Record one retry, returning the attempt number (1-based).
    pub fn record_retry(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Retries consumed so far.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    /// The target fingerprint, if analysis has computed it.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint.lock().expect("fingerprint lock").clone()
    }

    pub(crate) fn set_fingerprint(&self, fingerprint: Fingerprint) {
        *self.fingerprint.lock().expect("fingerprint lock") = Some(fingerprint);
    }

    /// Digest of the target's final output, once known.
    pub fn output(&self) -> Option<Digest> {
        self.output.lock().expect("output lock").clone()
    }

    pub fn set_output(&self, digest: Digest) {
        *self.output.lock().expect("output lock") = Some(digest);
    }

    /// The last error recorded against this node.
    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("error lock").clone()
    }

    pub fn set_error(&self, error: impl Into<String>) {
        *self.error.lock().expect("error lock") = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{label::Label, target::{Language, TargetType}};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn node() -> TargetNode {
        let target = Target::builder()
            .label(Label::must("//a:a"))
            .target_type(TargetType::Library)
            .language(Language::C)
            .build();
        TargetNode::new(NodeId(0), target)
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            NodeStatus::Pending,
            NodeStatus::Ready,
            NodeStatus::Running,
            NodeStatus::Succeeded,
            NodeStatus::Failed,
            NodeStatus::Cancelled,
            NodeStatus::Cached,
            NodeStatus::Skipped,
        ] {
            pretty_assert_eq!(NodeStatus::decode(status.encode()), status);
        }
    }

    #[test]
    fn transitions_are_exclusive() {
        let node = node();
        assert!(node.try_transition(NodeStatus::Pending, NodeStatus::Ready));
        // Second claim of the same transition fails.
        assert!(!node.try_transition(NodeStatus::Pending, NodeStatus::Ready));
        assert!(node.try_transition(NodeStatus::Ready, NodeStatus::Running));
        pretty_assert_eq!(node.status(), NodeStatus::Running);
    }

    #[test]
    fn cached_satisfies_dependents() {
        assert!(NodeStatus::Succeeded.satisfies_dependents());
        assert!(NodeStatus::Cached.satisfies_dependents());
        assert!(!NodeStatus::Failed.satisfies_dependents());
        assert!(!NodeStatus::Skipped.satisfies_dependents());
    }

    #[test]
    fn pending_dep_counting() {
        let node = node();
        node.init_pending_deps(2);
        pretty_assert_eq!(node.dep_satisfied(), 1);
        pretty_assert_eq!(node.dep_satisfied(), 0);
    }
}
