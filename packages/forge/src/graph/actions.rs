//! The action-level DAG.
//!
//! Lowering produces one [`ActionNode`] per action, with edges inherited
//! from the target DAG (cross-target) and from intra-target structure
//! (compiles feed the terminal link/package/test action). The scheduler
//! consumes this graph exclusively; target nodes are updated when their
//! terminal action completes.
//!
//! Action fingerprints are late-bound: an action that consumes dependency
//! outputs cannot know its full input set until those dependencies have
//! committed results, so the resolved fingerprint is attached when the
//! executor picks the action up, not at lowering time.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
};

use derive_more::Display;
use tracing::debug;

use crate::{
    action::{Action, ActionType},
    error::GraphError,
    graph::{NodeId, NodeStatus},
    hash::{Digest, Fingerprint},
};

/// Index of an action node within its graph.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("a{_0}")]
pub struct ActionNodeId(pub(crate) u32);

impl ActionNodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// An action wrapped with runtime state.
#[derive(Debug)]
pub struct ActionNode {
    pub id: ActionNodeId,
    pub action: Action,
    /// The target node this action belongs to.
    pub target: NodeId,
    /// Whether this action produces the target's final output; completing
    /// it completes the target.
    pub terminal: bool,

    pub deps: Vec<ActionNodeId>,
    pub dependents: Vec<ActionNodeId>,

    /// Remaining longest path to any root of the action DAG.
    pub critical_path: u64,

    status: AtomicU8,
    pending_deps: AtomicU32,
    attempts: AtomicU32,

    fingerprint: Mutex<Option<Fingerprint>>,
    outputs: Mutex<Vec<(String, Digest)>>,
    error: Mutex<Option<String>>,
}

impl ActionNode {
    fn new(id: ActionNodeId, action: Action, target: NodeId, terminal: bool) -> Self {
        Self {
            id,
            action,
            target,
            terminal,
            deps: Vec::new(),
            dependents: Vec::new(),
            critical_path: 0,
            status: AtomicU8::new(NodeStatus::Pending.encode()),
            pending_deps: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            fingerprint: Mutex::new(None),
            outputs: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::decode(self.status.load(Ordering::Acquire))
    }

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

    pub(crate) fn set_status(&self, status: NodeStatus) {
        self.status.store(status.encode(), Ordering::Release);
    }

    fn dep_satisfied(&self) -> u32 {
        self.pending_deps.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn pending_deps(&self) -> u32 {
        self.pending_deps.load(Ordering::Acquire)
    }

    /// Record the start of one execution attempt, returning its 1-based
    /// number.
    pub fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// The resolved fingerprint, if the action has been picked up.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint.lock().expect("fingerprint lock").clone()
    }

    /// Attach the resolved fingerprint (identity inputs plus dependency
    /// output digests).
    pub fn set_fingerprint(&self, fingerprint: Fingerprint) {
        *self.fingerprint.lock().expect("fingerprint lock") = Some(fingerprint);
    }

    /// Output files recorded by execution or cache restore.
    pub fn outputs(&self) -> Vec<(String, Digest)> {
        self.outputs.lock().expect("outputs lock").clone()
    }

    pub fn set_outputs(&self, outputs: Vec<(String, Digest)>) {
        *self.outputs.lock().expect("outputs lock") = outputs;
    }

    /// Digests of every recorded output.
    pub fn output_digests(&self) -> Vec<Digest> {
        self.outputs().into_iter().map(|(_, digest)| digest).collect()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("error lock").clone()
    }

    pub fn set_error(&self, error: impl Into<String>) {
        *self.error.lock().expect("error lock") = Some(error.into());
    }
}

/// The schedulable action DAG.
pub struct ActionGraph {
    nodes: Vec<ActionNode>,
    by_target: HashMap<NodeId, Vec<ActionNodeId>>,
    terminals: HashMap<NodeId, ActionNodeId>,
}

impl ActionGraph {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_target: HashMap::new(),
            terminals: HashMap::new(),
        }
    }

    /// Add an action for a target. At most one action per target may be
    /// terminal.
    pub(crate) fn add_action(
        &mut self,
        action: Action,
        target: NodeId,
        terminal: bool,
    ) -> ActionNodeId {
        let id = ActionNodeId(self.nodes.len() as u32);
        self.nodes.push(ActionNode::new(id, action, target, terminal));
        self.by_target.entry(target).or_default().push(id);
        if terminal {
            let previous = self.terminals.insert(target, id);
            debug_assert!(previous.is_none(), "two terminal actions for one target");
        }
        id
    }

    /// Add an edge: `dependent` needs `dep`.
    pub(crate) fn add_edge(
        &mut self,
        dep: ActionNodeId,
        dependent: ActionNodeId,
    ) -> Result<(), GraphError> {
        if dep == dependent {
            return Err(GraphError::SelfEdge {
                label: self.nodes[dep.index()].action.id().to_string(),
            });
        }
        if self.nodes[dependent.index()].deps.contains(&dep) {
            return Err(GraphError::DuplicateEdge {
                from: self.nodes[dependent.index()].action.id().to_string(),
                to: self.nodes[dep.index()].action.id().to_string(),
            });
        }
        self.nodes[dependent.index()].deps.push(dep);
        self.nodes[dep.index()].dependents.push(dependent);
        Ok(())
    }

    /// Finalize the graph: initialize readiness counters and critical-path
    /// tags. Lowering only ever adds forward edges, but the topological
    /// sweep doubles as a structural sanity check.
    pub(crate) fn seal(&mut self) -> Result<(), GraphError> {
        // Kahn's algorithm for a topological order.
        let mut in_degree = self.nodes.iter().map(|node| node.deps.len()).collect::<Vec<_>>();
        let mut queue = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        let mut topo = Vec::with_capacity(self.nodes.len());

        while let Some(idx) = queue.pop() {
            topo.push(idx);
            for dependent in self.nodes[idx].dependents.clone() {
                in_degree[dependent.index()] -= 1;
                if in_degree[dependent.index()] == 0 {
                    queue.push(dependent.index());
                }
            }
        }
        if topo.len() != self.nodes.len() {
            // The target graph was validated, so this can only be an
            // engine bug in lowering.
            return Err(GraphError::Cycle {
                path: vec!["<action graph>".to_string()],
            });
        }

        for &idx in topo.iter().rev() {
            let cost = match self.nodes[idx].action.kind {
                ActionType::Test => 2,
                _ => 1,
            };
            let longest = self.nodes[idx]
                .dependents
                .iter()
                .map(|dependent| self.nodes[dependent.index()].critical_path)
                .max()
                .unwrap_or(0);
            self.nodes[idx].critical_path = longest + cost;
        }

        for node in &self.nodes {
            node.pending_deps
                .store(node.deps.len() as u32, Ordering::Release);
            if node.deps.is_empty() {
                node.try_transition(NodeStatus::Pending, NodeStatus::Ready);
            }
        }

        debug!(actions = self.nodes.len(), "action graph sealed");
        Ok(())
    }

    pub fn node(&self, id: ActionNodeId) -> &ActionNode {
        &self.nodes[id.index()]
    }

    pub fn nodes(&self) -> &[ActionNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The actions of one target.
    pub fn actions_of(&self, target: NodeId) -> &[ActionNodeId] {
        self.by_target
            .get(&target)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The terminal action of a target, if it was lowered.
    pub fn terminal_of(&self, target: NodeId) -> Option<ActionNodeId> {
        self.terminals.get(&target).copied()
    }

    /// Actions currently in `Ready` state.
    pub fn ready_actions(&self) -> Vec<ActionNodeId> {
        self.nodes
            .iter()
            .filter(|node| node.status() == NodeStatus::Ready)
            .map(|node| node.id)
            .collect()
    }

    /// Record success (or cache restore) of an action, returning the
    /// dependents that became ready.
    pub fn complete(
        &self,
        id: ActionNodeId,
        status: NodeStatus,
        outputs: Vec<(String, Digest)>,
    ) -> Vec<ActionNodeId> {
        debug_assert!(status.satisfies_dependents());
        let node = self.node(id);
        node.set_outputs(outputs);
        node.set_status(status);

        let mut newly_ready = Vec::new();
        for &dependent in &node.dependents {
            if self.node(dependent).dep_satisfied() == 0
                && self
                    .node(dependent)
                    .try_transition(NodeStatus::Pending, NodeStatus::Ready)
            {
                newly_ready.push(dependent);
            }
        }
        newly_ready
    }

    /// Record terminal failure of an action, skipping transitive
    /// dependents. Returns the skipped actions.
    pub fn fail(&self, id: ActionNodeId, error: impl Into<String>) -> Vec<ActionNodeId> {
        let node = self.node(id);
        node.set_error(error);
        node.set_status(NodeStatus::Failed);

        let mut skipped = Vec::new();
        let mut stack = node.dependents.clone();
        while let Some(next) = stack.pop() {
            let node = self.node(next);
            if node.try_transition(NodeStatus::Pending, NodeStatus::Skipped) {
                skipped.push(next);
                stack.extend(node.dependents.iter().copied());
            }
        }
        skipped
    }

    /// Whether every action reached a terminal status.
    pub fn finished(&self) -> bool {
        self.nodes.iter().all(|node| node.status().terminal())
    }
}
