//! The target and action graph engine.
//!
//! [`BuildGraph`] owns the declared targets as a slab of nodes with
//! immutable edge lists and atomic runtime state. Construction resolves
//! labels, rejects structural errors (duplicates, self edges, unresolved
//! dependencies), and runs cycle detection before anything is allowed to
//! dispatch. Lowering ([`lower`]) turns target nodes into the finer-grained
//! [`ActionGraph`] the scheduler executes.

mod actions;
mod checkpoint;
mod lower;
mod node;

pub use actions::{ActionGraph, ActionNode, ActionNodeId};
pub use checkpoint::{restore, snapshot};
pub use lower::lower;
pub use node::{NodeId, NodeStatus, TargetNode};

use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::{error::GraphError, label::Label, target::Target};

/// Per-status node counts, for summaries and tests.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub cached: usize,
    pub skipped: usize,
}

/// The declared target DAG.
#[derive(Debug)]
pub struct BuildGraph {
    nodes: Vec<TargetNode>,
    index: HashMap<Label, NodeId>,
    /// Topological order (dependencies before dependents), fixed at build.
    topo: Vec<NodeId>,
}

impl BuildGraph {
    /// Build and validate the graph from declared targets.
    ///
    /// Fails on the first structural error; on a cycle the error carries
    /// the full cycle path. No node is dispatchable until this returns
    /// successfully.
    #[instrument(name = "BuildGraph::build", skip_all, fields(targets = targets.len()))]
    pub fn build(targets: Vec<Target>) -> Result<Self, GraphError> {
        let mut nodes = Vec::with_capacity(targets.len());
        let mut index = HashMap::with_capacity(targets.len());

        for target in targets {
            let id = NodeId(nodes.len() as u32);
            if index.insert(target.label.clone(), id).is_some() {
                return Err(GraphError::DuplicateTarget {
                    label: target.label.to_string(),
                });
            }
            nodes.push(TargetNode::new(id, target));
        }

        // Resolve dependency labels into edges.
        for id in 0..nodes.len() {
            let label = nodes[id].target.label.clone();
            let deps = nodes[id].target.deps.clone();
            for dep in deps {
                let dep_id = *index.get(&dep).ok_or_else(|| {
                    GraphError::UnresolvedDependency {
                        from: label.to_string(),
                        to: dep.to_string(),
                    }
                })?;
                if dep_id.index() == id {
                    return Err(GraphError::SelfEdge {
                        label: label.to_string(),
                    });
                }
                if nodes[id].deps.contains(&dep_id) {
                    return Err(GraphError::DuplicateEdge {
                        from: label.to_string(),
                        to: dep.to_string(),
                    });
                }
                nodes[id].deps.push(dep_id);
                nodes[dep_id.index()].dependents.push(NodeId(id as u32));
            }
        }

        let mut graph = Self {
            nodes,
            index,
            topo: Vec::new(),
        };
        graph.topo = graph.detect_cycles()?;
        graph.tag_critical_paths();

        for node in &graph.nodes {
            node.init_pending_deps(node.deps.len() as u32);
            if node.deps.is_empty() {
                node.try_transition(NodeStatus::Pending, NodeStatus::Ready);
            }
        }

        debug!(
            nodes = graph.nodes.len(),
            roots = graph.roots().len(),
            leaves = graph.leaves().len(),
            "graph built"
        );
        Ok(graph)
    }

    /// Depth-first cycle detection, returning a topological order on
    /// success.
    ///
    /// Iterative three-color DFS. On finding a back edge the gray stack
    /// holds the active path, from which the cycle is reconstructed so the
    /// error names it completely.
    fn detect_cycles(&self) -> Result<Vec<NodeId>, GraphError> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color = vec![WHITE; self.nodes.len()];
        let mut topo = Vec::with_capacity(self.nodes.len());

        for start in 0..self.nodes.len() {
            if color[start] != WHITE {
                continue;
            }

            // (node, next dep index to visit)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = GRAY;

            while let Some(&mut (node, ref mut next)) = stack.last_mut() {
                if *next < self.nodes[node].deps.len() {
                    let dep = self.nodes[node].deps[*next].index();
                    *next += 1;
                    match color[dep] {
                        WHITE => {
                            color[dep] = GRAY;
                            stack.push((dep, 0));
                        }
                        GRAY => {
                            // Back edge: the cycle is the active path from
                            // `dep` down to `node`, closed back on `dep`.
                            let mut path: Vec<String> = stack
                                .iter()
                                .map(|&(id, _)| self.nodes[id].target.label.to_string())
                                .skip_while(|label| {
                                    *label != self.nodes[dep].target.label.to_string()
                                })
                                .collect();
                            path.push(self.nodes[dep].target.label.to_string());
                            return Err(GraphError::Cycle { path });
                        }
                        _ => {}
                    }
                } else {
                    color[node] = BLACK;
                    topo.push(NodeId(node as u32));
                    stack.pop();
                }
            }
        }

        // Post-order visits dependencies first, which is exactly the
        // topological order we need.
        Ok(topo)
    }

    /// Tag every node with an upper bound of its remaining longest path to
    /// a root. Purely a scheduling hint.
    fn tag_critical_paths(&mut self) {
        // Dependents come after their dependencies in topo order, so
        // walking it in reverse sees every dependent before its
        // dependencies.
        let topo = self.topo.clone();
        for &id in topo.iter().rev() {
            let cost = self.nodes[id.index()].cost_estimate();
            let longest_dependent = self.nodes[id.index()]
                .dependents
                .iter()
                .map(|dependent| self.nodes[dependent.index()].critical_path)
                .max()
                .unwrap_or(0);
            self.nodes[id.index()].critical_path = longest_dependent + cost;
        }
    }

    /// Look up a node by label.
    pub fn lookup(&self, label: &Label) -> Option<NodeId> {
        self.index.get(label).copied()
    }

    /// Access a node.
    pub fn node(&self, id: NodeId) -> &TargetNode {
        &self.nodes[id.index()]
    }

    /// All nodes.
    pub fn nodes(&self) -> &[TargetNode] {
        &self.nodes
    }

    /// Nodes in topological order (dependencies first).
    pub fn topo_order(&self) -> &[NodeId] {
        &self.topo
    }

    /// Nodes with no dependents.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.dependents.is_empty())
            .map(|node| node.id)
            .collect()
    }

    /// Nodes with no dependencies.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.deps.is_empty())
            .map(|node| node.id)
            .collect()
    }

    /// Record a node's success (or cache hit), returning dependents that
    /// became ready.
    ///
    /// This is the only place pending-dependency counters are decremented,
    /// which together with the status CAS gives the happens-before edge the
    /// concurrency contract requires: a dependent observes `Ready` only
    /// after the dependency's results were committed.
    pub fn complete(&self, id: NodeId, status: NodeStatus) -> Vec<NodeId> {
        debug_assert!(status.satisfies_dependents());
        self.node(id).set_status(status);

        let mut newly_ready = Vec::new();
        for &dependent in &self.node(id).dependents {
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

    /// Record a node's terminal failure, marking the transitive dependents
    /// skipped. Returns the skipped nodes.
    pub fn fail(&self, id: NodeId, error: impl Into<String>) -> Vec<NodeId> {
        let node = self.node(id);
        node.set_error(error);
        node.set_status(NodeStatus::Failed);

        let mut skipped = Vec::new();
        let mut stack: Vec<NodeId> = node.dependents.clone();
        while let Some(next) = stack.pop() {
            let node = self.node(next);
            if node.try_transition(NodeStatus::Pending, NodeStatus::Skipped) {
                skipped.push(next);
                stack.extend(node.dependents.iter().copied());
            }
        }
        skipped
    }

    /// Mark every non-terminal node cancelled.
    pub fn cancel_remaining(&self) -> usize {
        let mut cancelled = 0;
        for node in &self.nodes {
            let status = node.status();
            if !status.terminal() && status != NodeStatus::Running {
                node.set_status(NodeStatus::Cancelled);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Count nodes by status.
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for node in &self.nodes {
            match node.status() {
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::Ready => counts.ready += 1,
                NodeStatus::Running => counts.running += 1,
                NodeStatus::Succeeded => counts.succeeded += 1,
                NodeStatus::Failed => counts.failed += 1,
                NodeStatus::Cancelled => counts.cancelled += 1,
                NodeStatus::Cached => counts.cached += 1,
                NodeStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

impl TargetNode {
    /// Rough duration weight for critical-path tagging.
    fn cost_estimate(&self) -> u64 {
        match self.target.target_type {
            // Tests tend to dominate wall-clock.
            crate::target::TargetType::Test => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Language, TargetType};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn target(label: &str, deps: &[&str]) -> Target {
        Target::builder()
            .label(Label::must(label))
            .target_type(TargetType::Library)
            .language(Language::C)
            .deps(deps.iter().map(|dep| Label::must(dep)).collect::<Vec<_>>())
            .build()
    }

    #[test]
    fn builds_simple_chain() {
        let graph =
            BuildGraph::build(vec![target("//a:a", &[]), target("//b:b", &["//a:a"])]).unwrap();

        let a = graph.lookup(&Label::must("//a:a")).unwrap();
        let b = graph.lookup(&Label::must("//b:b")).unwrap();

        pretty_assert_eq!(graph.node(a).status(), NodeStatus::Ready);
        pretty_assert_eq!(graph.node(b).status(), NodeStatus::Pending);
        pretty_assert_eq!(graph.node(b).pending_deps(), 1);
        pretty_assert_eq!(graph.roots(), vec![b]);
        pretty_assert_eq!(graph.leaves(), vec![a]);
    }

    #[test]
    fn rejects_duplicate_targets() {
        let err = BuildGraph::build(vec![target("//a:a", &[]), target("//a:a", &[])]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTarget { .. }));
    }

    #[test]
    fn rejects_unresolved_dependency() {
        let err = BuildGraph::build(vec![target("//a:a", &["//ghost:x"])]).unwrap_err();
        assert!(matches!(err, GraphError::UnresolvedDependency { .. }));
    }

    #[test]
    fn rejects_self_edge() {
        let err = BuildGraph::build(vec![target("//a:a", &["//a:a"])]).unwrap_err();
        assert!(matches!(err, GraphError::SelfEdge { .. }));
    }

    #[test]
    fn rejects_duplicate_edge() {
        let err = BuildGraph::build(vec![
            target("//a:a", &[]),
            target("//b:b", &["//a:a", "//a:a"]),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateEdge { .. }));
    }

    #[test]
    fn detects_two_cycle_with_path() {
        let err = BuildGraph::build(vec![
            target("//x:x", &["//y:y"]),
            target("//y:y", &["//x:x"]),
        ])
        .unwrap_err();

        match err {
            GraphError::Cycle { path } => {
                pretty_assert_eq!(path.len(), 3);
                pretty_assert_eq!(path.first(), path.last());
                assert!(path.contains(&"//x:x".to_string()));
                assert!(path.contains(&"//y:y".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn detects_long_cycle() {
        let err = BuildGraph::build(vec![
            target("//a:a", &["//b:b"]),
            target("//b:b", &["//c:c"]),
            target("//c:c", &["//a:a"]),
            target("//free:free", &[]),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::Cycle { path } if path.len() == 4));
    }

    #[test]
    fn diamond_readiness() {
        let graph = BuildGraph::build(vec![
            target("//base:base", &[]),
            target("//left:left", &["//base:base"]),
            target("//right:right", &["//base:base"]),
            target("//top:top", &["//left:left", "//right:right"]),
        ])
        .unwrap();

        let base = graph.lookup(&Label::must("//base:base")).unwrap();
        let left = graph.lookup(&Label::must("//left:left")).unwrap();
        let right = graph.lookup(&Label::must("//right:right")).unwrap();
        let top = graph.lookup(&Label::must("//top:top")).unwrap();

        let ready = graph.complete(base, NodeStatus::Succeeded);
        pretty_assert_eq!(ready.len(), 2);
        assert!(ready.contains(&left) && ready.contains(&right));

        // Top needs both.
        pretty_assert_eq!(graph.complete(left, NodeStatus::Succeeded), vec![]);
        pretty_assert_eq!(graph.complete(right, NodeStatus::Cached), vec![top]);
        pretty_assert_eq!(graph.node(top).status(), NodeStatus::Ready);
    }

    #[test]
    fn failure_skips_transitive_dependents() {
        let graph = BuildGraph::build(vec![
            target("//a:a", &[]),
            target("//b:b", &["//a:a"]),
            target("//c:c", &["//b:b"]),
            target("//other:other", &[]),
        ])
        .unwrap();

        let a = graph.lookup(&Label::must("//a:a")).unwrap();
        let skipped = graph.fail(a, "compiler exploded");
        pretty_assert_eq!(skipped.len(), 2);

        let counts = graph.counts();
        pretty_assert_eq!(counts.failed, 1);
        pretty_assert_eq!(counts.skipped, 2);
        // //other:other is unaffected.
        pretty_assert_eq!(counts.ready, 1);
        pretty_assert_eq!(
            graph.node(a).error(),
            Some("compiler exploded".to_string())
        );
    }

    #[test]
    fn critical_path_prefers_long_chains() {
        let graph = BuildGraph::build(vec![
            target("//chain/one:one", &[]),
            target("//chain/two:two", &["//chain/one:one"]),
            target("//chain/three:three", &["//chain/two:two"]),
            target("//lone:lone", &[]),
        ])
        .unwrap();

        let one = graph.lookup(&Label::must("//chain/one:one")).unwrap();
        let lone = graph.lookup(&Label::must("//lone:lone")).unwrap();
        assert!(graph.node(one).critical_path > graph.node(lone).critical_path);
    }

    #[test]
    fn topo_order_puts_dependencies_first() {
        let graph = BuildGraph::build(vec![
            target("//app:app", &["//lib:lib"]),
            target("//lib:lib", &["//base:base"]),
            target("//base:base", &[]),
        ])
        .unwrap();

        let position = |label: &str| {
            let id = graph.lookup(&Label::must(label)).unwrap();
            graph.topo_order().iter().position(|&n| n == id).unwrap()
        };
        assert!(position("//base:base") < position("//lib:lib"));
        assert!(position("//lib:lib") < position("//app:app"));
    }
}
