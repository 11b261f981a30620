//! Graph checkpointing.
//!
//! The snapshot captures the declared targets plus each node's runtime
//! state (status, retries, output digest, last error, fingerprint) in a
//! version-gated binary frame. Restore rebuilds the graph through the
//! normal constructor (re-running validation) and then replays the
//! recorded state on top. `Running` nodes are demoted to `Pending`: their
//! sandboxes died with the previous process, so the work must be redone.

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument};

use crate::{
    codec,
    graph::{BuildGraph, NodeStatus},
    hash::{Digest, Fingerprint},
};

const MAGIC: [u8; 4] = *b"FGPH";
const VERSION: u8 = 1;

/// Serialize the graph, including runtime state.
///
/// Output is deterministic for a given graph state: nodes are written in
/// label order regardless of declaration order.
#[instrument(name = "graph::snapshot", skip_all)]
pub fn snapshot(graph: &BuildGraph) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    codec::put_header(&mut buf, MAGIC, VERSION);

    let mut nodes = graph.nodes().iter().collect::<Vec<_>>();
    nodes.sort_by(|a, b| a.target.label.cmp(&b.target.label));

    codec::put_varint(&mut buf, nodes.len() as u64);
    for node in nodes {
        let target = serde_json::to_vec(&node.target).context("serialize target")?;
        codec::put_bytes(&mut buf, &target);

        buf.push(node.status().encode());
        codec::put_varint(&mut buf, u64::from(node.retries()));

        match node.output() {
            Some(digest) => {
                buf.push(1);
                codec::put_bytes(&mut buf, digest.as_bytes());
            }
            None => buf.push(0),
        }
        match node.fingerprint() {
            Some(fingerprint) => {
                buf.push(1);
                codec::put_bytes(&mut buf, fingerprint.as_bytes());
            }
            None => buf.push(0),
        }
        codec::put_str(&mut buf, node.error().unwrap_or_default());
    }

    debug!(bytes = buf.len(), "graph snapshot");
    Ok(buf)
}

/// Rebuild a graph from a snapshot.
#[instrument(name = "graph::restore", skip_all)]
pub fn restore(buf: &[u8]) -> Result<BuildGraph> {
    let mut reader = codec::check_header(buf, MAGIC, VERSION)?;
    let count = reader.varint().context("read node count")?;

    struct Recorded {
        status: NodeStatus,
        retries: u32,
        output: Option<Digest>,
        fingerprint: Option<Fingerprint>,
        error: Option<String>,
    }

    let mut targets = Vec::with_capacity(count as usize);
    let mut recorded = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let target = serde_json::from_slice(reader.bytes().context("read target")?)
            .context("deserialize target")?;
        targets.push(target);

        let status = NodeStatus::decode(reader.u8().context("read status")?);
        let retries = reader.varint().context("read retries")? as u32;
        let output = match reader.u8().context("read output flag")? {
            0 => None,
            _ => Some(Digest::from_bytes(reader.bytes().context("read output")?)?),
        };
        let fingerprint = match reader.u8().context("read fingerprint flag")? {
            0 => None,
            _ => Some(Fingerprint::from(Digest::from_bytes(
                reader.bytes().context("read fingerprint")?,
            )?)),
        };
        let error = match reader.str().context("read error")? {
            "" => None,
            err => Some(err.to_string()),
        };
        recorded.push(Recorded {
            status,
            retries,
            output,
            fingerprint,
            error,
        });
    }

    let graph = BuildGraph::build(targets).context("rebuild graph from snapshot")?;

    // Recorded state pairs with nodes by position: the snapshot wrote
    // targets in label order and `build` preserves input order.
    for (idx, state) in recorded.iter().enumerate() {
        let node = &graph.nodes()[idx];
        let status = match state.status {
            // In-flight work did not survive the previous process.
            NodeStatus::Running | NodeStatus::Ready => NodeStatus::Pending,
            other => other,
        };
        node.set_status(status);
        for _ in 0..state.retries {
            node.record_retry();
        }
        if let Some(digest) = &state.output {
            node.set_output(digest.clone());
        }
        if let Some(fingerprint) = &state.fingerprint {
            node.set_fingerprint(fingerprint.clone());
        }
        if let Some(error) = &state.error {
            node.set_error(error.clone());
        }
    }

    // Recompute readiness from the restored terminal statuses.
    for node in graph.nodes() {
        let unsatisfied = node
            .deps
            .iter()
            .filter(|&&dep| !graph.node(dep).status().satisfies_dependents())
            .count() as u32;
        node.init_pending_deps(unsatisfied);
        if node.status() == NodeStatus::Pending && unsatisfied == 0 {
            node.try_transition(NodeStatus::Pending, NodeStatus::Ready);
        }
    }

    debug!(nodes = graph.nodes().len(), "graph restored");
    Ok(graph)
}
