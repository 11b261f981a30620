//! Wire types for remote dispatch.
//!
//! Requests and responses are plain serde values; framing and transport
//! belong to the embedder. Everything content-shaped is a digest: the
//! worker materializes inputs from the shared CAS and uploads outputs the
//! same way.

use std::collections::{BTreeMap, BTreeSet};

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::{
    action::{ActionType, Priority},
    hash::Digest,
    label::Label,
};

/// A request to execute one action remotely.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
#[builder(on(String, into))]
#[non_exhaustive]
pub struct DispatchRequest {
    /// Owning target label.
    pub label: Label,
    /// What the action does.
    pub kind: ActionType,
    /// Sibling discriminator within the target.
    #[builder(default)]
    pub sub: String,
    /// The command vector, argv-style.
    pub command: Vec<String>,
    /// Environment visible inside the worker's sandbox.
    #[builder(default)]
    pub env: BTreeMap<String, String>,
    /// Digests of every input; the worker fetches them from the CAS.
    #[builder(default)]
    pub inputs: Vec<Digest>,
    /// Declared output paths, relative to the worker's sandbox root.
    #[builder(default)]
    pub outputs: Vec<String>,
    /// Capabilities the executing worker must advertise.
    #[builder(default)]
    pub capabilities: BTreeSet<String>,
    #[builder(default)]
    pub priority: Priority,
    /// Wall-clock timeout in milliseconds.
    pub timeout_ms: u64,
}

/// Terminal status of a remote execution.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Succeeded,
    Failed,
    Timeout,
    Cancelled,
}

/// Resources consumed by a remote execution.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_ms: u64,
    pub max_rss_bytes: u64,
}

/// The result of a remote execution.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct DispatchResponse {
    pub status: RemoteStatus,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[builder(default)]
    pub usage: ResourceUsage,
    /// Digests of produced outputs, aligned with the request's declared
    /// output paths.
    #[builder(default)]
    pub output_digests: Vec<Digest>,
    pub stdout: Digest,
    pub stderr: Digest,
}
