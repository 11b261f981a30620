//! Actions: the minimum cacheable unit of work.
//!
//! Targets are lowered into actions by the graph engine; the scheduler and
//! executor only ever see actions. An action is identified by its target
//! label, its type, a sub-id distinguishing siblings (for example the source
//! path of a per-file compile), and the digest of its inputs.

use std::{collections::BTreeMap, time::Duration};

use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};

use crate::{
    hash::{Digest, Fingerprint, hash_digests},
    label::Label,
};

/// The kind of work an action performs.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, StrumDisplay, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Compile,
    Link,
    Codegen,
    Test,
    Package,
    Transform,
    Custom,
}

/// Scheduling priority class.
///
/// Ordered so that `Critical > High > Normal > Low`; the scheduler drains
/// higher classes first and stealers prefer equal-or-higher classes.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, StrumDisplay, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All classes, highest first.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Dense index for per-class storage; 0 is the highest class.
    pub fn index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Resource limits applied to an action's sandbox.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize, Builder)]
pub struct ResourceLimits {
    /// CPU time limit, in seconds.
    pub cpu_secs: Option<u64>,
    /// Address space limit, in bytes.
    pub memory_bytes: Option<u64>,
    /// Largest file the action may create, in bytes.
    pub file_size_bytes: Option<u64>,
}

/// Identity of an action.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{label}#{kind}:{sub}")]
pub struct ActionId {
    /// The target this action belongs to.
    pub label: Label,
    /// What the action does.
    pub kind: ActionType,
    /// Distinguishes sibling actions of the same kind within one target,
    /// e.g. the source path for per-file compiles. Empty when a target has
    /// only one action of this kind.
    pub sub: String,
    /// Digest over the action's input digests.
    pub inputs: Digest,
}

/// A schedulable, cacheable unit of work.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
#[builder(on(String, into))]
#[non_exhaustive]
pub struct Action {
    /// The target this action belongs to.
    pub label: Label,

    /// What the action does.
    pub kind: ActionType,

    /// Sibling discriminator; see [`ActionId::sub`].
    #[builder(default)]
    pub sub: String,

    /// The command vector, argv-style. Order is significant and fingerprinted.
    pub command: Vec<String>,

    /// Environment visible inside the sandbox.
    #[builder(default)]
    pub env: BTreeMap<String, String>,

    /// Content digests of every declared input, in canonical (sorted path)
    /// order.
    #[builder(default)]
    pub inputs: Vec<Digest>,

    /// Workspace-relative source files materialized into the sandbox
    /// before execution.
    #[builder(default)]
    pub sources: Vec<String>,

    /// Declared output paths, relative to the sandbox root. Only these are
    /// collected after execution.
    #[builder(default)]
    pub outputs: Vec<String>,

    /// Per-action retry override: total attempts become `max_retries + 1`
    /// regardless of failure category. `None` defers to the category
    /// policy (and the flakiness budget for tests).
    pub max_retries: Option<u32>,

    /// Sandbox resource limits.
    #[builder(default)]
    pub limits: ResourceLimits,

    /// Wall-clock timeout for one execution attempt.
    #[builder(default = Duration::from_secs(15 * 60))]
    pub timeout: Duration,

    /// Scheduling priority class.
    #[builder(default)]
    pub priority: Priority,
}

impl Action {
    /// The identity of this action.
    pub fn id(&self) -> ActionId {
        ActionId {
            label: self.label.clone(),
            kind: self.kind,
            sub: self.sub.clone(),
            inputs: hash_digests(&self.inputs),
        }
    }

    /// Compute this action's fingerprint.
    ///
    /// Covers kind, sub-id, command, environment, input digests, and the
    /// shape of the declared outputs. Wall-clock, process ids, and
    /// absolute paths outside the sandbox root are never mixed in, so two
    /// machines with identical inputs agree on the fingerprint.
    ///
    /// The target label is identity, not content: it is deliberately
    /// excluded, and command arguments equal to a declared output path are
    /// hashed as positional placeholders. Renaming a target (which renames
    /// its conventional output paths) therefore leaves the fingerprint
    /// unchanged, and none of its actions re-run.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        fields.push(self.kind.to_string().into_bytes());
        fields.push(self.sub.clone().into_bytes());
        for arg in &self.command {
            match self.outputs.iter().position(|output| output == arg) {
                Some(index) => fields.push(format!("<out:{index}>").into_bytes()),
                None => fields.push(arg.clone().into_bytes()),
            }
        }
        for (key, value) in &self.env {
            fields.push(format!("{key}={value}").into_bytes());
        }
        for input in &self.inputs {
            fields.push(input.as_bytes().to_vec());
        }
        for source in &self.sources {
            fields.push(source.clone().into_bytes());
        }
        fields.push(self.outputs.len().to_le_bytes().to_vec());
        Fingerprint::from_fields(fields)
    }
}
