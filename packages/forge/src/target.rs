//! Declared build targets.
//!
//! Targets arrive from the frontend fully formed and are immutable for the
//! duration of a run; changing one means starting a new run. The engine
//! never interprets the language-specific config bag, it only mixes it into
//! fingerprints and forwards it to handlers verbatim.

use std::collections::BTreeMap;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    hash::{Digest, Fingerprint},
    label::Label,
};

/// What kind of artifact a target produces.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Executable,
    Library,
    Test,
    Custom,
}

/// The language a target's sources are written in.
///
/// This selects the import scanner and the language handler; `Custom`
/// targets skip import analysis and run their declared commands as-is.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Language {
    C,
    Cpp,
    Rust,
    Go,
    Python,
    JavaScript,
    TypeScript,
    Custom,
}

/// A named buildable unit as declared by the frontend.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
#[builder(on(String, into))]
#[non_exhaustive]
pub struct Target {
    /// Canonical label identifying this target.
    pub label: Label,

    /// What kind of artifact this target produces.
    pub target_type: TargetType,

    /// Language tag selecting the scanner and handler.
    pub language: Language,

    /// Declared source paths relative to the workspace root. May contain
    /// `*` and `**` globs, expanded at analysis time.
    #[builder(default)]
    pub sources: Vec<String>,

    /// Labels of targets this target depends on.
    #[builder(default)]
    pub deps: Vec<Label>,

    /// Environment for this target's actions. Sorted-key map so iteration
    /// order (and thus fingerprints) is deterministic.
    #[builder(default)]
    pub env: BTreeMap<String, String>,

    /// Flags passed to the language handler.
    #[builder(default)]
    pub flags: Vec<String>,

    /// Override for the primary output path, relative to the workspace root.
    pub output: Option<String>,

    /// Opaque language-specific configuration, forwarded to handlers
    /// verbatim and never interpreted by the engine.
    #[builder(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

impl Target {
    /// Compute this target's fingerprint.
    ///
    /// The fingerprint covers the label, the content digests of every source
    /// (in declared order), the fingerprints of every dependency (in
    /// declared order), flags, environment, and the handler version. Nothing
    /// positional or temporal is mixed in: renaming the workspace directory
    /// or rebuilding at a different time yields the same fingerprint.
    pub fn fingerprint<'a>(
        &self,
        source_digests: impl IntoIterator<Item = &'a Digest>,
        dep_fingerprints: impl IntoIterator<Item = &'a Fingerprint>,
        handler_version: &str,
    ) -> Fingerprint {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        fields.push(self.label.to_string().into_bytes());
        for digest in source_digests {
            fields.push(digest.as_bytes().to_vec());
        }
        for fingerprint in dep_fingerprints {
            fields.push(fingerprint.as_bytes().to_vec());
        }
        for flag in &self.flags {
            fields.push(flag.clone().into_bytes());
        }
        for (key, value) in &self.env {
            fields.push(format!("{key}={value}").into_bytes());
        }
        // The config bag is canonicalized through its sorted-map JSON form.
        fields.push(
            serde_json::to_string(&self.config)
                .unwrap_or_default()
                .into_bytes(),
        );
        fields.push(handler_version.as_bytes().to_vec());
        Fingerprint::from_fields(fields)
    }
}
