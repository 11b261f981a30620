//! Language handler interface.
//!
//! Handlers are the engine's view of per-language toolchains: external
//! collaborators that build a target, enumerate its outputs, and extract
//! imports. The engine trusts a handler's declared output set and mixes
//! its version string into target fingerprints, so bumping a toolchain
//! invalidates exactly the targets it handles.

use std::{collections::HashMap, path::Path, sync::Arc};

use bon::Builder;
use color_eyre::{Result, eyre::Context};

use crate::{
    analyzer::{Import, scan},
    hash::Digest,
    target::{Language, Target},
};

/// The result of building one target.
#[derive(Clone, Debug, Builder)]
#[non_exhaustive]
pub struct BuildResult {
    pub success: bool,
    /// Output paths relative to the workspace root.
    #[builder(default)]
    pub outputs: Vec<String>,
    /// Digest over the outputs, when the handler computed one.
    pub output_digest: Option<Digest>,
    pub error: Option<String>,
}

/// A per-language toolchain shim.
pub trait LanguageHandler: Send + Sync {
    /// Version identifier mixed into fingerprints of handled targets.
    /// Changing it invalidates their cache entries.
    fn version(&self) -> String;

    /// Build the target, returning its outputs.
    fn build(&self, target: &Target, workspace: &Path) -> Result<BuildResult>;

    /// The output paths the target would produce, without building.
    fn outputs(&self, target: &Target, workspace: &Path) -> Result<Vec<String>>;

    /// Extract imports from source text. Defaults to the built-in scanner
    /// for the language.
    fn analyze_imports(&self, language: Language, text: &str) -> Vec<Import> {
        scan(language, text)
    }
}

/// Handler registry keyed by language.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<Language, Arc<dyn LanguageHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a language, replacing any previous one.
    pub fn register(&mut self, language: Language, handler: Arc<dyn LanguageHandler>) {
        self.handlers.insert(language, handler);
    }

    /// The handler for a language, if registered.
    pub fn get(&self, language: Language) -> Option<&Arc<dyn LanguageHandler>> {
        self.handlers.get(&language)
    }

    /// The fingerprint-relevant version string for a language. Languages
    /// without a registered handler use the built-in lowering, versioned
    /// with the engine.
    pub fn version_of(&self, language: Language) -> String {
        self.get(language)
            .map(|handler| handler.version())
            .unwrap_or_else(|| "builtin/1".to_string())
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("languages", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A handler that runs a target's declared command through the shell.
///
/// Serves custom targets and tests; the command comes from the target's
/// `command` config key, the working directory is the workspace root.
#[derive(Debug, Default)]
pub struct ShellHandler;

impl LanguageHandler for ShellHandler {
    fn version(&self) -> String {
        "shell/1".to_string()
    }

    fn build(&self, target: &Target, workspace: &Path) -> Result<BuildResult> {
        let command = target
            .config
            .get("command")
            .and_then(|value| value.as_array())
            .map(|args| {
                args.iter()
                    .filter_map(|arg| arg.as_str().map(String::from))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let Some((program, args)) = command.split_first() else {
            return Ok(BuildResult::builder()
                .success(false)
                .error(format!("target {} declares no command", target.label))
                .build());
        };

        let output = std::process::Command::new(program)
            .args(args)
            .current_dir(workspace)
            .envs(&target.env)
            .output()
            .with_context(|| format!("spawn {program:?}"))?;

        let outputs = self.outputs(target, workspace)?;
        Ok(BuildResult::builder()
            .success(output.status.success())
            .outputs(outputs)
            .maybe_error(
                (!output.status.success())
                    .then(|| String::from_utf8_lossy(&output.stderr).into_owned()),
            )
            .build())
    }

    fn outputs(&self, target: &Target, _workspace: &Path) -> Result<Vec<String>> {
        Ok(target.output.iter().cloned().collect())
    }
}
