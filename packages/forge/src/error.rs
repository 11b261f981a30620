//! Error taxonomy for the engine.
//!
//! Operations return `color_eyre::Result` and layer context with
//! [`color_eyre::eyre::Context`]; the typed errors here are the leaves of
//! those report chains. Retry policy, exit codes, and the terminal summary
//! all key on the [`ErrorCategory`] recovered by walking the chain, so any
//! failure the engine wants to treat specially must bottom out in one of
//! these types.

use derive_more::{Display, Error};
use strum::{Display as StrumDisplay, EnumIter};

/// The broad kind of a failure, driving recovery behavior.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, StrumDisplay, EnumIter)]
pub enum ErrorCategory {
    /// A language handler reported a failed build.
    Build,
    /// Malformed declarations or unresolvable imports.
    Analysis,
    /// Cycle, duplicate label, unresolved dependency. Fatal for the run.
    Graph,
    /// Cache load/save/evict failure. Treated as a miss and logged.
    Cache,
    /// Filesystem failure.
    Io,
    /// Spawn failure, timeout, resource exhaustion.
    Process,
    /// Network or protocol failure talking to the remote tier.
    Remote,
    /// Broken invariant inside the engine.
    Internal,
}

impl ErrorCategory {
    /// Maximum execution attempts for failures of this category, including
    /// the initial attempt.
    pub fn max_attempts(self) -> u32 {
        match self {
            Self::Process | Self::Remote => 5,
            Self::Cache | Self::Io => 3,
            Self::Build | Self::Analysis | Self::Graph | Self::Internal => 1,
        }
    }

    /// Whether failures of this category may be retried at all.
    pub fn retryable(self) -> bool {
        self.max_attempts() > 1
    }

    /// The process exit code reported when this category dominates a failed
    /// run.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Build => 1,
            Self::Analysis | Self::Graph => 2,
            Self::Io => 3,
            Self::Process => 4,
            Self::Cache => 5,
            Self::Remote => 6,
            Self::Internal => 70,
        }
    }
}

/// Structural problems with the declared target graph.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
pub enum GraphError {
    /// The graph contains a directed cycle. The path starts and ends at the
    /// same label.
    #[display("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[display("unresolved dependency: {from} depends on {to}, which is not declared")]
    UnresolvedDependency { from: String, to: String },

    #[display("duplicate target label: {label}")]
    DuplicateTarget { label: String },

    #[display("duplicate edge: {from} -> {to}")]
    DuplicateEdge { from: String, to: String },

    #[display("target depends on itself: {label}")]
    SelfEdge { label: String },

    #[display("invalid label {text:?}: {reason}")]
    InvalidLabel { text: String, reason: String },
}

/// Failures in cache metadata handling.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
pub enum CacheError {
    #[display("corrupt cache index {path:?}: {reason}")]
    Corrupt { path: String, reason: String },

    #[display("cache entry references missing blob {key}")]
    MissingBlob { key: String },
}

/// A CAS blob whose content no longer matches its address.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display("blob {key} failed integrity check: content hashes to {actual}")]
pub struct IntegrityError {
    pub key: String,
    pub actual: String,
}

/// Failures spawning or supervising action subprocesses.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
pub enum ProcessError {
    #[display("failed to spawn {command:?}: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[display("process exceeded its {limit_secs}s timeout")]
    Timeout { limit_secs: u64 },

    #[display("process was cancelled")]
    Cancelled,
}

/// A language handler reported a failed build.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display("build failed for {label} (exit code {exit_code})")]
pub struct BuildFailed {
    pub label: String,
    pub exit_code: i32,
}

/// Analysis failures: sources that cannot be read or scanned.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display("analysis failed for {path:?}: {reason}")]
pub struct AnalysisError {
    pub path: String,
    pub reason: String,
}

/// Recover the dominant category from a report chain.
///
/// The chain is walked outermost-first; the first typed leaf wins. Reports
/// with no typed leaf fall back to [`ErrorCategory::Internal`], which is
/// deliberately the loudest category: untyped failures are bugs in our
/// classification, not user errors.
pub fn categorize(report: &color_eyre::Report) -> ErrorCategory {
    for err in report.chain() {
        if err.downcast_ref::<GraphError>().is_some() {
            return ErrorCategory::Graph;
        }
        if err.downcast_ref::<CacheError>().is_some()
            || err.downcast_ref::<IntegrityError>().is_some()
        {
            return ErrorCategory::Cache;
        }
        if err.downcast_ref::<ProcessError>().is_some() {
            return ErrorCategory::Process;
        }
        if err.downcast_ref::<BuildFailed>().is_some() {
            return ErrorCategory::Build;
        }
        if err.downcast_ref::<AnalysisError>().is_some() {
            return ErrorCategory::Analysis;
        }
        if err.downcast_ref::<reqwest::Error>().is_some() {
            return ErrorCategory::Remote;
        }
        if err.downcast_ref::<std::io::Error>().is_some() {
            return ErrorCategory::Io;
        }
    }
    ErrorCategory::Internal
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::{Context, eyre};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn categorize_walks_context_layers() {
        let report = Err::<(), _>(GraphError::Cycle {
            path: vec!["//a:a".into(), "//b:b".into(), "//a:a".into()],
        })
        .context("validate graph")
        .context("plan build")
        .unwrap_err();

        pretty_assert_eq!(categorize(&report), ErrorCategory::Graph);
    }

    #[test]
    fn categorize_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let report = Err::<(), _>(io).context("read source").unwrap_err();
        pretty_assert_eq!(categorize(&report), ErrorCategory::Io);
    }

    #[test]
    fn untyped_reports_are_internal() {
        let report = eyre!("something unexpected");
        pretty_assert_eq!(categorize(&report), ErrorCategory::Internal);
    }

    #[test]
    fn retry_budgets() {
        pretty_assert_eq!(ErrorCategory::Process.max_attempts(), 5);
        pretty_assert_eq!(ErrorCategory::Cache.max_attempts(), 3);
        pretty_assert_eq!(ErrorCategory::Io.max_attempts(), 3);
        pretty_assert_eq!(ErrorCategory::Build.max_attempts(), 1);
        assert!(!ErrorCategory::Build.retryable());
    }
}
