//! The build driver: one run, end to end.
//!
//! A run walks the phases in order: analyze sources, assemble and
//! validate the target graph, fingerprint in dependency order, satisfy
//! whole targets from the cache, lower the rest into actions, execute,
//! and close with a terminal summary. Structural problems (cycles,
//! unresolved dependencies, unreadable sources) are fatal and surface as
//! errors; build failures are part of the summary.

use std::{path::PathBuf, sync::Arc};

use bon::bon;
use color_eyre::{Result, Section, eyre::Context};
use tracing::{debug, info, instrument};

use crate::{
    analyzer::{Analyzer, TargetAnalysis},
    cache::CacheCoordinator,
    config::{CacheConfig, ExecConfig},
    error::ErrorCategory,
    events::EventBus,
    exec::{CancelToken, ExecutionReport, Executor, FlakyTracker},
    graph::{BuildGraph, NodeStatus, lower},
    handler::HandlerSet,
    label::Label,
    sandbox::SandboxProvider,
    target::Target,
};

/// Terminal summary of one build run.
#[derive(Clone, Debug, Default)]
pub struct BuildSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cached: usize,
    pub cancelled: usize,
    /// Failed targets with their error chains.
    pub errors: Vec<(Label, String)>,
    /// Action-level counters from the executor.
    pub report: ExecutionReport,
}

impl BuildSummary {
    /// Whether every target reached a satisfying state.
    pub fn ok(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    /// The process exit code for this run: zero on success, otherwise the
    /// dominant failure category's code.
    pub fn exit_code(&self) -> i32 {
        if self.ok() {
            return 0;
        }
        if self.failed == 0 {
            // Cancelled without failures: conventional interrupt code.
            return 130;
        }
        self.report
            .dominant_category()
            .unwrap_or(ErrorCategory::Build)
            .exit_code()
    }
}

/// A configured build engine, reusable across runs.
pub struct Build {
    workspace: PathBuf,
    coordinator: Arc<CacheCoordinator>,
    analyzer: Analyzer,
    events: EventBus,
    handlers: HandlerSet,
    exec_config: ExecConfig,
    sandboxes: Option<Arc<dyn SandboxProvider>>,
    flaky: Arc<FlakyTracker>,
    cancel: CancelToken,
}

#[bon]
impl Build {
    /// Open the engine over a workspace.
    #[builder]
    pub fn new(
        #[builder(into)] workspace: PathBuf,
        #[builder(default)] cache_config: CacheConfig,
        #[builder(default)] exec_config: ExecConfig,
        events: Option<EventBus>,
        #[builder(default)] handlers: HandlerSet,
        sandboxes: Option<Arc<dyn SandboxProvider>>,
    ) -> Result<Self> {
        let events = events.unwrap_or_else(EventBus::null);
        let coordinator = Arc::new(CacheCoordinator::open(cache_config, events.clone())?);
        let analyzer = Analyzer::open(coordinator.cache_root(), workspace.clone())?;
        Ok(Self {
            workspace,
            coordinator,
            analyzer,
            events,
            handlers,
            exec_config,
            sandboxes,
            flaky: Arc::new(FlakyTracker::new()),
            cancel: CancelToken::new(),
        })
    }
}

impl Build {
    /// The cache coordinator backing this engine.
    pub fn coordinator(&self) -> &Arc<CacheCoordinator> {
        &self.coordinator
    }

    /// Token that aborts the current run when cancelled.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run one build of the declared targets.
    #[instrument(name = "Build::run", skip_all, fields(targets = targets.len()))]
    pub fn run(&self, targets: Vec<Target>) -> Result<BuildSummary> {
        let graph = BuildGraph::build(targets)
            .context("assemble target graph")
            .suggestion("check target declarations for cycles and missing dependencies")?;

        // Analyze every target's sources before anything dispatches.
        let mut analyses = std::collections::HashMap::new();
        for node in graph.nodes() {
            let target = &node.target;
            if target.sources.is_empty() {
                continue;
            }
            let analysis = self
                .analyzer
                .analyze(target)
                .with_context(|| format!("analyze sources of {}", target.label))?;
            analyses.insert(target.label.clone(), analysis);
        }

        self.fingerprint_targets(&graph, &analyses);
        let from_cache = self.satisfy_from_cache(&graph);
        debug!(from_cache, "targets satisfied from cache");

        let actions = lower(&graph, &analyses).context("lower targets into actions")?;

        let executor = Executor::builder()
            .coordinator(Arc::clone(&self.coordinator))
            .events(self.events.clone())
            .workspace(self.workspace.clone())
            .config(self.exec_config.clone())
            .maybe_sandboxes(self.sandboxes.clone())
            .handlers(self.handlers.clone())
            .flaky(Arc::clone(&self.flaky))
            .build();
        let report = executor.run(&graph, &actions, &self.cancel)?;

        self.analyzer.flush()?;
        self.coordinator.evict()?;
        self.coordinator.maybe_gc()?;
        self.coordinator.flush()?;

        let summary = summarize(&graph, report);
        info!(
            succeeded = summary.succeeded,
            cached = summary.cached,
            failed = summary.failed,
            skipped = summary.skipped,
            "build finished"
        );
        Ok(summary)
    }

    /// Compute target fingerprints in dependency order.
    ///
    /// Dependencies appear before dependents in topological order, so
    /// every dependency fingerprint exists when a dependent needs it.
    fn fingerprint_targets(
        &self,
        graph: &BuildGraph,
        analyses: &std::collections::HashMap<Label, TargetAnalysis>,
    ) {
        for &id in graph.topo_order() {
            let node = graph.node(id);
            let target = &node.target;

            let source_digests = analyses
                .get(&target.label)
                .map(|analysis| analysis.source_digests().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            let dep_fingerprints = node
                .deps
                .iter()
                .filter_map(|&dep| graph.node(dep).fingerprint())
                .collect::<Vec<_>>();

            let fingerprint = target.fingerprint(
                source_digests.iter(),
                dep_fingerprints.iter(),
                &self.handlers.version_of(target.language),
            );
            node.set_fingerprint(fingerprint);
        }
    }

    /// Mark targets whose fingerprints hit the cache, restoring their
    /// outputs. Returns how many were satisfied.
    fn satisfy_from_cache(&self, graph: &BuildGraph) -> usize {
        let mut satisfied = 0;
        for &id in graph.topo_order() {
            let node = graph.node(id);
            let Some(fingerprint) = node.fingerprint() else {
                continue;
            };
            let label = node.target.label.to_string();

            let Some(entry) = self.coordinator.lookup_target(&fingerprint, &label) else {
                continue;
            };
            if let Err(err) = self.restore_target(&entry) {
                debug!(?err, %label, "target restore failed, rebuilding");
                continue;
            }

            node.set_output(entry.output.clone());
            graph.complete(id, NodeStatus::Cached);
            satisfied += 1;
        }
        satisfied
    }

    /// Materialize a cached target's outputs into the workspace.
    fn restore_target(&self, entry: &crate::cache::TargetEntry) -> Result<()> {
        let cas = self.coordinator.cas();
        let manifest = cas
            .get(&entry.output)?
            .ok_or_else(|| color_eyre::eyre::eyre!("output manifest blob missing"))?;
        let manifest: Vec<crate::cache::OutputFile> =
            serde_json::from_slice(&manifest).context("decode output manifest")?;

        for output in manifest {
            let content = cas.get(&output.key)?.ok_or_else(|| {
                color_eyre::eyre::eyre!("cached output blob missing: {}", output.key)
            })?;
            let dst = self.workspace.join(&output.path);
            if let Some(parent) = dst.parent() {
                crate::fs::create_dir_all(parent)?;
            }
            crate::fs::write(&dst, &content)?;
        }
        Ok(())
    }
}

fn summarize(graph: &BuildGraph, report: ExecutionReport) -> BuildSummary {
    let counts = graph.counts();
    let errors = graph
        .nodes()
        .iter()
        .filter(|node| node.status() == NodeStatus::Failed)
        .map(|node| {
            (
                node.target.label.clone(),
                node.error().unwrap_or_else(|| "unknown error".to_string()),
            )
        })
        .collect();

    BuildSummary {
        succeeded: counts.succeeded,
        failed: counts.failed,
        skipped: counts.skipped,
        cached: counts.cached,
        cancelled: counts.cancelled,
        errors,
        report,
    }
}
