//! The action executor.
//!
//! `run` drives an [`ActionGraph`] to completion over a fixed pool of
//! worker threads. Each action goes through the same pipeline: claim the
//! node, resolve the late-bound fingerprint, consult the cache coordinator,
//! and only on a miss enter a sandbox, spawn the command, capture output,
//! and record the result in the action cache (and the target cache when a
//! terminal action completes).
//!
//! Retries are category-driven: process and I/O failures back off and try
//! again, build failures do not, except for tests, whose budget adapts
//! to their flakiness history. A retry is a fresh execution; the cache is
//! consulted only before the first attempt.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bon::bon;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use tracing::{debug, instrument, trace, warn};

use crate::{
    action::ActionType,
    cache::{ActionEntry, CacheCoordinator, OutputFile, TargetEntry},
    config::ExecConfig,
    error::{BuildFailed, ErrorCategory, ProcessError, categorize},
    events::{Event, EventBus},
    exec::{CancelToken, FlakyTracker, RetryPolicy, Scheduler, WorkerQueue},
    fs,
    graph::{ActionGraph, ActionNode, ActionNodeId, BuildGraph, NodeId, NodeStatus},
    handler::HandlerSet,
    hash::{Digest, Fingerprint},
    sandbox::{NativeSandboxProvider, Sandbox, SandboxProvider, SandboxSpec},
};

/// How often a worker polls a running subprocess for exit, timeout, and
/// cancellation.
const POLL_TICK: Duration = Duration::from_millis(5);

/// Outcome counters for one `run`.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ExecutionReport {
    /// Actions that actually spawned a process (or handler).
    pub executed: usize,
    /// Actions satisfied from the cache.
    pub cache_hits: usize,
    /// Actions that failed terminally.
    pub failed: usize,
    /// Actions skipped because something upstream failed.
    pub skipped: usize,
    /// Actions cancelled by a build abort.
    pub cancelled: usize,
    /// Categories of every terminal failure, in completion order.
    pub failure_categories: Vec<ErrorCategory>,
}

impl ExecutionReport {
    /// The most frequent failure category, ties broken toward the loudest
    /// exit code.
    pub fn dominant_category(&self) -> Option<ErrorCategory> {
        let mut counts = std::collections::BTreeMap::new();
        for &category in &self.failure_categories {
            *counts.entry(category).or_insert(0usize) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|&(category, count)| (count, category.exit_code()))
            .map(|(category, _)| category)
    }
}

struct RunState {
    remaining: AtomicUsize,
    executed: AtomicUsize,
    cache_hits: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    cancelled: AtomicUsize,
    failure_categories: std::sync::Mutex<Vec<ErrorCategory>>,
}

impl RunState {
    fn new(total: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(total),
            executed: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            failure_categories: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Count `settled` actions as finished; shuts the scheduler down when
    /// the last one settles.
    fn settle(&self, settled: usize, scheduler: &Scheduler) {
        if self.remaining.fetch_sub(settled, Ordering::AcqRel) == settled {
            scheduler.shutdown();
        }
    }
}

/// One subprocess execution's raw result.
struct ExecOutcome {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    outputs: Vec<(String, Digest)>,
    duration: Duration,
}

enum Terminal {
    Failed(color_eyre::Report),
    Cancelled,
}

/// The worker-pool executor.
pub struct Executor {
    coordinator: Arc<CacheCoordinator>,
    events: EventBus,
    workspace: PathBuf,
    config: ExecConfig,
    sandboxes: Arc<dyn SandboxProvider>,
    handlers: HandlerSet,
    retry: RetryPolicy,
    flaky: Arc<FlakyTracker>,
}

#[bon]
impl Executor {
    #[builder]
    pub fn new(
        coordinator: Arc<CacheCoordinator>,
        events: EventBus,
        #[builder(into)] workspace: PathBuf,
        #[builder(default)] config: ExecConfig,
        sandboxes: Option<Arc<dyn SandboxProvider>>,
        #[builder(default)] handlers: HandlerSet,
        #[builder(default)] retry: RetryPolicy,
        flaky: Option<Arc<FlakyTracker>>,
    ) -> Self {
        Self {
            coordinator,
            events,
            workspace,
            config,
            sandboxes: sandboxes.unwrap_or_else(|| Arc::new(NativeSandboxProvider)),
            handlers,
            retry,
            flaky: flaky.unwrap_or_default(),
        }
    }
}

impl Executor {
    /// The flakiness tracker, for persistence across runs by the embedder.
    pub fn flaky(&self) -> &Arc<FlakyTracker> {
        &self.flaky
    }

    /// Execute every action in the graph.
    #[instrument(name = "Executor::run", skip_all, fields(actions = actions.len()))]
    pub fn run(
        &self,
        graph: &BuildGraph,
        actions: &ActionGraph,
        cancel: &CancelToken,
    ) -> Result<ExecutionReport> {
        if actions.is_empty() {
            return Ok(ExecutionReport::default());
        }

        let workers = self.config.worker_count();
        let (scheduler, queues) = Scheduler::new(workers);
        let state = RunState::new(actions.len());

        // Seed longest-critical-path first so the initial wave starts the
        // chains that bound total wall-clock.
        let mut seeds = actions.ready_actions();
        seeds.sort_by_key(|&id| std::cmp::Reverse(actions.node(id).critical_path));
        for id in seeds {
            scheduler.inject(id.0, actions.node(id).action.priority);
        }

        std::thread::scope(|scope| {
            for queue in queues {
                let scheduler = scheduler.clone();
                let state = &state;
                scope.spawn(move || {
                    while let Some((raw, _)) = queue.next(cancel) {
                        let id = ActionNodeId(raw);
                        self.process(graph, actions, &queue, &scheduler, state, id, cancel);
                    }
                });
            }
        });

        if cancel.cancelled() {
            self.cancel_leftovers(graph, actions, &state);
        }

        let failure_categories = state
            .failure_categories
            .lock()
            .expect("failure categories lock")
            .clone();

        Ok(ExecutionReport {
            executed: state.executed.load(Ordering::Acquire),
            cache_hits: state.cache_hits.load(Ordering::Acquire),
            failed: state.failed.load(Ordering::Acquire),
            skipped: state.skipped.load(Ordering::Acquire),
            cancelled: state.cancelled.load(Ordering::Acquire),
            failure_categories,
        })
    }

    /// Run one claimed action end to end.
    #[allow(clippy::too_many_arguments)]
    fn process(
        &self,
        graph: &BuildGraph,
        actions: &ActionGraph,
        queue: &WorkerQueue,
        scheduler: &Scheduler,
        state: &RunState,
        id: ActionNodeId,
        cancel: &CancelToken,
    ) {
        let node = actions.node(id);
        if !node.try_transition(NodeStatus::Ready, NodeStatus::Running) {
            return;
        }
        let correlation = node.action.id().to_string();

        if cancel.cancelled() {
            node.set_status(NodeStatus::Cancelled);
            state.cancelled.fetch_add(1, Ordering::AcqRel);
            state.settle(1, scheduler);
            return;
        }

        let fingerprint = self.resolve_fingerprint(graph, actions, node);
        node.set_fingerprint(fingerprint.clone());

        // Cache consult happens exactly once, before the first attempt.
        let cached = self.coordinator.lookup_action(&fingerprint, &correlation);
        let result = match cached {
            Some(entry) if entry.ok() => match self.restore_action(&entry) {
                Ok(outputs) => {
                    state.cache_hits.fetch_add(1, Ordering::AcqRel);
                    Ok((NodeStatus::Cached, outputs))
                }
                Err(err) => {
                    // A restore failure degrades to a miss.
                    warn!(?err, %correlation, "cache restore failed, executing");
                    self.execute_with_retries(graph, actions, node, &fingerprint, &correlation, cancel)
                        .map(|outputs| (NodeStatus::Succeeded, outputs))
                }
            },
            Some(entry) => {
                // A cached failure short-circuits identical re-runs while
                // its (short) TTL lasts.
                state.cache_hits.fetch_add(1, Ordering::AcqRel);
                Err(Terminal::Failed(
                    eyre!(BuildFailed {
                        label: node.action.label.to_string(),
                        exit_code: entry.exit_code,
                    })
                    .wrap_err("cached failure"),
                ))
            }
            None => self
                .execute_with_retries(graph, actions, node, &fingerprint, &correlation, cancel)
                .map(|outputs| {
                    state.executed.fetch_add(1, Ordering::AcqRel);
                    (NodeStatus::Succeeded, outputs)
                }),
        };

        match result {
            Ok((status, outputs)) => {
                self.finish_success(graph, actions, queue, scheduler, state, id, status, outputs);
            }
            Err(Terminal::Cancelled) => {
                node.set_status(NodeStatus::Cancelled);
                state.cancelled.fetch_add(1, Ordering::AcqRel);
                state.settle(1, scheduler);
            }
            Err(Terminal::Failed(report)) => {
                let message = format!("{report:#}");
                debug!(%correlation, error = %message, "action failed terminally");
                state
                    .failure_categories
                    .lock()
                    .expect("failure categories lock")
                    .push(categorize(&report));

                let skipped = actions.fail(id, &message);
                graph.fail(node.target, &message);
                state.failed.fetch_add(1, Ordering::AcqRel);
                state.skipped.fetch_add(skipped.len(), Ordering::AcqRel);
                state.settle(1 + skipped.len(), scheduler);

                if !self.config.keep_going {
                    cancel.cancel();
                    scheduler.shutdown();
                }
            }
        }
    }

    /// Execution attempts under the retry policy. Returns the recorded
    /// outputs on success.
    fn execute_with_retries(
        &self,
        graph: &BuildGraph,
        actions: &ActionGraph,
        node: &ActionNode,
        fingerprint: &Fingerprint,
        correlation: &str,
        cancel: &CancelToken,
    ) -> std::result::Result<Vec<(String, Digest)>, Terminal> {
        loop {
            let attempt = node.record_attempt();
            self.events.emit(correlation, Event::ActionStart);

            match self.execute_once(graph, actions, node, cancel) {
                Ok(outcome) if outcome.exit_code == 0 => {
                    let outputs = outcome.outputs.clone();
                    if let Err(err) = self.record_outcome(fingerprint, correlation, &outcome) {
                        warn!(?err, "failed to record action result");
                    }
                    if node.action.kind == ActionType::Test {
                        self.flaky
                            .record(correlation, true, attempt.saturating_sub(1));
                    }
                    return Ok(outputs);
                }
                Ok(outcome) => {
                    // The command ran and failed: a build failure. Cache it
                    // (failures expire fast) so identical retries of the
                    // same inputs short-circuit.
                    if let Err(err) = self.record_outcome(fingerprint, correlation, &outcome) {
                        warn!(?err, "failed to record action failure");
                    }

                    let budget = self.attempt_budget(node, correlation, ErrorCategory::Build);
                    if attempt < budget {
                        trace!(%correlation, attempt, budget, "retrying failed action");
                        std::thread::sleep(self.retry.delay(ErrorCategory::Process, attempt));
                        continue;
                    }
                    if node.action.kind == ActionType::Test {
                        self.flaky.record(correlation, false, attempt);
                    }
                    let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();
                    return Err(Terminal::Failed(
                        eyre!(BuildFailed {
                            label: node.action.label.to_string(),
                            exit_code: outcome.exit_code,
                        })
                        .wrap_err(stderr),
                    ));
                }
                Err(report) => {
                    if report
                        .chain()
                        .any(|err| matches!(err.downcast_ref(), Some(ProcessError::Cancelled)))
                    {
                        return Err(Terminal::Cancelled);
                    }

                    let category = categorize(&report);
                    let budget = self.attempt_budget(node, correlation, category);
                    if attempt < budget {
                        let delay = self.retry.delay(category, attempt);
                        debug!(
                            %correlation,
                            attempt,
                            budget,
                            %category,
                            ?delay,
                            "retrying after failure"
                        );
                        std::thread::sleep(delay);
                        continue;
                    }

                    // Timeouts are cached like non-zero exits so identical
                    // re-runs short-circuit while the failure TTL lasts.
                    let timed_out = report
                        .chain()
                        .any(|err| matches!(err.downcast_ref(), Some(ProcessError::Timeout { .. })));
                    if timed_out {
                        let outcome = ExecOutcome {
                            exit_code: 124,
                            stdout: Vec::new(),
                            stderr: format!("{report:#}").into_bytes(),
                            outputs: Vec::new(),
                            duration: node.action.timeout,
                        };
                        if let Err(err) = self.record_outcome(fingerprint, correlation, &outcome) {
                            warn!(?err, "failed to record timeout");
                        }
                    }
                    return Err(Terminal::Failed(
                        report.wrap_err(format!("action failed after {attempt} attempt(s)")),
                    ));
                }
            }
        }
    }

    /// Total attempts allowed for this action and failure category.
    ///
    /// An explicit per-action retry limit wins; tests otherwise use the
    /// adaptive flakiness budget for build failures; everything else
    /// follows the category.
    fn attempt_budget(&self, node: &ActionNode, correlation: &str, category: ErrorCategory) -> u32 {
        if let Some(max_retries) = node.action.max_retries {
            return max_retries + 1;
        }
        if node.action.kind == ActionType::Test && category == ErrorCategory::Build {
            return self.flaky.budget(correlation);
        }
        self.retry.max_attempts(category)
    }

    /// One sandboxed execution.
    fn execute_once(
        &self,
        graph: &BuildGraph,
        actions: &ActionGraph,
        node: &ActionNode,
        cancel: &CancelToken,
    ) -> Result<ExecOutcome> {
        let spec = SandboxSpec::builder()
            .env(node.action.env.clone())
            .limits(node.action.limits)
            .build();
        let mut sandbox = self.sandboxes.enter(spec).context("enter sandbox")?;

        let result = self.execute_in(&mut *sandbox, graph, actions, node, cancel);
        if let Err(err) = sandbox.release() {
            warn!(?err, "sandbox release failed");
        }
        result
    }

    fn execute_in(
        &self,
        sandbox: &mut dyn Sandbox,
        graph: &BuildGraph,
        actions: &ActionGraph,
        node: &ActionNode,
        cancel: &CancelToken,
    ) -> Result<ExecOutcome> {
        self.materialize_inputs(sandbox.root(), graph, actions, node)
            .context("materialize inputs")?;

        let started = Instant::now();

        // Custom actions with a registered handler go through it; the
        // handler sees the sandbox root as its workspace.
        if node.action.kind == ActionType::Custom {
            if let Some(handler) = self
                .handlers
                .get(graph.node(node.target).target.language)
                .cloned()
            {
                let target = &graph.node(node.target).target;
                let result = handler.build(target, sandbox.root())?;
                let outputs = if result.success {
                    self.collect_outputs(sandbox.root(), result.outputs.iter())?
                } else {
                    Vec::new()
                };
                return Ok(ExecOutcome {
                    exit_code: if result.success { 0 } else { 1 },
                    stdout: Vec::new(),
                    stderr: result.error.unwrap_or_default().into_bytes(),
                    outputs,
                    duration: started.elapsed(),
                });
            }
        }

        let (exit_code, stdout, stderr) = self
            .spawn_and_wait(sandbox, node, cancel)
            .context("run command")?;
        let duration = started.elapsed();

        let outputs = if exit_code == 0 {
            self.collect_outputs(sandbox.root(), node.action.outputs.iter())
                .context("collect outputs")?
        } else {
            Vec::new()
        };

        Ok(ExecOutcome {
            exit_code,
            stdout,
            stderr,
            outputs,
            duration,
        })
    }

    /// Copy declared sources and dependency outputs into the sandbox, and
    /// pre-create declared output directories (compilers do not).
    fn materialize_inputs(
        &self,
        root: &Path,
        graph: &BuildGraph,
        actions: &ActionGraph,
        node: &ActionNode,
    ) -> Result<()> {
        for output in &node.action.outputs {
            let path = root.join(output);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        for source in &node.action.sources {
            let dst = root.join(source);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy_file(self.workspace.join(source), &dst)
                .with_context(|| format!("materialize source {source:?}"))?;
        }

        for (path, digest) in self.dependency_outputs(graph, actions, node)? {
            let content = self
                .coordinator
                .cas()
                .get(&digest)?
                .ok_or_else(|| eyre!("dependency output blob missing: {digest}"))?;
            let dst = root.join(&path);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dst, &content)?;
        }
        Ok(())
    }

    /// Every (path, digest) this action actually consumes.
    ///
    /// Cross-target edges on non-terminal actions are ordering-only: a
    /// compile is sequenced behind its dependencies but reads none of
    /// their bytes, so their outputs are neither materialized nor
    /// fingerprinted. That is what keeps sibling compiles cached when
    /// only an upstream target rebuilt. Terminal actions consume
    /// everything: same-target action outputs plus dependency targets'
    /// outputs (from live action nodes or, for cached targets, from the
    /// recorded manifest).
    ///
    /// Action dependencies publish their outputs on their node before
    /// flipping to a satisfying status, so reading them after observing
    /// `Ready` is race-free.
    fn dependency_outputs(
        &self,
        graph: &BuildGraph,
        actions: &ActionGraph,
        node: &ActionNode,
    ) -> Result<Vec<(String, Digest)>> {
        let mut outputs = Vec::new();
        for &dep in &node.deps {
            let dep_node = actions.node(dep);
            if dep_node.target == node.target || node.terminal {
                outputs.extend(dep_node.outputs());
            }
        }

        if node.terminal {
            let target = graph.node(node.target);
            for &dep in &target.deps {
                let dep_node = graph.node(dep);
                if dep_node.status() != NodeStatus::Cached {
                    continue;
                }
                let Some(manifest_digest) = dep_node.output() else {
                    continue;
                };
                outputs.extend(self.read_manifest(&manifest_digest)?);
            }
        }
        Ok(outputs)
    }

    /// Spawn the (possibly wrapped) command and wait with timeout and
    /// cancellation polling.
    fn spawn_and_wait(
        &self,
        sandbox: &mut dyn Sandbox,
        node: &ActionNode,
        cancel: &CancelToken,
    ) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        let action = &node.action;
        let argv = sandbox.wrap(action.command.clone());
        let Some((program, args)) = argv.split_first() else {
            return Err(eyre!(ProcessError::SpawnFailed {
                command: String::new(),
                reason: "empty command".to_string(),
            }));
        };

        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        sandbox.configure(&mut command)?;

        let mut child = command.spawn().map_err(|err| {
            eyre!(ProcessError::SpawnFailed {
                command: program.clone(),
                reason: err.to_string(),
            })
        })?;

        // Drain pipes on their own threads so a chatty process can't
        // deadlock against a full pipe while we poll.
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let stdout_reader = std::thread::spawn(move || read_all(stdout));
        let stderr_reader = std::thread::spawn(move || read_all(stderr));

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().context("poll child")? {
                break status;
            }
            if started.elapsed() > action.timeout {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                return Err(eyre!(ProcessError::Timeout {
                    limit_secs: action.timeout.as_secs(),
                }));
            }
            if cancel.cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                return Err(eyre!(ProcessError::Cancelled));
            }
            std::thread::sleep(POLL_TICK);
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        Ok((status.code().unwrap_or(-1), stdout, stderr))
    }

    /// Hash declared outputs, store them in the CAS, and copy them back to
    /// the workspace.
    fn collect_outputs<'a>(
        &self,
        root: &Path,
        declared: impl Iterator<Item = &'a String>,
    ) -> Result<Vec<(String, Digest)>> {
        let mut outputs = Vec::new();
        for path in declared {
            let produced = root.join(path);
            let content = fs::read_buffered_opt(&produced)?
                .ok_or_else(|| eyre!("declared output was not produced: {path:?}"))?;
            let digest = self.coordinator.cas().put(&content)?;
            fs::copy_file(&produced, self.workspace.join(path))
                .with_context(|| format!("install output {path:?}"))?;
            outputs.push((path.clone(), digest));
        }
        Ok(outputs)
    }

    /// Write an execution's result into the action cache.
    fn record_outcome(
        &self,
        fingerprint: &Fingerprint,
        correlation: &str,
        outcome: &ExecOutcome,
    ) -> Result<()> {
        let cas = self.coordinator.cas();
        let stdout = cas.put(&outcome.stdout)?;
        let stderr = cas.put(&outcome.stderr)?;

        let mut bytes = 0u64;
        let outputs = outcome
            .outputs
            .iter()
            .map(|(path, digest)| {
                bytes += cas
                    .get(digest)
                    .ok()
                    .flatten()
                    .map(|content| content.len() as u64)
                    .unwrap_or(0);
                OutputFile::builder()
                    .path(path.clone())
                    .key(digest.clone())
                    .build()
            })
            .collect::<Vec<_>>();

        let entry = ActionEntry::builder()
            .outputs(outputs)
            .stdout(stdout)
            .stderr(stderr)
            .exit_code(outcome.exit_code)
            .duration_ms(outcome.duration.as_millis() as u64)
            .bytes(bytes)
            .at(jiff::Timestamp::now())
            .build();
        self.coordinator
            .update_action(fingerprint, entry, correlation)?;

        self.events.emit(
            correlation,
            Event::ActionComplete {
                ok: outcome.exit_code == 0,
                duration_ms: outcome.duration.as_millis() as u64,
            },
        );
        Ok(())
    }

    /// Restore a cached success's outputs into the workspace.
    fn restore_action(&self, entry: &ActionEntry) -> Result<Vec<(String, Digest)>> {
        let cas = self.coordinator.cas();
        let mut outputs = Vec::new();
        for output in &entry.outputs {
            let content = cas
                .get(&output.key)?
                .ok_or_else(|| eyre!("cached output blob missing: {}", output.key))?;
            let dst = self.workspace.join(&output.path);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dst, &content)?;
            outputs.push((output.path.clone(), output.key.clone()));
        }
        Ok(outputs)
    }

    /// Mark an action (and possibly its target) complete and feed newly
    /// ready work back into the scheduler.
    #[allow(clippy::too_many_arguments)]
    fn finish_success(
        &self,
        graph: &BuildGraph,
        actions: &ActionGraph,
        queue: &WorkerQueue,
        scheduler: &Scheduler,
        state: &RunState,
        id: ActionNodeId,
        status: NodeStatus,
        outputs: Vec<(String, Digest)>,
    ) {
        let node = actions.node(id);

        if node.terminal {
            if let Err(err) = self.complete_target(graph, node.target, &outputs, status) {
                warn!(?err, "failed to record target completion");
            }
        }

        // `complete` publishes the outputs on the node before any
        // dependent can observe readiness.
        let newly_ready = actions.complete(id, status, outputs);
        for ready in newly_ready {
            let priority = actions.node(ready).action.priority;
            queue.push(ready.0, priority);
        }
        state.settle(1, scheduler);
    }

    /// Record a target's terminal result: output manifest into the CAS,
    /// entry into the target cache, status onto the target node.
    fn complete_target(
        &self,
        graph: &BuildGraph,
        target_id: NodeId,
        outputs: &[(String, Digest)],
        status: NodeStatus,
    ) -> Result<()> {
        let node = graph.node(target_id);
        let label = node.target.label.to_string();

        let manifest = outputs
            .iter()
            .map(|(path, digest)| {
                OutputFile::builder()
                    .path(path.clone())
                    .key(digest.clone())
                    .build()
            })
            .collect::<Vec<_>>();
        let bytes = manifest_bytes(self.coordinator.cas(), &manifest);
        let manifest_blob = serde_json::to_vec(&manifest).context("serialize output manifest")?;
        let manifest_digest = self.coordinator.cas().put(&manifest_blob)?;

        node.set_output(manifest_digest.clone());
        if let Some(fingerprint) = node.fingerprint() {
            let entry = TargetEntry::builder()
                .output(manifest_digest)
                .bytes(bytes)
                .at(jiff::Timestamp::now())
                .build();
            self.coordinator.update_target(&fingerprint, entry, &label)?;
        }

        graph.complete(target_id, status);
        Ok(())
    }

    /// Read a target output manifest back out of the CAS.
    fn read_manifest(&self, digest: &Digest) -> Result<Vec<(String, Digest)>> {
        let content = self
            .coordinator
            .cas()
            .get(digest)?
            .ok_or_else(|| eyre!("output manifest blob missing: {digest}"))?;
        let manifest = serde_json::from_slice::<Vec<OutputFile>>(&content)
            .context("decode output manifest")?;
        Ok(manifest
            .into_iter()
            .map(|output| (output.path, output.key))
            .collect())
    }

    /// The action's resolved fingerprint: its declared identity plus the
    /// digests of everything it consumes from its dependencies. Ordering
    /// edges contribute nothing, so an action whose own inputs are
    /// unchanged hits the cache even when upstream targets rebuilt.
    fn resolve_fingerprint(
        &self,
        graph: &BuildGraph,
        actions: &ActionGraph,
        node: &ActionNode,
    ) -> Fingerprint {
        let mut dep_digests: Vec<Vec<u8>> = node
            .deps
            .iter()
            .map(|&dep| actions.node(dep))
            .filter(|dep_node| dep_node.target == node.target || node.terminal)
            .flat_map(|dep_node| dep_node.outputs())
            .map(|(_, digest)| digest.as_bytes().to_vec())
            .collect();

        if node.terminal {
            let target = graph.node(node.target);
            for &dep in &target.deps {
                let dep_node = graph.node(dep);
                if dep_node.status() == NodeStatus::Cached {
                    if let Some(output) = dep_node.output() {
                        dep_digests.push(output.as_bytes().to_vec());
                    }
                }
            }
        }
        dep_digests.sort();

        let mut fields = vec![node.action.fingerprint().as_bytes().to_vec()];
        fields.extend(dep_digests);
        Fingerprint::from_fields(fields)
    }

    /// Mark every non-terminal action and target cancelled after an abort.
    fn cancel_leftovers(&self, graph: &BuildGraph, actions: &ActionGraph, state: &RunState) {
        let mut cancelled = 0;
        for node in actions.nodes() {
            let status = node.status();
            if !status.terminal() {
                node.set_status(NodeStatus::Cancelled);
                cancelled += 1;
            }
        }
        state.cancelled.fetch_add(cancelled, Ordering::AcqRel);
        graph.cancel_remaining();
        debug!(cancelled, "cancelled leftover actions");
    }
}

fn read_all(mut reader: impl std::io::Read) -> Vec<u8> {
    let mut buffer = Vec::new();
    let _ = std::io::Read::read_to_end(&mut reader, &mut buffer);
    buffer
}

fn manifest_bytes(cas: &crate::cas::BlobStore, manifest: &[OutputFile]) -> u64 {
    manifest
        .iter()
        .filter_map(|output| cas.get(&output.key).ok().flatten())
        .map(|content| content.len() as u64)
        .sum()
}
