//! The remote worker registry.
//!
//! Workers register with their capabilities and heartbeat periodically.
//! Missed heartbeats walk health down `Healthy → Degraded → Failing →
//! Failed`; a heartbeat from a degraded worker walks it back up through
//! `Recovering`. A failed worker's in-progress actions are handed back to
//! the caller for reassignment (the contract is that none are lost), and
//! the worker is blacklisted with exponential backoff.
//!
//! All operations are short and run under one mutex.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bon::Builder;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Worker health ladder.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Failing,
    Failed,
    Recovering,
}

impl Health {
    fn degrade(self) -> Health {
        match self {
            Health::Healthy => Health::Degraded,
            Health::Degraded => Health::Failing,
            Health::Failing | Health::Failed => Health::Failed,
            Health::Recovering => Health::Degraded,
        }
    }

    fn recover(self) -> Health {
        match self {
            Health::Healthy => Health::Healthy,
            Health::Recovering => Health::Healthy,
            _ => Health::Recovering,
        }
    }

    /// Weight used by priority-weighted selection.
    fn score(self) -> f64 {
        match self {
            Health::Healthy => 1.0,
            Health::Recovering => 0.75,
            Health::Degraded => 0.5,
            Health::Failing => 0.1,
            Health::Failed => 0.0,
        }
    }
}

/// Candidate selection strategy for dispatch.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Strategy {
    /// Rotate through eligible workers.
    #[default]
    RoundRobin,
    /// Fewest in-progress actions first.
    LeastLoaded,
    /// Prefer the worker that already has the most input blobs cached.
    Affinity,
    /// Score by health, load, and historical success rate.
    PriorityWeighted,
}

/// Registry tuning knobs.
#[derive(Copy, Clone, Debug, Builder)]
pub struct RegistryConfig {
    /// A worker missing heartbeats for this long degrades one step.
    #[builder(default = Duration::from_secs(10))]
    pub heartbeat_timeout: Duration,
    /// First blacklist period after a failure.
    #[builder(default = Duration::from_secs(5))]
    pub blacklist_initial: Duration,
    /// Blacklist ceiling.
    #[builder(default = Duration::from_secs(300))]
    pub blacklist_max: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug)]
struct WorkerState {
    capabilities: BTreeSet<String>,
    health: Health,
    in_progress: BTreeSet<String>,
    /// Blob digests this worker recently touched, for affinity scoring.
    cached_blobs: BTreeSet<String>,
    last_heartbeat: Instant,
    successes: u64,
    failures: u64,
    blacklisted_until: Option<Instant>,
    blacklist_backoff: Duration,
}

/// The worker registry.
pub struct WorkerRegistry {
    config: RegistryConfig,
    workers: Mutex<HashMap<String, WorkerState>>,
    round_robin: AtomicUsize,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            workers: Mutex::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Register (or re-register) a worker.
    #[instrument(name = "WorkerRegistry::register", skip(self, capabilities))]
    pub fn register(&self, id: &str, capabilities: impl IntoIterator<Item = String>) {
        let mut workers = self.workers.lock().expect("registry lock");
        workers.insert(
            id.to_string(),
            WorkerState {
                capabilities: capabilities.into_iter().collect(),
                health: Health::Healthy,
                in_progress: BTreeSet::new(),
                cached_blobs: BTreeSet::new(),
                last_heartbeat: Instant::now(),
                successes: 0,
                failures: 0,
                blacklisted_until: None,
                blacklist_backoff: self.config.blacklist_initial,
            },
        );
        debug!(id, "worker registered");
    }

    /// Record a heartbeat, walking health back toward `Healthy`.
    pub fn heartbeat(&self, id: &str) {
        let mut workers = self.workers.lock().expect("registry lock");
        if let Some(worker) = workers.get_mut(id) {
            worker.last_heartbeat = Instant::now();
            worker.health = worker.health.recover();
        }
    }

    /// Sweep for missed heartbeats, degrading health one step per sweep
    /// past the timeout. Returns the actions reclaimed from workers that
    /// reached `Failed` this sweep.
    #[instrument(name = "WorkerRegistry::sweep", skip(self))]
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let mut reclaimed = Vec::new();
        let mut workers = self.workers.lock().expect("registry lock");

        for (id, worker) in workers.iter_mut() {
            if worker.health == Health::Failed {
                continue;
            }
            if now.duration_since(worker.last_heartbeat) <= self.config.heartbeat_timeout {
                continue;
            }

            worker.health = worker.health.degrade();
            debug!(id, health = ?worker.health, "worker missed heartbeats");
            if worker.health == Health::Failed {
                reclaimed.extend(Self::fail_locked(id, worker, self.config.blacklist_max));
            }
        }
        reclaimed
    }

    /// Mark a worker failed immediately (e.g. a connection refused),
    /// returning its in-progress actions for reassignment.
    #[instrument(name = "WorkerRegistry::mark_failed", skip(self))]
    pub fn mark_failed(&self, id: &str) -> Vec<String> {
        let mut workers = self.workers.lock().expect("registry lock");
        match workers.get_mut(id) {
            Some(worker) => {
                worker.health = Health::Failed;
                Self::fail_locked(id, worker, self.config.blacklist_max)
            }
            None => Vec::new(),
        }
    }

    fn fail_locked(id: &str, worker: &mut WorkerState, cap: Duration) -> Vec<String> {
        let reclaimed = std::mem::take(&mut worker.in_progress)
            .into_iter()
            .collect::<Vec<_>>();
        worker.blacklisted_until = Some(Instant::now() + worker.blacklist_backoff);
        worker.blacklist_backoff = (worker.blacklist_backoff * 2).min(cap);
        warn!(
            id,
            reassigned = reclaimed.len(),
            backoff = ?worker.blacklist_backoff,
            "worker failed, reassigning its actions"
        );
        reclaimed
    }

    /// Record that an action was dispatched to a worker, with the blob
    /// digests it will materialize (feeding affinity).
    pub fn record_dispatch(
        &self,
        id: &str,
        action: &str,
        blobs: impl IntoIterator<Item = String>,
    ) {
        let mut workers = self.workers.lock().expect("registry lock");
        if let Some(worker) = workers.get_mut(id) {
            worker.in_progress.insert(action.to_string());
            worker.cached_blobs.extend(blobs);
        }
    }

    /// Record an action's completion on a worker.
    pub fn record_result(&self, id: &str, action: &str, ok: bool) {
        let mut workers = self.workers.lock().expect("registry lock");
        if let Some(worker) = workers.get_mut(id) {
            worker.in_progress.remove(action);
            if ok {
                worker.successes += 1;
            } else {
                worker.failures += 1;
            }
        }
    }

    /// Current health of a worker.
    pub fn health(&self, id: &str) -> Option<Health> {
        self.workers
            .lock()
            .expect("registry lock")
            .get(id)
            .map(|worker| worker.health)
    }

    /// Pick a worker for an action.
    ///
    /// Eligibility requires non-failed health, an expired (or absent)
    /// blacklist, and every required capability. `input_blobs` feeds the
    /// affinity strategy.
    #[instrument(name = "WorkerRegistry::select", skip_all)]
    pub fn select(
        &self,
        strategy: Strategy,
        required: &BTreeSet<String>,
        input_blobs: &BTreeSet<String>,
    ) -> Option<String> {
        let now = Instant::now();
        let workers = self.workers.lock().expect("registry lock");

        let mut eligible = workers
            .iter()
            .filter(|(_, worker)| worker.health != Health::Failed)
            .filter(|(_, worker)| {
                worker
                    .blacklisted_until
                    .map(|until| until <= now)
                    .unwrap_or(true)
            })
            .filter(|(_, worker)| required.is_subset(&worker.capabilities))
            .collect::<Vec<_>>();
        if eligible.is_empty() {
            return None;
        }
        // Deterministic base order so strategies are stable under ties.
        eligible.sort_by(|(a, _), (b, _)| a.cmp(b));

        let chosen = match strategy {
            Strategy::RoundRobin => {
                let cursor = self.round_robin.fetch_add(1, Ordering::Relaxed);
                eligible[cursor % eligible.len()].0
            }
            Strategy::LeastLoaded => {
                eligible
                    .iter()
                    .min_by_key(|(_, worker)| worker.in_progress.len())
                    .expect("non-empty eligible set")
                    .0
            }
            Strategy::Affinity => {
                eligible
                    .iter()
                    .max_by_key(|(_, worker)| {
                        worker.cached_blobs.intersection(input_blobs).count()
                    })
                    .expect("non-empty eligible set")
                    .0
            }
            Strategy::PriorityWeighted => {
                eligible
                    .iter()
                    .max_by(|(_, a), (_, b)| {
                        weighted_score(a)
                            .partial_cmp(&weighted_score(b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .expect("non-empty eligible set")
                    .0
            }
        };
        Some(chosen.clone())
    }
}

fn weighted_score(worker: &WorkerState) -> f64 {
    let total = worker.successes + worker.failures;
    let success_rate = if total == 0 {
        // No history: neutral.
        0.5
    } else {
        worker.successes as f64 / total as f64
    };
    worker.health.score() * (1.0 / (1.0 + worker.in_progress.len() as f64)) * success_rate
}
