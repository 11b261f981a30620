//! The work-stealing scheduler.
//!
//! Every worker owns one Chase–Lev deque per priority class and drains
//! higher classes first. New work lands on the producing worker's own
//! deque (LIFO, warm caches); the global injector seeds the initial wave
//! and accepts work from outside the pool. Idle workers scan the other
//! workers from a random starting offset (randomization breaks convoys)
//! and park on a condvar when there is provably nothing to take.
//!
//! Ordering guarantees are exactly the DAG's: nothing here preserves FIFO
//! across workers, and sibling actions may run in any order.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use rand::Rng;
use tracing::trace;

use crate::{
    action::Priority,
    exec::{
        CancelToken,
        deque::{Steal, Stealer, Worker},
    },
};

const PRIORITY_CLASSES: usize = 4;

/// How long a parked worker sleeps before rescanning. Bounds the window of
/// a lost wakeup race between a lock-free push and the condvar.
const PARK_TIMEOUT: Duration = Duration::from_millis(20);

/// Initial capacity of each per-worker deque.
const DEQUE_CAPACITY: usize = 64;

struct Shared {
    /// `stealers[worker][priority]`.
    stealers: Vec<[Stealer<u32>; PRIORITY_CLASSES]>,
    /// Global overflow and seed queues, one per priority class.
    injector: [Mutex<VecDeque<u32>>; PRIORITY_CLASSES],
    sleep: Mutex<()>,
    wakeup: Condvar,
    parked: AtomicUsize,
    shutdown: AtomicBool,
}

impl Shared {
    fn wake_one(&self) {
        if self.parked.load(Ordering::Acquire) > 0 {
            self.wakeup.notify_one();
        }
    }

    fn wake_all(&self) {
        self.wakeup.notify_all();
    }
}

/// Shared scheduler handle: inject work, observe, shut down.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// One worker's private side of the scheduler.
pub struct WorkerQueue {
    index: usize,
    deques: [Worker<u32>; PRIORITY_CLASSES],
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a scheduler and the per-worker queues for `workers` threads.
    pub fn new(workers: usize) -> (Self, Vec<WorkerQueue>) {
        assert!(workers > 0, "scheduler needs at least one worker");

        let deques: Vec<[Worker<u32>; PRIORITY_CLASSES]> = (0..workers)
            .map(|_| std::array::from_fn(|_| Worker::new(DEQUE_CAPACITY)))
            .collect();
        let stealers = deques
            .iter()
            .map(|per_priority| std::array::from_fn(|p| per_priority[p].stealer()))
            .collect();

        let shared = Arc::new(Shared {
            stealers,
            injector: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            sleep: Mutex::new(()),
            wakeup: Condvar::new(),
            parked: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let queues = deques
            .into_iter()
            .enumerate()
            .map(|(index, deques)| WorkerQueue {
                index,
                deques,
                shared: Arc::clone(&shared),
            })
            .collect();

        (Self { shared }, queues)
    }

    /// Push work onto the global injector.
    pub fn inject(&self, task: u32, priority: Priority) {
        self.shared.injector[priority.index()]
            .lock()
            .expect("injector lock")
            .push_back(task);
        self.shared.wake_one();
    }

    /// Stop the pool: workers drain nothing further and return `None`.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_all();
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl WorkerQueue {
    /// This worker's index in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Push work onto this worker's own deque (bottom: next to pop).
    pub fn push(&self, task: u32, priority: Priority) {
        self.deques[priority.index()].push(task);
        self.shared.wake_one();
    }

    /// Take the next task, blocking until work arrives, the token cancels,
    /// or the scheduler shuts down.
    ///
    /// Drain order: own deques (highest class first), then the injector,
    /// then stealing, so a worker always prefers its own recent work and
    /// a stealer always takes the highest class available.
    pub fn next(&self, cancel: &CancelToken) -> Option<(u32, Priority)> {
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) || cancel.cancelled() {
                return None;
            }

            for priority in Priority::DESCENDING {
                if let Some(task) = self.deques[priority.index()].pop() {
                    return Some((task, priority));
                }
            }

            for priority in Priority::DESCENDING {
                let task = self.shared.injector[priority.index()]
                    .lock()
                    .expect("injector lock")
                    .pop_front();
                if let Some(task) = task {
                    return Some((task, priority));
                }
            }

            match self.try_steal() {
                StealOutcome::Taken(task, priority) => return Some((task, priority)),
                StealOutcome::Contended => {
                    // Someone has work but we lost the race; spin, don't park.
                    std::hint::spin_loop();
                    continue;
                }
                StealOutcome::Empty => self.park(),
            }
        }
    }

    /// Scan the other workers from a random offset, taking the highest
    /// priority class available anywhere.
    fn try_steal(&self) -> StealOutcome {
        let workers = self.shared.stealers.len();
        if workers <= 1 {
            return StealOutcome::Empty;
        }

        let offset = rand::thread_rng().gen_range(0..workers);
        let mut contended = false;

        for priority in Priority::DESCENDING {
            for step in 0..workers {
                let victim = (offset + step) % workers;
                if victim == self.index {
                    continue;
                }
                match self.shared.stealers[victim][priority.index()].steal() {
                    Steal::Success(task) => {
                        trace!(victim, worker = self.index, "stole task");
                        return StealOutcome::Taken(task, priority);
                    }
                    Steal::Retry => contended = true,
                    Steal::Empty => {}
                }
            }
        }

        if contended {
            StealOutcome::Contended
        } else {
            StealOutcome::Empty
        }
    }

    /// Park until new work might exist. The timeout bounds lost-wakeup
    /// races with lock-free pushes.
    fn park(&self) {
        self.shared.parked.fetch_add(1, Ordering::AcqRel);
        {
            let guard = self.shared.sleep.lock().expect("sleep lock");
            // Re-check under the lock so an inject racing with parking is
            // not missed entirely.
            let must_wake = self.shared.shutdown.load(Ordering::Acquire)
                || self
                    .shared
                    .injector
                    .iter()
                    .any(|queue| !queue.lock().expect("injector lock").is_empty());
            if !must_wake {
                let _ = self
                    .shared
                    .wakeup
                    .wait_timeout(guard, PARK_TIMEOUT)
                    .expect("condvar wait");
            }
        }
        self.shared.parked.fetch_sub(1, Ordering::AcqRel);
    }
}

enum StealOutcome {
    Taken(u32, Priority),
    Contended,
    Empty,
}
