//! Scheduling and execution.
//!
//! The scheduler hands actions to a fixed pool of worker threads through
//! per-worker, per-priority Chase–Lev deques: owners push and pop the
//! bottom for locality, idle workers steal the top. The executor drives
//! one action at a time per worker (cache consult, sandboxed spawn,
//! output capture, cache record) with category-aware retry and adaptive
//! budgets for flaky tests.

mod cancel;
mod deque;
mod executor;
mod flaky;
mod retry;
mod scheduler;

pub use cancel::CancelToken;
pub use deque::{Steal, Stealer, Worker};
pub use executor::{ExecutionReport, Executor};
pub use flaky::{Confidence, FlakyTracker};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use scheduler::{Scheduler, WorkerQueue};
