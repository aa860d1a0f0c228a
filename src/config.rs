//! Tunables for the lifecycle subsystem.
//!
//! A plain injected struct; the embedding application owns where the
//! values come from. The retry backoff schedule is not configuration: it
//! belongs to the recovery policy decision.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long a filing may sit untouched in `ERI_IN_PROGRESS` before the
    /// sweeper considers it stuck.
    pub staleness_threshold: Duration,
    /// Threads draining the submission queue.
    pub worker_threads: usize,
    /// Bounded capacity of the submission queue.
    pub queue_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(600),
            worker_threads: 4,
            queue_capacity: 64,
        }
    }
}
