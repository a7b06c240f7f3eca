//! Per-run performance counters and timers.
//!
//! One [`PipelinePerformance`] is created per build run and shared (via
//! `Arc`) by every stage of that run. Values only grow within a run.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Metric names recorded by the pipeline.
pub mod metrics {
    /// Timer around each grouping run
    pub const GROUPING: &str = "grouping";
    pub const GROUPING_GROUPS: &str = "grouping.groups";
    pub const GROUPING_UIDS: &str = "grouping.uids";

    pub const LOAD: &str = "load";
    pub const ENTITIES_LOADED: &str = "load.entities";
    pub const ENTITIES_MISSING: &str = "load.missing";

    pub const TRANSLATE: &str = "translate";
    pub const DOCUMENTS_TRANSLATED: &str = "translate.documents";

    pub const ADD_DOCUMENTS: &str = "add_documents";
    pub const ADD_DOCUMENTS_CALLS: &str = "add_documents.calls";
    pub const DOCUMENTS_ADDED: &str = "documents.added";

    pub const DELETE: &str = "delete";
    pub const DOCUMENTS_DELETED: &str = "documents.deleted";
    pub const DELETE_ALL: &str = "delete_all";

    pub const COMMIT: &str = "commit";
    pub const COMMITS: &str = "commits";
    pub const OPTIMIZE: &str = "optimize";
    pub const OPTIMIZATIONS: &str = "optimizations";

    pub const GROUPS_SUCCEEDED: &str = "groups.succeeded";
    pub const GROUPS_FAILED: &str = "groups.failed";
    pub const GROUPS_TIMED_OUT: &str = "groups.timed_out";
    pub const GROUPS_RETRIED: &str = "groups.retried";

    pub const NOTIFICATIONS_FETCHED: &str = "notifications.fetched";
    pub const NOTIFICATIONS_CONSUMED: &str = "notifications.consumed";
}

/// Counters and accumulated durations for one build run.
#[derive(Debug, Default)]
pub struct PipelinePerformance {
    counters: Mutex<BTreeMap<String, u64>>,
    timers: Mutex<BTreeMap<String, Duration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PipelinePerformance {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add `by` to the counter `name`.
    pub fn increment(&self, name: &str, by: u64) {
        *lock(&self.counters).entry(name.to_string()).or_insert(0) += by;
    }

    /// Add `elapsed` to the timer `name`.
    pub fn add_duration(&self, name: &str, elapsed: Duration) {
        *lock(&self.timers).entry(name.to_string()).or_default() += elapsed;
    }

    /// Start timing `name`; the time is recorded when the guard drops,
    /// including on early return through `?`.
    pub fn start_timer<'a>(&'a self, name: &'a str) -> TimerGuard<'a> {
        TimerGuard {
            performance: self,
            name,
            started: Instant::now(),
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        lock(&self.counters).get(name).copied().unwrap_or(0)
    }

    pub fn duration(&self, name: &str) -> Duration {
        lock(&self.timers).get(name).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            counters: lock(&self.counters).clone(),
            timings_ms: lock(&self.timers)
                .iter()
                .map(|(name, d)| (name.clone(), d.as_millis() as u64))
                .collect(),
        }
    }
}

/// Records elapsed time into a [`PipelinePerformance`] timer on drop.
pub struct TimerGuard<'a> {
    performance: &'a PipelinePerformance,
    name: &'a str,
    started: Instant,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.performance
            .add_duration(self.name, self.started.elapsed());
    }
}

/// Copy of a run's metrics, attached to its build report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub timings_ms: BTreeMap<String, u64>,
}

impl PerformanceSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let perf = PipelinePerformance::new();
        perf.increment(metrics::GROUPING_GROUPS, 2);
        perf.increment(metrics::GROUPING_GROUPS, 3);
        assert_eq!(perf.counter(metrics::GROUPING_GROUPS), 5);
        assert_eq!(perf.counter("never.recorded"), 0);
    }

    #[test]
    fn test_timer_guard_records_on_drop() {
        let perf = PipelinePerformance::new();
        {
            let _timer = perf.start_timer(metrics::LOAD);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(perf.duration(metrics::LOAD) >= Duration::from_millis(2));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let perf = PipelinePerformance::new();
        perf.increment(metrics::COMMITS, 1);
        let snapshot = perf.snapshot();
        perf.increment(metrics::COMMITS, 1);

        assert_eq!(snapshot.counter(metrics::COMMITS), 1);
        assert_eq!(perf.counter(metrics::COMMITS), 2);
    }

    #[test]
    fn test_instances_are_independent() {
        let first = PipelinePerformance::new();
        let second = PipelinePerformance::new();
        first.increment(metrics::DOCUMENTS_ADDED, 10);
        assert_eq!(second.counter(metrics::DOCUMENTS_ADDED), 0);
    }
}
