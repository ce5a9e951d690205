use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::autotune::AutotuneStatistics;
use crate::availability::AvailabilityStatistics;
use crate::tracker::{TrackerKind, TrackerOutcome};

/// Per-kind execution counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskMetrics {
    pub executed: HashMap<TrackerKind, u64>,
    pub failed: HashMap<TrackerKind, u64>,
    pub avg_duration: HashMap<TrackerKind, Duration>,
    pub last_run: HashMap<TrackerKind, DateTime<Utc>>,
}

impl TaskMetrics {
    pub fn record(&mut self, outcome: &TrackerOutcome) {
        let kind = outcome.kind;
        let count = {
            let c = self.executed.entry(kind).or_default();
            *c += 1;
            *c
        };
        if outcome.result.is_err() {
            *self.failed.entry(kind).or_default() += 1;
        }
        self.last_run.insert(kind, Utc::now());

        let prev_avg = self.avg_duration.get(&kind).copied().unwrap_or_default();
        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            outcome.duration
        } else {
            let prev = prev_avg.as_nanos() as f64;
            let cur = outcome.duration.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / count as f64) as u64)
        };
        self.avg_duration.insert(kind, new_avg);
    }
}

/// One in-flight tracker, for debugging stuck work.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTrackerStatistics {
    pub name: String,
    pub kind: TrackerKind,
    pub priority: String,
    pub process_slot: u64,
    pub running_ms: u128,
    pub cancelled: bool,
    pub killed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskManagerStatistics {
    pub running: bool,
    pub availability: AvailabilityStatistics,
    pub queued: Vec<usize>,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub killed: u64,
    pub loop_errors: u64,
    pub processes: Vec<String>,
    pub active: Vec<ActiveTrackerStatistics>,
    pub metrics: TaskMetrics,
    pub autotune: Option<AutotuneStatistics>,
}
