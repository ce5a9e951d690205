use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::TaskError;
use crate::process::{ManagedProcess, ProcessScope};
use crate::schedule::{Schedule, ScheduleStatistics};
use crate::tracker::{TaskTracker, TrackerKind};

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatistics {
    pub registered: usize,
    pub submitted: u64,
    pub schedules: Vec<ScheduleStatistics>,
}

/// Owns the registered schedules and submits the due ones each cycle.
#[derive(Default)]
pub struct SchedulerContainer {
    schedules: RwLock<Vec<Arc<Schedule>>>,
    submitted: AtomicU64,
}

impl SchedulerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schedule: Arc<Schedule>) {
        info!(schedule = schedule.name(), id = %schedule.id(), "registered schedule");
        self.schedules.write().push(schedule);
    }

    pub fn unregister(&self, id: Uuid) -> Option<Arc<Schedule>> {
        let mut schedules = self.schedules.write();
        let idx = schedules.iter().position(|s| s.id() == id)?;
        let removed = schedules.remove(idx);
        info!(schedule = removed.name(), %id, "unregistered schedule");
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.schedules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.read().is_empty()
    }

    /// Start every schedule due at `now`. Schedules still running from a
    /// previous start are skipped and counted.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Arc<Schedule>> {
        let snapshot: Vec<Arc<Schedule>> = self.schedules.read().clone();
        snapshot
            .into_iter()
            .filter(|s| s.next_execute_time().is_some_and(|next| next <= now))
            .filter(|s| {
                let started = s.start();
                if !started {
                    debug!(schedule = s.name(), "schedule still active, skipping");
                }
                started
            })
            .collect()
    }

    /// Tracker that runs one started schedule and stops it on completion.
    pub fn tracker(schedule: Arc<Schedule>) -> TaskTracker {
        let run = Arc::clone(&schedule);
        let done = Arc::clone(&schedule);
        let mut tracker = TaskTracker::new(
            schedule.name(),
            TrackerKind::Schedule,
            schedule.priority(),
            move |cancel| run.execute(cancel),
        )
        .on_complete(move |outcome| done.stop(&outcome.result));
        if schedule.is_long_running() {
            tracker = tracker.long_running();
        }
        if let Some(limit) = schedule.max_processing_time() {
            tracker = tracker.with_max_processing_time(limit);
        }
        tracker
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let schedules = self.schedules.read();
        SchedulerStatistics {
            registered: schedules.len(),
            submitted: self.submitted.load(Ordering::Relaxed),
            schedules: schedules.iter().map(|s| s.statistics()).collect(),
        }
    }
}

impl ManagedProcess for SchedulerContainer {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn process(&self, scope: &ProcessScope<'_>) -> Result<(), TaskError> {
        for schedule in self.due(scope.now) {
            self.submitted.fetch_add(1, Ordering::Relaxed);
            scope.submit(Self::tracker(schedule));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Frequency;
    use std::time::Duration;

    fn schedule(name: &str) -> Arc<Schedule> {
        Arc::new(Schedule::new(
            name,
            Frequency::Every(Duration::from_secs(10)),
            |_| async { Ok(()) },
        ))
    }

    #[test]
    fn due_starts_each_schedule_once() {
        let c = SchedulerContainer::new();
        let s = schedule("a");
        c.register(Arc::clone(&s));

        let now = Utc::now();
        assert_eq!(c.due(now).len(), 1);
        assert!(s.is_active());
        // Still active: skipped, not restarted.
        assert!(c.due(now + chrono::Duration::seconds(11)).is_empty());
        assert_eq!(s.statistics().skip_count, 1);
    }

    #[test]
    fn unregister_removes_schedule() {
        let c = SchedulerContainer::new();
        let s = schedule("gone");
        c.register(Arc::clone(&s));
        assert!(c.unregister(s.id()).is_some());
        assert!(c.unregister(s.id()).is_none());
        assert!(c.is_empty());
    }
}
