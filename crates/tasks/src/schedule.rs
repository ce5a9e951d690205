//! Recurring and one-shot units of work.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskError;
use crate::priority::TrackerPriority;

pub type ScheduleFn =
    Arc<dyn Fn(ScheduleContext) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// How often a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    /// Runs once, then never again.
    Once,
    Every(Duration),
    /// A fresh random interval in `[min, max]` after every run.
    Jitter { min: Duration, max: Duration },
}

impl Frequency {
    /// Interval until the next run, or `None` for one-shot schedules.
    pub fn next_interval(&self) -> Option<Duration> {
        match *self {
            Self::Once => None,
            Self::Every(d) => Some(d),
            Self::Jitter { min, max } if max > min => {
                Some(rand::thread_rng().gen_range(min..=max))
            }
            Self::Jitter { min, .. } => Some(min),
        }
    }
}

/// Handed to the schedule body on every run.
#[derive(Debug, Clone)]
pub struct ScheduleContext {
    pub schedule_id: Uuid,
    pub name: String,
    pub execution: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct ScheduleState {
    frequency: Frequency,
    active: bool,
    execution_count: u64,
    skip_count: u64,
    failure_count: u64,
    last_execute_time: Option<DateTime<Utc>>,
    next_execute_time: Option<DateTime<Utc>>,
    last_exception: Option<String>,
    suppress_recalculate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatistics {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    pub execution_count: u64,
    pub skip_count: u64,
    pub failure_count: u64,
    pub last_execute_time: Option<DateTime<Utc>>,
    pub next_execute_time: Option<DateTime<Utc>>,
    pub last_exception: Option<String>,
}

pub struct Schedule {
    id: Uuid,
    name: String,
    priority: TrackerPriority,
    is_long_running: bool,
    max_processing_time: Option<Duration>,
    execute: ScheduleFn,
    state: Mutex<ScheduleState>,
}

impl Schedule {
    /// A schedule that first runs as soon as it is polled.
    pub fn new<F, Fut>(name: impl Into<String>, frequency: Frequency, execute: F) -> Self
    where
        F: Fn(ScheduleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            priority: TrackerPriority::Internal,
            is_long_running: false,
            max_processing_time: None,
            execute: Arc::new(move |ctx: ScheduleContext| execute(ctx).boxed()),
            state: Mutex::new(ScheduleState {
                frequency,
                active: false,
                execution_count: 0,
                skip_count: 0,
                failure_count: 0,
                last_execute_time: None,
                next_execute_time: Some(Utc::now()),
                last_exception: None,
                suppress_recalculate: false,
            }),
        }
    }

    /// Delay the first run by `wait`.
    pub fn with_initial_wait(self, wait: Duration) -> Self {
        let wait = chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        self.state.lock().next_execute_time = Some(Utc::now() + wait);
        self
    }

    /// Run first at `time`.
    pub fn with_initial_time(self, time: DateTime<Utc>) -> Self {
        self.state.lock().next_execute_time = Some(time);
        self
    }

    pub fn with_priority(mut self, priority: TrackerPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_processing_time(mut self, limit: Duration) -> Self {
        self.max_processing_time = Some(limit);
        self
    }

    pub fn long_running(mut self) -> Self {
        self.is_long_running = true;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> TrackerPriority {
        self.priority
    }

    pub fn is_long_running(&self) -> bool {
        self.is_long_running
    }

    pub fn max_processing_time(&self) -> Option<Duration> {
        self.max_processing_time
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn next_execute_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().next_execute_time
    }

    pub fn set_next_execute_time(&self, time: Option<DateTime<Utc>>) {
        self.state.lock().next_execute_time = time;
    }

    /// Change the frequency; takes effect at the next recalculation.
    pub fn set_frequency(&self, frequency: Frequency) {
        self.state.lock().frequency = frequency;
    }

    /// Keep the next execute time untouched by the next [`stop`](Self::stop).
    pub fn suppress_recalculate(&self) {
        self.state.lock().suppress_recalculate = true;
    }

    pub fn should_execute(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        !state.active && state.next_execute_time.is_some_and(|next| next <= now)
    }

    /// Mark the schedule as running.
    ///
    /// Returns false if it is still running from a previous start; the
    /// overlap is counted and the next run pushed out by one interval.
    pub fn start(&self) -> bool {
        let now = Utc::now();
        let mut state = self.state.lock();
        if state.active {
            state.skip_count += 1;
            state.next_execute_time = recalculate(&state.frequency, now);
            return false;
        }
        state.active = true;
        state.execution_count += 1;
        state.last_execute_time = Some(now);
        true
    }

    /// Mark the run as finished and compute the next execute time.
    pub fn stop(&self, result: &Result<(), TaskError>) {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.active = false;
        match result {
            Ok(()) => state.last_exception = None,
            Err(e) => {
                state.failure_count += 1;
                state.last_exception = Some(e.to_string());
            }
        }
        if std::mem::take(&mut state.suppress_recalculate) {
            return;
        }
        state.next_execute_time = recalculate(&state.frequency, now);
    }

    /// Build the context for one run and invoke the body.
    pub fn execute(&self, cancel: CancellationToken) -> BoxFuture<'static, Result<(), TaskError>> {
        let ctx = ScheduleContext {
            schedule_id: self.id,
            name: self.name.clone(),
            execution: self.state.lock().execution_count,
            cancel,
        };
        (self.execute)(ctx)
    }

    pub fn statistics(&self) -> ScheduleStatistics {
        let state = self.state.lock();
        ScheduleStatistics {
            id: self.id,
            name: self.name.clone(),
            active: state.active,
            execution_count: state.execution_count,
            skip_count: state.skip_count,
            failure_count: state.failure_count,
            last_execute_time: state.last_execute_time,
            next_execute_time: state.next_execute_time,
            last_exception: state.last_exception.clone(),
        }
    }
}

fn recalculate(frequency: &Frequency, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    frequency
        .next_interval()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| now + d)
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str, frequency: Frequency) -> Schedule {
        Schedule::new(name, frequency, |_| async { Ok(()) })
    }

    #[test]
    fn next_run_is_now_plus_frequency_after_stop() {
        let s = noop("five", Frequency::Every(Duration::from_secs(5)));
        assert!(s.start());
        s.stop(&Ok(()));

        let next = s.next_execute_time().unwrap();
        let expected = Utc::now() + chrono::Duration::seconds(5);
        let drift = (expected - next).num_milliseconds().abs();
        assert!(drift < 500, "drift {drift}ms");
        assert!(!s.is_active());
    }

    #[test]
    fn active_schedule_is_skipped_not_restarted() {
        let s = noop("busy", Frequency::Every(Duration::from_secs(1)));
        assert!(s.start());
        assert!(!s.start());
        assert!(!s.start());
        let stats = s.statistics();
        assert_eq!(stats.execution_count, 1);
        assert_eq!(stats.skip_count, 2);
    }

    #[test]
    fn first_run_is_immediate_without_initial_values() {
        let s = noop("now", Frequency::Every(Duration::from_secs(60)));
        assert!(s.should_execute(Utc::now()));
    }

    #[test]
    fn initial_wait_delays_first_run() {
        let s = noop("later", Frequency::Every(Duration::from_secs(1)))
            .with_initial_wait(Duration::from_secs(30));
        assert!(!s.should_execute(Utc::now()));
        assert!(s.should_execute(Utc::now() + chrono::Duration::seconds(31)));
    }

    #[test]
    fn one_shot_never_reschedules() {
        let s = noop("once", Frequency::Once);
        assert!(s.start());
        s.stop(&Ok(()));
        assert!(s.next_execute_time().is_none());
        assert!(!s.should_execute(Utc::now() + chrono::Duration::days(1)));
    }

    #[test]
    fn failure_is_recorded_and_cleared_by_success() {
        let s = noop("flaky", Frequency::Every(Duration::from_secs(1)));
        s.start();
        s.stop(&Err(TaskError::failed("boom")));
        assert_eq!(s.statistics().failure_count, 1);
        assert!(s.statistics().last_exception.unwrap().contains("boom"));
        s.start();
        s.stop(&Ok(()));
        assert!(s.statistics().last_exception.is_none());
    }

    #[test]
    fn suppressed_recalculation_keeps_next_time() {
        let s = noop("pinned", Frequency::Every(Duration::from_secs(5)));
        let pinned = Utc::now() + chrono::Duration::hours(1);
        s.set_next_execute_time(Some(pinned));
        s.start();
        s.suppress_recalculate();
        s.stop(&Ok(()));
        assert_eq!(s.next_execute_time(), Some(pinned));
    }

    #[test]
    fn jitter_stays_in_range() {
        let f = Frequency::Jitter {
            min: Duration::from_secs(5),
            max: Duration::from_secs(15),
        };
        for _ in 0..100 {
            let d = f.next_interval().unwrap();
            assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(15));
        }
    }
}
