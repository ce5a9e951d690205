use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use stellwerk_core::LogLevel;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::process::ProcessScope;
use crate::tracker::{CompleteFn, TaskTracker, TrackerOutcome};

use super::core::{ActiveTracker, Shared, TaskSubmitter};

impl Shared {
    /// Admit a tracker and spawn its body.
    pub(super) fn execute(self: &Arc<Self>, mut tracker: TaskTracker) {
        let process_slot = self.availability.increment(tracker.priority);
        let max_processing_time = if tracker.is_long_running {
            None
        } else {
            Some(
                tracker
                    .max_processing_time
                    .unwrap_or_else(|| self.policy.default_max_processing_time()),
            )
        };
        let started = Instant::now();
        self.active.insert(
            tracker.id,
            ActiveTracker {
                name: tracker.name.clone(),
                kind: tracker.kind,
                priority: tracker.priority,
                process_slot,
                started,
                max_processing_time,
                cancel: tracker.cancel.clone(),
                cancelled_at: None,
                killed: false,
            },
        );

        let execute = tracker.execute.take();
        let on_complete = tracker.on_complete.take();
        let token = tracker.cancel.clone();
        let shared = Arc::clone(self);
        debug!(tracker = %tracker.name, priority = %tracker.priority, process_slot, "executing tracker");

        tokio::spawn(async move {
            let body = async move {
                match execute {
                    Some(f) => f(token).await,
                    None => Ok(()),
                }
            };
            let result = AssertUnwindSafe(body)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))));

            let outcome = TrackerOutcome {
                id: tracker.id,
                name: tracker.name,
                kind: tracker.kind,
                priority: tracker.priority,
                process_slot,
                result,
                duration: started.elapsed(),
                cancelled: false,
                killed: false,
            };
            shared.complete(outcome, on_complete);
        });
    }

    /// Release the slot of a finished tracker and report its outcome.
    fn complete(&self, mut outcome: TrackerOutcome, on_complete: Option<CompleteFn>) {
        // Removal takes the same shard lock the overrun check kills under, so
        // a tracker is either released as killed or as live, never both.
        if let Some((_, active)) = self.active.remove(&outcome.id) {
            outcome.cancelled = active.cancelled_at.is_some();
            outcome.killed = active.killed;
        }
        self.availability
            .decrement(outcome.priority, outcome.killed, false);

        match &outcome.result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.collector
                    .log_exception(&format!("tracker {} ({})", outcome.name, outcome.kind), e);
            }
        }
        if outcome.killed {
            info!(tracker = %outcome.name, elapsed = ?outcome.duration, "killed tracker returned");
        }
        self.metrics.lock().record(&outcome);

        if let Some(callback) = on_complete {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err() {
                self.collector.log_message(
                    LogLevel::Error,
                    &format!("completion callback for tracker {} panicked", outcome.name),
                );
            }
        }
        self.wake.notify_one();
    }

    /// Settle a tracker that never ran: its completion sees `Cancelled`.
    ///
    /// No slot was taken, so availability is left alone.
    pub(super) fn discard(&self, mut tracker: TaskTracker) {
        tracker.cancel.cancel();
        let Some(callback) = tracker.on_complete.take() else {
            return;
        };
        let outcome = TrackerOutcome {
            id: tracker.id,
            name: tracker.name,
            kind: tracker.kind,
            priority: tracker.priority,
            process_slot: 0,
            result: Err(TaskError::Cancelled),
            duration: tracker.created_at.elapsed(),
            cancelled: true,
            killed: false,
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err() {
            self.collector.log_message(
                LogLevel::Error,
                &format!("completion callback for tracker {} panicked", outcome.name),
            );
        }
    }

    pub(super) async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let poll = self.policy.loop_poll_interval();
        info!(?poll, "task loop running");
        loop {
            if std::panic::catch_unwind(AssertUnwindSafe(|| self.cycle())).is_err() {
                self.counters.loop_errors.fetch_add(1, Ordering::Relaxed);
                error!("task loop cycle panicked, continuing");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
        info!("task loop exited");
    }

    /// One pass: reclaim overruns, fill free slots, drive processes.
    pub(super) fn cycle(self: &Arc<Self>) {
        self.check_overruns(Instant::now());
        self.dequeue();
        self.run_processes();
    }

    /// Drain queued trackers, highest level first, while the level has room.
    fn dequeue(self: &Arc<Self>) {
        let levels = self.availability.priority_levels();
        for level in (0..levels).rev() {
            loop {
                if self.availability.level_available(level) <= 0 {
                    break;
                }
                let Some(tracker) = self.queue.lock().pop(level) else {
                    break;
                };
                self.execute(tracker);
            }
        }
    }

    fn run_processes(self: &Arc<Self>) {
        let processes = self.processes.read().clone();
        if processes.is_empty() {
            return;
        }
        let submitter = TaskSubmitter {
            shared: Arc::clone(self),
        };
        let scope = ProcessScope::new(&self.availability, &submitter);
        for process in processes {
            match std::panic::catch_unwind(AssertUnwindSafe(|| process.process(&scope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.counters.loop_errors.fetch_add(1, Ordering::Relaxed);
                    self.collector
                        .log_exception(&format!("process {}", process.name()), &e);
                }
                Err(panic) => {
                    self.counters.loop_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        process = process.name(),
                        panic = %panic_message(&*panic),
                        "process panicked"
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
