use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use stellwerk_core::{DataCollector, TracingCollector};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::autotune::Autotune;
use crate::availability::TaskAvailability;
use crate::cpu::{CpuSampler, SystemCpuSampler};
use crate::error::TaskError;
use crate::policy::TaskManagerPolicy;
use crate::priority::TrackerPriority;
use crate::process::ManagedProcess;
use crate::queue::LevelQueues;
use crate::statistics::{ActiveTrackerStatistics, TaskManagerStatistics, TaskMetrics};
use crate::tracker::{TaskTracker, TrackerKind};

/// Bookkeeping for one executing tracker.
pub(super) struct ActiveTracker {
    pub name: String,
    pub kind: TrackerKind,
    pub priority: TrackerPriority,
    pub process_slot: u64,
    pub started: Instant,
    /// `None` for long-running trackers.
    pub max_processing_time: Option<Duration>,
    pub cancel: CancellationToken,
    pub cancelled_at: Option<Instant>,
    pub killed: bool,
}

#[derive(Default)]
pub(super) struct Counters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub killed: AtomicU64,
    pub loop_errors: AtomicU64,
}

/// State shared between the manager handle, the loop task, submitters and
/// executing trackers.
pub(super) struct Shared {
    pub policy: TaskManagerPolicy,
    pub availability: Arc<TaskAvailability>,
    pub queue: Mutex<LevelQueues>,
    pub active: DashMap<Uuid, ActiveTracker>,
    pub processes: RwLock<Vec<Arc<dyn ManagedProcess>>>,
    pub autotune: RwLock<Option<Arc<Autotune>>>,
    pub wake: Notify,
    pub collector: Arc<dyn DataCollector>,
    pub counters: Counters,
    pub metrics: Mutex<TaskMetrics>,
    pub running: AtomicBool,
}

/// Cloneable handle for submitting trackers from anywhere.
#[derive(Clone)]
pub struct TaskSubmitter {
    pub(super) shared: Arc<Shared>,
}

impl TaskSubmitter {
    /// Internal trackers execute immediately. Level trackers are queued and
    /// the loop is woken to admit them.
    pub fn execute_or_enqueue(&self, mut tracker: TaskTracker) {
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        match tracker.priority {
            TrackerPriority::Internal => self.shared.execute(tracker),
            TrackerPriority::Level(level) => {
                let top = self.shared.availability.priority_levels().saturating_sub(1);
                let level = level.min(top);
                tracker.priority = TrackerPriority::Level(level);
                self.shared.queue.lock().push(level, tracker);
                self.shared.wake.notify_one();
            }
        }
    }

    pub fn availability(&self) -> &TaskAvailability {
        &self.shared.availability
    }
}

/// Bounded cooperative scheduler.
///
/// One loop task owns every admission decision. Tracker bodies run on the
/// tokio runtime in parallel.
pub struct TaskManager {
    shared: Arc<Shared>,
    shutdown: Mutex<CancellationToken>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(policy: TaskManagerPolicy) -> Result<Self, TaskError> {
        Self::with_collector(policy, Arc::new(TracingCollector))
    }

    pub fn with_collector(
        policy: TaskManagerPolicy,
        collector: Arc<dyn DataCollector>,
    ) -> Result<Self, TaskError> {
        policy.validate()?;
        let availability = Arc::new(TaskAvailability::new(
            policy.priority_levels,
            policy.resolved_max_concurrent(),
        ));
        for reservation in &policy.bulkhead {
            if !availability.bulkhead_reserve(reservation.level, reservation.slots as i64) {
                return Err(TaskError::InvalidLevel {
                    level: reservation.level,
                    levels: policy.priority_levels,
                });
            }
        }
        let autotune_enabled = policy.autotune.enabled;
        let manager = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(LevelQueues::new(policy.priority_levels)),
                policy,
                availability,
                active: DashMap::new(),
                processes: RwLock::new(Vec::new()),
                autotune: RwLock::new(None),
                wake: Notify::new(),
                collector,
                counters: Counters::default(),
                metrics: Mutex::new(TaskMetrics::default()),
                running: AtomicBool::new(false),
            }),
            shutdown: Mutex::new(CancellationToken::new()),
            loop_handle: Mutex::new(None),
        };
        if autotune_enabled {
            manager.enable_autotune(Box::new(SystemCpuSampler::new()));
        }
        Ok(manager)
    }

    pub fn policy(&self) -> &TaskManagerPolicy {
        &self.shared.policy
    }

    pub fn availability(&self) -> Arc<TaskAvailability> {
        Arc::clone(&self.shared.availability)
    }

    pub fn submitter(&self) -> TaskSubmitter {
        TaskSubmitter {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn execute_or_enqueue(&self, tracker: TaskTracker) {
        self.submitter().execute_or_enqueue(tracker);
    }

    /// Register a process to run on every loop cycle.
    pub fn register_process(&self, process: Arc<dyn ManagedProcess>) {
        info!(process = process.name(), priority = process.priority(), "registered process");
        let mut processes = self.shared.processes.write();
        processes.push(process);
        processes.sort_by_key(|p| std::cmp::Reverse(p.priority()));
    }

    /// Install (or replace) the CPU autotuner with the given sampler.
    pub fn enable_autotune(&self, sampler: Box<dyn CpuSampler>) {
        let autotune = Arc::new(Autotune::new(&self.shared.policy, sampler));
        let previous = self.shared.autotune.write().replace(Arc::clone(&autotune));
        if let Some(previous) = previous {
            let previous: Arc<dyn ManagedProcess> = previous;
            self.shared
                .processes
                .write()
                .retain(|p| !Arc::ptr_eq(p, &previous));
        }
        self.register_process(autotune);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Spawn the loop task. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), TaskError> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(TaskError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.run_loop(token).await });
        *self.loop_handle.lock() = Some(handle);
        info!(
            max_concurrent = self.shared.availability.max_concurrent(),
            levels = self.shared.policy.priority_levels,
            "task manager started"
        );
        Ok(())
    }

    /// Stop the loop and signal cancellation to every executing tracker.
    /// Queued trackers are dropped; their completions see `Cancelled`.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.lock().cancel();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for entry in self.shared.active.iter() {
            entry.cancel.cancel();
        }
        let queued = self.shared.queue.lock().drain();
        let dropped = queued.len();
        for tracker in queued {
            self.shared.discard(tracker);
        }
        info!(dropped, "task manager stopped");
    }

    /// Run one loop cycle on the caller: overrun check, dequeue, processes.
    pub fn process_once(&self) {
        self.shared.cycle();
    }

    pub fn statistics(&self) -> TaskManagerStatistics {
        let shared = &self.shared;
        let now = Instant::now();
        let active = shared
            .active
            .iter()
            .map(|entry| ActiveTrackerStatistics {
                name: entry.name.clone(),
                kind: entry.kind,
                priority: entry.priority.to_string(),
                process_slot: entry.process_slot,
                running_ms: now.saturating_duration_since(entry.started).as_millis(),
                cancelled: entry.cancelled_at.is_some(),
                killed: entry.killed,
            })
            .collect();
        let c = &shared.counters;
        TaskManagerStatistics {
            running: self.is_running(),
            availability: shared.availability.statistics(),
            queued: shared.queue.lock().depths(),
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            killed: c.killed.load(Ordering::Relaxed),
            loop_errors: c.loop_errors.load(Ordering::Relaxed),
            processes: shared
                .processes
                .read()
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
            active,
            metrics: shared.metrics.lock().clone(),
            autotune: shared.autotune.read().as_ref().map(|a| a.statistics()),
        }
    }
}
