//! Bounded cooperative task scheduling.
//!
//! A [`TaskManager`] owns a single loop task that makes every admission
//! decision: it cancels and kills overrunning trackers, drains the per-level
//! queues into free slots of [`TaskAvailability`], and drives registered
//! [`ManagedProcess`]es such as the [`SchedulerContainer`] and the autotuner.
//! Tracker bodies run in parallel on the tokio runtime.

pub mod autotune;
pub mod availability;
pub mod container;
pub mod cpu;
pub mod error;
pub mod manager;
pub mod policy;
pub mod priority;
pub mod process;
pub mod queue;
pub mod schedule;
pub mod statistics;
pub mod tracker;

pub use autotune::{Autotune, AutotuneStatistics};
pub use availability::{AvailabilityStatistics, LevelStatistics, TaskAvailability};
pub use container::{SchedulerContainer, SchedulerStatistics};
pub use cpu::{CpuSampler, FixedCpuSampler, SystemCpuSampler};
pub use error::TaskError;
pub use manager::{TaskManager, TaskSubmitter};
pub use policy::{AutotunePolicy, BulkheadReservation, TaskManagerPolicy};
pub use priority::TrackerPriority;
pub use process::{ManagedProcess, ProcessScope};
pub use schedule::{Frequency, Schedule, ScheduleContext, ScheduleFn, ScheduleStatistics};
pub use statistics::{TaskManagerStatistics, TaskMetrics};
pub use tracker::{TaskTracker, TrackerKind, TrackerOutcome};
