//! Slot accounting for the task manager.
//!
//! Every counter lives in one owned struct and is mutated only with atomics,
//! so several managers can coexist in one process (and in one test binary).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::priority::TrackerPriority;

#[derive(Debug, Default)]
struct LevelCounter {
    active: AtomicI64,
    reserved: AtomicI64,
}

/// Snapshot of one priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelStatistics {
    pub level: usize,
    pub active: i64,
    pub reserved: i64,
    pub available: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityStatistics {
    pub max_concurrent: i64,
    pub available: i64,
    pub active: i64,
    pub internal_active: i64,
    pub killed_active: i64,
    pub killed_total: u64,
    pub killed_returned: u64,
    pub overload_max: i64,
    pub last_process_slot: u64,
    pub levels: Vec<LevelStatistics>,
}

/// Concurrency budget across priority levels.
///
/// `active` counts every admitted tracker. Internal trackers and killed
/// trackers are subtracted before comparing against the ceiling, so neither
/// housekeeping nor abandoned executions block new admissions.
#[derive(Debug)]
pub struct TaskAvailability {
    levels: Vec<LevelCounter>,
    max_concurrent: AtomicI64,
    overload_max: AtomicI64,
    active: AtomicI64,
    internal_active: AtomicI64,
    killed_active: AtomicI64,
    killed_total: AtomicU64,
    killed_returned: AtomicU64,
    process_slot: AtomicU64,
}

impl TaskAvailability {
    pub fn new(priority_levels: usize, max_concurrent: usize) -> Self {
        Self {
            levels: (0..priority_levels).map(|_| LevelCounter::default()).collect(),
            max_concurrent: AtomicI64::new(max_concurrent as i64),
            overload_max: AtomicI64::new(0),
            active: AtomicI64::new(0),
            internal_active: AtomicI64::new(0),
            killed_active: AtomicI64::new(0),
            killed_total: AtomicU64::new(0),
            killed_returned: AtomicU64::new(0),
            process_slot: AtomicU64::new(0),
        }
    }

    pub fn priority_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn max_concurrent(&self) -> i64 {
        self.max_concurrent.load(Ordering::Acquire)
    }

    pub fn set_max_concurrent(&self, max: usize) {
        self.max_concurrent.store(max as i64, Ordering::Release);
    }

    pub fn overload_max(&self) -> i64 {
        self.overload_max.load(Ordering::Acquire)
    }

    pub fn set_overload_max(&self, max: usize) {
        self.overload_max.store(max as i64, Ordering::Release);
    }

    /// Admit a tracker and return its process slot ordinal.
    pub fn increment(&self, priority: TrackerPriority) -> u64 {
        self.active.fetch_add(1, Ordering::AcqRel);
        match priority {
            TrackerPriority::Internal => {
                self.internal_active.fetch_add(1, Ordering::AcqRel);
            }
            TrackerPriority::Level(l) => {
                if let Some(level) = self.levels.get(l) {
                    level.active.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
        self.process_slot.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release a tracker's slot.
    ///
    /// A killed level tracker already gave its level slot back in
    /// [`kill`](Self::kill); here it only leaves the killed count. Unless
    /// `force` is set, the release is also recorded as killed-but-returned.
    pub fn decrement(&self, priority: TrackerPriority, killed: bool, force: bool) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        match priority {
            TrackerPriority::Internal => {
                self.internal_active.fetch_sub(1, Ordering::AcqRel);
            }
            TrackerPriority::Level(l) => {
                if killed {
                    self.killed_active.fetch_sub(1, Ordering::AcqRel);
                } else if let Some(level) = self.levels.get(l) {
                    level.active.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        if killed && !force {
            self.killed_returned.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Reclaim the slot of an overrunning tracker without waiting for it.
    pub fn kill(&self, priority: TrackerPriority) {
        self.killed_total.fetch_add(1, Ordering::AcqRel);
        if let TrackerPriority::Level(l) = priority {
            self.killed_active.fetch_add(1, Ordering::AcqRel);
            if let Some(level) = self.levels.get(l) {
                level.active.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Free external slots: `max - (active - internal - killed)`.
    pub fn count(&self) -> i64 {
        let active = self.active.load(Ordering::Acquire);
        let internal = self.internal_active.load(Ordering::Acquire);
        let killed = self.killed_active.load(Ordering::Acquire);
        self.max_concurrent() - (active - internal - killed)
    }

    /// External trackers currently holding a slot.
    pub fn external_active(&self) -> i64 {
        self.max_concurrent() - self.count()
    }

    /// Reserve a floor of `slots` for `level`. Returns false for an unknown
    /// level or a negative count.
    pub fn bulkhead_reserve(&self, level: usize, slots: i64) -> bool {
        if slots < 0 {
            return false;
        }
        match self.levels.get(level) {
            Some(counter) => {
                counter.reserved.store(slots, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Slots a tracker of `level` may take right now: the free count minus
    /// whatever other levels still hold in unused reservations.
    ///
    /// The top level may also run into the overload budget above the ceiling.
    pub fn level_available(&self, level: usize) -> i64 {
        if level >= self.levels.len() {
            return 0;
        }
        let held_back: i64 = self
            .levels
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != level)
            .map(|(_, c)| {
                let reserved = c.reserved.load(Ordering::Acquire);
                let active = c.active.load(Ordering::Acquire);
                (reserved - active).max(0)
            })
            .sum();
        let overload = if level + 1 == self.levels.len() {
            self.overload_max().max(0)
        } else {
            0
        };
        (self.count() + overload - held_back).max(0)
    }

    pub fn level(&self, level: usize) -> Option<LevelStatistics> {
        let counter = self.levels.get(level)?;
        Some(LevelStatistics {
            level,
            active: counter.active.load(Ordering::Acquire),
            reserved: counter.reserved.load(Ordering::Acquire),
            available: self.level_available(level),
        })
    }

    pub fn statistics(&self) -> AvailabilityStatistics {
        AvailabilityStatistics {
            max_concurrent: self.max_concurrent(),
            available: self.count(),
            active: self.active.load(Ordering::Acquire),
            internal_active: self.internal_active.load(Ordering::Acquire),
            killed_active: self.killed_active.load(Ordering::Acquire),
            killed_total: self.killed_total.load(Ordering::Acquire),
            killed_returned: self.killed_returned.load(Ordering::Acquire),
            overload_max: self.overload_max(),
            last_process_slot: self.process_slot.load(Ordering::Acquire),
            levels: (0..self.levels.len()).filter_map(|l| self.level(l)).collect(),
        }
    }
}
