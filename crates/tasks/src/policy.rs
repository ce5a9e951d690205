use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Slots held back for one priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadReservation {
    pub level: usize,
    pub slots: usize,
}

/// CPU-driven concurrency tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutotunePolicy {
    #[serde(default = "default_autotune_enabled")]
    pub enabled: bool,
    /// Process CPU percentage above which concurrency is stepped down.
    #[serde(default = "default_target_cpu")]
    pub target_cpu_percent: f32,
    /// Lower bound for the overload budget: slots the top priority level
    /// may take above the ceiling.
    #[serde(default = "default_overload_min")]
    pub overload_min: usize,
    /// Upper bound for the overload budget.
    #[serde(default = "default_overload_max")]
    pub overload_max: usize,
}

fn default_autotune_enabled() -> bool { false }
fn default_target_cpu() -> f32 { 75.0 }
fn default_overload_min() -> usize { 1 }
fn default_overload_max() -> usize { 8 }

impl Default for AutotunePolicy {
    fn default() -> Self {
        Self {
            enabled: default_autotune_enabled(),
            target_cpu_percent: default_target_cpu(),
            overload_min: default_overload_min(),
            overload_max: default_overload_max(),
        }
    }
}

/// Task manager configuration, typically parsed from the `[tasks]` TOML section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagerPolicy {
    /// Number of external priority levels. Level `n - 1` drains first.
    #[serde(default = "default_priority_levels")]
    pub priority_levels: usize,
    /// Upper bound on concurrently executing external trackers. 0 = 4 per core.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Floor the autotuner never goes below. 0 = 1 per core.
    #[serde(default = "default_min_concurrent")]
    pub min_concurrent: usize,
    /// Upper bound on the loop's sleep between cycles.
    #[serde(default = "default_loop_poll_interval_ms")]
    pub loop_poll_interval_ms: u64,
    /// Processing budget for trackers that do not carry their own.
    #[serde(default = "default_max_processing_time_secs")]
    pub default_max_processing_time_secs: u64,
    /// Time between cancellation of an overrunning tracker and its kill.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default)]
    pub bulkhead: Vec<BulkheadReservation>,
    #[serde(default)]
    pub autotune: AutotunePolicy,
}

fn default_priority_levels() -> usize { 4 }
fn default_max_concurrent() -> usize { 0 }
fn default_min_concurrent() -> usize { 0 }
fn default_loop_poll_interval_ms() -> u64 { 100 }
fn default_max_processing_time_secs() -> u64 { 30 }
fn default_kill_grace_secs() -> u64 { 15 }

impl Default for TaskManagerPolicy {
    fn default() -> Self {
        Self {
            priority_levels: default_priority_levels(),
            max_concurrent: default_max_concurrent(),
            min_concurrent: default_min_concurrent(),
            loop_poll_interval_ms: default_loop_poll_interval_ms(),
            default_max_processing_time_secs: default_max_processing_time_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            bulkhead: Vec::new(),
            autotune: AutotunePolicy::default(),
        }
    }
}

fn cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl TaskManagerPolicy {
    /// Resolve the concurrency ceiling (0 means 4 per core).
    pub fn resolved_max_concurrent(&self) -> usize {
        if self.max_concurrent == 0 {
            cores() * 4
        } else {
            self.max_concurrent
        }
    }

    /// Resolve the autotune floor (0 means 1 per core), capped at the ceiling.
    pub fn resolved_min_concurrent(&self) -> usize {
        let min = if self.min_concurrent == 0 {
            cores()
        } else {
            self.min_concurrent
        };
        min.min(self.resolved_max_concurrent())
    }

    pub fn loop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.loop_poll_interval_ms)
    }

    pub fn default_max_processing_time(&self) -> Duration {
        Duration::from_secs(self.default_max_processing_time_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.priority_levels == 0 {
            return Err(TaskError::Config("priority_levels must be at least 1".into()));
        }
        if self.loop_poll_interval_ms == 0 {
            return Err(TaskError::Config("loop_poll_interval_ms must be positive".into()));
        }
        for reservation in &self.bulkhead {
            if reservation.level >= self.priority_levels {
                return Err(TaskError::InvalidLevel {
                    level: reservation.level,
                    levels: self.priority_levels,
                });
            }
        }
        let reserved: usize = self.bulkhead.iter().map(|r| r.slots).sum();
        if reserved > self.resolved_max_concurrent() {
            return Err(TaskError::Config(format!(
                "bulkhead reserves {reserved} slots but max_concurrent is {}",
                self.resolved_max_concurrent()
            )));
        }
        if self.autotune.overload_min > self.autotune.overload_max {
            return Err(TaskError::Config(
                "autotune.overload_min exceeds autotune.overload_max".into(),
            ));
        }
        Ok(())
    }
}
