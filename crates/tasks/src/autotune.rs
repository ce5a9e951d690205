use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::availability::TaskAvailability;
use crate::cpu::CpuSampler;
use crate::error::TaskError;
use crate::policy::{AutotunePolicy, TaskManagerPolicy};
use crate::process::{ManagedProcess, ProcessScope};

#[derive(Debug, Clone, Serialize)]
pub struct AutotuneStatistics {
    pub enabled: bool,
    pub target_cpu_percent: f32,
    pub last_cpu_percent: Option<f32>,
    pub min_concurrent: usize,
    pub max_concurrent: usize,
    pub increases: u64,
    pub decreases: u64,
}

/// Steps the concurrency ceiling toward a CPU target, one slot per cycle.
pub struct Autotune {
    policy: AutotunePolicy,
    min: usize,
    max: usize,
    sampler: Mutex<Box<dyn CpuSampler>>,
    last_cpu: Mutex<Option<f32>>,
    increases: AtomicU64,
    decreases: AtomicU64,
}

impl Autotune {
    pub fn new(policy: &TaskManagerPolicy, sampler: Box<dyn CpuSampler>) -> Self {
        Self {
            policy: policy.autotune.clone(),
            min: policy.resolved_min_concurrent(),
            max: policy.resolved_max_concurrent(),
            sampler: Mutex::new(sampler),
            last_cpu: Mutex::new(None),
            increases: AtomicU64::new(0),
            decreases: AtomicU64::new(0),
        }
    }

    /// Apply one tuning step for a CPU reading and return the new ceiling.
    pub fn tune(&self, cpu: f32, availability: &TaskAvailability) -> usize {
        *self.last_cpu.lock() = Some(cpu);
        let current = availability.max_concurrent().max(0) as usize;
        let next = if cpu > self.policy.target_cpu_percent && current > self.min {
            self.decreases.fetch_add(1, Ordering::Relaxed);
            current - 1
        } else if cpu <= self.policy.target_cpu_percent && current < self.max {
            self.increases.fetch_add(1, Ordering::Relaxed);
            current + 1
        } else {
            current.clamp(self.min, self.max)
        };
        if next != current {
            debug!(cpu, from = current, to = next, "autotune adjusted concurrency");
            availability.set_max_concurrent(next);
        }
        availability.set_overload_max(self.overload_budget(next));
        next
    }

    /// Roughly a tenth of the ceiling, clamped to the policy bounds.
    pub fn overload_budget(&self, max_concurrent: usize) -> usize {
        (max_concurrent / 10).clamp(self.policy.overload_min, self.policy.overload_max)
    }

    pub fn statistics(&self) -> AutotuneStatistics {
        AutotuneStatistics {
            enabled: self.policy.enabled,
            target_cpu_percent: self.policy.target_cpu_percent,
            last_cpu_percent: *self.last_cpu.lock(),
            min_concurrent: self.min,
            max_concurrent: self.max,
            increases: self.increases.load(Ordering::Relaxed),
            decreases: self.decreases.load(Ordering::Relaxed),
        }
    }
}

impl ManagedProcess for Autotune {
    fn name(&self) -> &str {
        "autotune"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn process(&self, scope: &ProcessScope<'_>) -> Result<(), TaskError> {
        if !self.policy.enabled {
            return Ok(());
        }
        let sample = self.sampler.lock().sample();
        if let Some(cpu) = sample {
            self.tune(cpu, scope.availability);
        }
        Ok(())
    }
}
