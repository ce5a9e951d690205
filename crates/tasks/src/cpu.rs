use sysinfo::{Pid, System};

/// Source of process CPU usage, as a percentage of total machine capacity.
pub trait CpuSampler: Send {
    fn sample(&mut self) -> Option<f32>;
}

/// Samples this process through `sysinfo`.
pub struct SystemCpuSampler {
    system: System,
    pid: Option<Pid>,
    cores: f32,
}

impl SystemCpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        let cores = system.cpus().len().max(1) as f32;
        Self {
            system,
            pid: sysinfo::get_current_pid().ok(),
            cores,
        }
    }
}

impl Default for SystemCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SystemCpuSampler {
    fn sample(&mut self) -> Option<f32> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        // sysinfo reports per-core percent; 400% on a 4 core box is saturation.
        let usage = self.system.process(pid)?.cpu_usage() / self.cores;
        Some(usage.clamp(0.0, 100.0))
    }
}

/// Returns a fixed reading. Used by tests and when sampling is unavailable.
#[derive(Debug, Clone, Copy)]
pub struct FixedCpuSampler(pub f32);

impl CpuSampler for FixedCpuSampler {
    fn sample(&mut self) -> Option<f32> {
        Some(self.0)
    }
}
