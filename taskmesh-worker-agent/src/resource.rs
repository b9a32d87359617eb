//! SPEC_FULL §10.6's "Resource snapshot detail": the heartbeat's
//! `cpu_usage`/`memory_usage`/`disk_usage` are real point-in-time samples
//! via `sysinfo`, matching the original `psutil`-based sampling, rather
//! than placeholders.

use std::sync::Mutex;
use sysinfo::{Disks, System};

#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
}

pub struct ResourceSampler {
    system: Mutex<System>,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        Self {
            system: Mutex::new(system),
        }
    }

    pub fn sample(&self) -> ResourceSnapshot {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_usage = system.global_cpu_usage() as f64;

        let total_memory = system.total_memory();
        let memory_usage = if total_memory > 0 {
            (system.used_memory() as f64 / total_memory as f64) * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let (total_space, available_space) = disks
            .iter()
            .fold((0u64, 0u64), |(total, available), disk| {
                (total + disk.total_space(), available + disk.available_space())
            });
        let disk_usage = if total_space > 0 {
            ((total_space - available_space) as f64 / total_space as f64) * 100.0
        } else {
            0.0
        };

        ResourceSnapshot {
            cpu_usage,
            memory_usage,
            disk_usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_returns_plausible_percentages() {
        let sampler = ResourceSampler::new();
        let snapshot = sampler.sample();
        assert!(snapshot.memory_usage >= 0.0 && snapshot.memory_usage <= 100.0);
        assert!(snapshot.disk_usage >= 0.0 && snapshot.disk_usage <= 100.0);
        assert!(snapshot.cpu_usage >= 0.0);
    }
}
