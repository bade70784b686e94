//! Host resource sampling
//!
//! A sample is one point-in-time snapshot of CPU, memory and disk
//! utilization plus the cumulative network counters since boot.
//! Sampling never fails from the caller's point of view: errors are
//! reported through [`Sampler::try_sample`] and the engine replaces them
//! with a zeroed snapshot.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};

use crate::error::{SamplerError, SamplerResult};

/// One snapshot of host utilization
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// CPU usage percentage across all cores
    pub cpu_usage: f64,

    /// Used memory as a percentage of total memory
    pub memory_usage: f64,

    /// Used space on the root filesystem as a percentage
    pub disk_usage: f64,

    /// Bytes transmitted on all interfaces since boot
    pub network_sent: u64,

    /// Bytes received on all interfaces since boot
    pub network_recv: u64,
}

/// Source of host snapshots
pub trait Sampler: Send + Sync {
    /// Take a snapshot, reporting platform failures
    fn try_sample(&self) -> SamplerResult<SystemSnapshot>;

    /// Take a snapshot, degrading to zeros on failure
    fn sample(&self) -> SystemSnapshot {
        match self.try_sample() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Error getting system metrics");
                SystemSnapshot::default()
            }
        }
    }
}

/// Sampler backed by `sysinfo`
pub struct HostSampler {
    state: Mutex<HostState>,
    cpu_window: Duration,
}

struct HostState {
    system: System,
    disks: Disks,
    networks: Networks,
    last_cpu: Option<(Instant, f64)>,
}

impl HostSampler {
    /// Create a sampler measuring CPU over `cpu_window`, raised to the
    /// platform minimum when shorter
    pub fn new(cpu_window: Duration) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            state: Mutex::new(HostState {
                system,
                disks: Disks::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
                last_cpu: None,
            }),
            cpu_window: cpu_window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }

    fn cpu_usage(&self, state: &mut HostState) -> f64 {
        // Readings younger than one window are shared between callers so
        // concurrent samples do not queue a full window each.
        if let Some((taken_at, usage)) = state.last_cpu {
            if taken_at.elapsed() < self.cpu_window {
                return usage;
            }
        }

        state.system.refresh_cpu();
        std::thread::sleep(self.cpu_window);
        state.system.refresh_cpu();

        let usage = state.system.global_cpu_info().cpu_usage() as f64;
        state.last_cpu = Some((Instant::now(), usage));
        usage
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl Sampler for HostSampler {
    fn try_sample(&self) -> SamplerResult<SystemSnapshot> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(SamplerError::Unsupported);
        }

        let mut state = self.state.lock().map_err(|_| SamplerError::LockPoisoned)?;

        let cpu_usage = self.cpu_usage(&mut state);

        state.system.refresh_memory();
        let total_memory = state.system.total_memory();
        if total_memory == 0 {
            return Err(SamplerError::ResourceUnavailable { resource: "memory" });
        }
        let memory_usage = state.system.used_memory() as f64 / total_memory as f64 * 100.0;

        state.disks.refresh();
        let disk_usage = root_disk_usage(&state.disks)
            .ok_or(SamplerError::ResourceUnavailable { resource: "disk" })?;

        state.networks.refresh();
        let (network_sent, network_recv) = state
            .networks
            .list()
            .values()
            .fold((0u64, 0u64), |(sent, recv), data| {
                (
                    sent.saturating_add(data.total_transmitted()),
                    recv.saturating_add(data.total_received()),
                )
            });

        let snapshot = SystemSnapshot {
            cpu_usage,
            memory_usage,
            disk_usage,
            network_sent,
            network_recv,
        };
        tracing::trace!(?snapshot, "host sampled");
        Ok(snapshot)
    }
}

/// Usage of the filesystem mounted at `/`, or of all disks together
/// when no root mount is listed
fn root_disk_usage(disks: &Disks) -> Option<f64> {
    let list = disks.list();
    let (total, available) = match list.iter().find(|d| d.mount_point() == Path::new("/")) {
        Some(root) => (root.total_space(), root.available_space()),
        None => list.iter().fold((0u64, 0u64), |(total, available), d| {
            (total + d.total_space(), available + d.available_space())
        }),
    };

    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
}

/// Sampler returning a settable snapshot. Useful for embedding the
/// engine where host access is not wanted, and for deterministic tests.
#[derive(Debug, Default)]
pub struct FixedSampler {
    snapshot: Mutex<SystemSnapshot>,
}

impl FixedSampler {
    pub fn new(snapshot: SystemSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Convenience constructor for CPU/memory driven scenarios
    pub fn with_usage(cpu_usage: f64, memory_usage: f64) -> Self {
        Self::new(SystemSnapshot {
            cpu_usage,
            memory_usage,
            ..SystemSnapshot::default()
        })
    }

    pub fn set(&self, snapshot: SystemSnapshot) {
        match self.snapshot.lock() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

impl Sampler for FixedSampler {
    fn try_sample(&self) -> SamplerResult<SystemSnapshot> {
        self.snapshot
            .lock()
            .map(|guard| *guard)
            .map_err(|_| SamplerError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenSampler;

    impl Sampler for BrokenSampler {
        fn try_sample(&self) -> SamplerResult<SystemSnapshot> {
            Err(SamplerError::ResourceUnavailable { resource: "memory" })
        }
    }

    #[test]
    fn test_failed_sample_degrades_to_zeros() {
        let snapshot = BrokenSampler.sample();
        assert_eq!(snapshot, SystemSnapshot::default());
    }

    #[test]
    fn test_fixed_sampler_returns_latest_value() {
        let sampler = FixedSampler::with_usage(12.5, 40.0);
        assert_eq!(sampler.sample().cpu_usage, 12.5);

        sampler.set(SystemSnapshot {
            cpu_usage: 90.0,
            memory_usage: 10.0,
            disk_usage: 55.0,
            network_sent: 1024,
            network_recv: 2048,
        });
        let snapshot = sampler.sample();
        assert_eq!(snapshot.cpu_usage, 90.0);
        assert_eq!(snapshot.network_recv, 2048);
    }

    #[test]
    fn test_host_sampler_reports_percentages() {
        let sampler = HostSampler::new(Duration::from_millis(10));
        let snapshot = sampler.sample();

        assert!(snapshot.cpu_usage >= 0.0);
        assert!(snapshot.memory_usage >= 0.0);
        assert!(snapshot.disk_usage >= 0.0);
    }

    #[test]
    fn test_host_sampler_network_counters_do_not_decrease() {
        let sampler = HostSampler::new(Duration::from_millis(10));
        let first = sampler.sample();
        let second = sampler.sample();

        if first != SystemSnapshot::default() && second != SystemSnapshot::default() {
            assert!(second.network_sent >= first.network_sent);
            assert!(second.network_recv >= first.network_recv);
        }
    }
}
