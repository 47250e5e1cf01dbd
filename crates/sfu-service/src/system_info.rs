//! Host information used to size the worker pool and report stats.

use sysinfo::System;

/// Host resources relevant to worker sizing.
#[derive(Debug, Clone, Copy)]
pub struct HostInfo {
    /// Number of logical CPU cores.
    pub cpu_cores: usize,
    /// Total memory in kilobytes.
    pub total_memory_kb: u64,
}

/// Gather host information.
///
/// Falls back to `std::thread::available_parallelism` when sysinfo reports no
/// CPUs (restricted containers), and to one core if that fails too.
#[must_use]
pub fn gather_host_info() -> HostInfo {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();

    let cpu_cores = match sys.cpus().len() {
        0 => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        n => n,
    };

    HostInfo {
        cpu_cores,
        total_memory_kb: sys.total_memory() / 1024,
    }
}
