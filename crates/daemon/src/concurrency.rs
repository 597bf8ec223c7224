//! Concurrency planning module for the mediaq daemon
//!
//! Derives the worker pool size from CPU core count and configuration.

use mediaq_config::Config;

/// Threads one transcode is expected to keep busy.
const THREADS_PER_JOB: u32 = 8;

/// Upper bound for derived worker counts.
const MAX_DERIVED_WORKERS: u32 = 4;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target number of threads to use based on utilization
    pub target_threads: u32,
    /// Number of jobs run at once (worker pool size)
    pub workers: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    /// - Uses `workers.count` when non-zero, otherwise one worker per
    ///   eight target threads, between 1 and 4
    pub fn derive(cfg: &Config) -> Self {
        Self::for_cores(num_cpus::get() as u32, cfg)
    }

    /// Same as [`ConcurrencyPlan::derive`] with an explicit core count.
    pub fn for_cores(total_cores: u32, cfg: &Config) -> Self {
        let total_cores = total_cores.max(1);
        let clamped_utilization = clamp_utilization(cfg.workers.target_cpu_utilization);
        let target_threads = (((total_cores as f32) * clamped_utilization).round() as u32).max(1);

        let workers = if cfg.workers.count > 0 {
            cfg.workers.count
        } else {
            derive_workers(target_threads)
        };

        Self {
            total_cores,
            target_threads,
            workers,
        }
    }
}

fn derive_workers(target_threads: u32) -> u32 {
    (target_threads / THREADS_PER_JOB).clamp(1, MAX_DERIVED_WORKERS)
}

/// Clamp utilization to valid range [0.5, 1.0]
fn clamp_utilization(util: f32) -> f32 {
    if util.is_nan() {
        return 1.0;
    }
    util.clamp(0.5, 1.0)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
