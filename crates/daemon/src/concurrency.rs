//! Concurrency control for the VTS batch daemon
//!
//! Two concerns live here:
//! - [`StartGuard`], the single-job initiation lock used by `start` and `resume`
//! - [`ConcurrencyPlan`], the encoder thread count derived from CPU configuration

use crate::config::Config;
use std::sync::atomic::{AtomicBool, Ordering};

/// Binary test-and-set flag serializing job initiation.
///
/// Held only while a job is being created; the run loop itself is guarded by
/// the presence of a live job.
#[derive(Debug, Default)]
pub struct StartGuard {
    held: AtomicBool,
}

impl StartGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the guard, or returns `None` if it is already held.
    pub fn try_acquire(&self) -> Option<StartPermit<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StartPermit { guard: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the [`StartGuard`] when dropped.
#[derive(Debug)]
pub struct StartPermit<'a> {
    guard: &'a StartGuard,
}

impl Drop for StartPermit<'_> {
    fn drop(&mut self) {
        self.guard.held.store(false, Ordering::Release);
    }
}

/// Encoder threading derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Threads handed to the encoder (at least 1)
    pub encoder_threads: u32,
}

impl ConcurrencyPlan {
    /// Derive a plan from configuration
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    /// - encoder_threads = round(cores * utilization), never below 1
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32);

        let clamped_utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let encoder_threads = ((total_cores as f32) * clamped_utilization).round() as u32;

        Self {
            total_cores,
            encoder_threads: encoder_threads.max(1),
        }
    }
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
