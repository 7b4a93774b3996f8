//! Runtime-mutable scheduler configuration (spec §6).
//!
//! Every tunable here is a plain field on [`SchedConfig`] with the
//! documented default; [`ConfigWatch`] models "runtime-mutable with
//! callbacks" by letting subscribers recompute derived constants when a
//! value changes, instead of every call site re-reading a raw global.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// How aggressively the dispatcher migrates a runnable vsmp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReschedOpt {
    /// Always honor a pending reschedule at the next safe point.
    Always,
    /// Only honor it where the running code is preemptible.
    Preemptible,
    /// Defer until the current quantum naturally expires.
    Defer,
    /// Disable opportunistic resched entirely (quantum expiry only).
    None,
}

/// All scheduler tunables from spec.md §6, collected so the host can
/// load/reload them as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedConfig {
    pub cpu_quantum_ms: u64,
    pub cpu_idle_quantum_ms: u64,
    pub cpu_bound_lag_quanta: u32,
    pub cpu_credit_age_period_ms: u64,
    pub cpu_skew_sample_usec: u64,
    /// Aggregate skew that triggers costop; 0 disables strict costop.
    pub cpu_skew_sample_threshold: u32,
    pub cpu_intraskew_threshold: u32,
    pub cpu_relaxed_cosched: bool,
    pub cpu_machine_clear_thresh: u32,
    pub cpu_pcpu_migrate_period: u64,
    pub cpu_cell_migrate_period: u64,
    pub cpu_runner_move_period: u64,
    /// 1/N probability of a migration scan before the period elapses.
    pub cpu_migrate_chance: u32,
    pub cpu_resched_opt: ReschedOpt,
    pub cpu_yield_throttle_usec: u64,
    pub cpu_halting_idle: bool,
    /// log2 of the vtime threshold that triggers a global reset.
    pub cpu_vtime_reset_lg: u32,

    pub mem_balance_period_ms: u64,
    pub mem_sample_period_ms: u64,
    pub mem_sample_size: u32,
    pub mem_sample_history: u32,
    /// 0-99.
    pub mem_idle_tax_percent: u8,
    pub mem_ctl_max_nt4_mb: u64,
    pub mem_ctl_max_nt5_mb: u64,
    pub mem_ctl_max_linux_mb: u64,
    pub mem_ctl_max_bsd_mb: u64,
    pub mem_ctl_max_percent: u8,
    pub mem_share_scan_vm: u32,
    pub mem_share_scan_total: u32,
    pub mem_share_check_vm: u32,
    pub mem_share_check_total: u32,
    pub mem_admit_heap_min_mb: u64,
    /// Percent of managed free pages below which the free-state machine
    /// enters SOFT (spec §4.J free-state machine, default 6%).
    pub mem_min_free_percent: u8,
    /// Percent of managed free pages below which the free-state machine
    /// enters HARD (default 4%).
    pub mem_ctl_hard_free_percent: u8,
    /// Percent of managed free pages below which the free-state machine
    /// enters LOW (default 2%).
    pub mem_ctl_low_free_percent: u8,
    /// Points added to each enter threshold to get its exit threshold,
    /// so the state machine doesn't chatter at a single boundary
    /// (default 1%, per spec §4.J's documented 6/4/2/1 defaults).
    pub mem_free_hysteresis_percent: u8,
    /// Milliseconds without an acknowledged balloon size change before a
    /// memory client is marked non-responsive (spec §4.J, default ≈15s).
    pub mem_nonresponsive_timeout_ms: u64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            cpu_quantum_ms: 50,
            cpu_idle_quantum_ms: 50,
            cpu_bound_lag_quanta: 5,
            cpu_credit_age_period_ms: 2000,
            cpu_skew_sample_usec: 50,
            cpu_skew_sample_threshold: 28,
            cpu_intraskew_threshold: 10,
            cpu_relaxed_cosched: true,
            cpu_machine_clear_thresh: 3000,
            cpu_pcpu_migrate_period: 100_000,
            cpu_cell_migrate_period: 200_000,
            cpu_runner_move_period: 50_000,
            cpu_migrate_chance: 1000,
            cpu_resched_opt: ReschedOpt::Preemptible,
            cpu_yield_throttle_usec: 50,
            cpu_halting_idle: true,
            cpu_vtime_reset_lg: 46,

            mem_balance_period_ms: 15_000,
            mem_sample_period_ms: 1_000,
            mem_sample_size: 100,
            mem_sample_history: 4,
            mem_idle_tax_percent: 75,
            mem_ctl_max_nt4_mb: 256,
            mem_ctl_max_nt5_mb: 512,
            mem_ctl_max_linux_mb: 384,
            mem_ctl_max_bsd_mb: 256,
            mem_ctl_max_percent: 65,
            mem_share_scan_vm: 50,
            mem_share_scan_total: 500,
            mem_share_check_vm: 50,
            mem_share_check_total: 500,
            mem_admit_heap_min_mb: 32,
            mem_min_free_percent: 6,
            mem_ctl_hard_free_percent: 4,
            mem_ctl_low_free_percent: 2,
            mem_free_hysteresis_percent: 1,
            mem_nonresponsive_timeout_ms: 15_000,
        }
    }
}

impl SchedConfig {
    /// Bound-lag window expressed in cycles, given a cycles-per-ms
    /// conversion factor. Call sites that need this recompute it whenever
    /// `cpu_bound_lag_quanta` or `cpu_quantum_ms` changes.
    pub fn bound_lag_cycles(&self, cycles_per_ms: u64) -> u64 {
        self.cpu_bound_lag_quanta as u64 * self.cpu_quantum_ms * cycles_per_ms
    }

    /// `idleCost = 1 / (1 - taxRate/100)`, the scaled cost ratio the
    /// memory-scheduler target computation uses to charge idle pages
    /// (spec §4.J step 3).
    pub fn mem_idle_cost(&self) -> f64 {
        let tax = (self.mem_idle_tax_percent.min(99)) as f64 / 100.0;
        1.0 / (1.0 - tax)
    }
}

type ConfigCallback = Box<dyn Fn(&SchedConfig) + Send + Sync>;

/// Registry of callbacks invoked whenever the live configuration changes.
pub struct ConfigWatch {
    current: RwLock<SchedConfig>,
    subscribers: RwLock<Vec<ConfigCallback>>,
}

impl ConfigWatch {
    pub fn new(initial: SchedConfig) -> Self {
        Self {
            current: RwLock::new(initial),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self) -> SchedConfig {
        self.current.read().unwrap().clone()
    }

    pub fn subscribe(&self, callback: ConfigCallback) {
        self.subscribers.write().unwrap().push(callback);
    }

    /// Replace the live configuration and notify every subscriber.
    pub fn set(&self, new_config: SchedConfig) {
        *self.current.write().unwrap() = new_config.clone();
        for sub in self.subscribers.read().unwrap().iter() {
            sub(&new_config);
        }
    }
}

impl Default for ConfigWatch {
    fn default() -> Self {
        Self::new(SchedConfig::default())
    }
}
