//! Fixture builders shared by the property tests and the scenario
//! tests under `tests/`.

use std::sync::Arc;

use crate::config::SchedConfig;
use crate::error::Result;
use crate::group::{NodeAlloc, NodeMemAlloc};
use crate::ids::{GroupId, VsmpId};
use crate::scheduler::{Scheduler, SchedulerBuilder};
use crate::time::SimClock;
use crate::vsmp::ExternalAlloc;

/// Build a scheduler with `pcpus` in a single cell and a
/// [`SimClock`] the caller advances explicitly, returning both the
/// scheduler and a handle to the clock.
pub fn single_cell_scheduler(pcpus: usize) -> (Scheduler, Arc<SimClock>) {
    scheduler_with_config(pcpus, SchedConfig::default())
}

pub fn scheduler_with_config(pcpus: usize, config: SchedConfig) -> (Scheduler, Arc<SimClock>) {
    let clock = Arc::new(SimClock::new(0));
    let scheduler = SchedulerBuilder {
        config,
        total_pcpus: pcpus,
        cell_size: pcpus,
        ht_package_size: 1,
        managed_pages: 1 << 20,
    }
    .build(clock.clone());
    (scheduler, clock)
}

/// Create a single-vcpu guest directly under the root with the given
/// share count and default (unlimited) min/max.
pub fn add_busy_vm(scheduler: &mut Scheduler, name: &str, shares: u32) -> Result<VsmpId> {
    let root = scheduler.root();
    scheduler.create_vsmp(
        root,
        name,
        ExternalAlloc::unlimited(shares),
        NodeMemAlloc::default(),
        1,
    )
}

/// Create a multiprocessor guest with `n_vcpus` vcpus.
pub fn add_mp_vm(scheduler: &mut Scheduler, name: &str, shares: u32, n_vcpus: usize) -> Result<VsmpId> {
    let root = scheduler.root();
    scheduler.create_vsmp(
        root,
        name,
        ExternalAlloc::unlimited(shares),
        NodeMemAlloc::default(),
        n_vcpus,
    )
}

/// Create a guest with explicit min/max percentages (for max-limit and
/// min-guarantee scenario tests).
pub fn add_vm_with_limits(
    scheduler: &mut Scheduler,
    name: &str,
    min_percent: u32,
    max_percent: u32,
    shares: u32,
) -> Result<VsmpId> {
    let root = scheduler.root();
    scheduler.create_vsmp(
        root,
        name,
        ExternalAlloc {
            min: min_percent,
            max: max_percent,
            shares,
            units: crate::vsmp::AllocUnits::Percent,
        },
        NodeMemAlloc::default(),
        1,
    )
}

/// Create a group with explicit min/max percentages under `parent`.
pub fn add_group_with_limits(
    scheduler: &mut Scheduler,
    parent: GroupId,
    name: &str,
    min_limit_percent: u32,
    hard_max_percent: u32,
) -> Result<GroupId> {
    scheduler.create_group(
        parent,
        name,
        NodeAlloc::group(min_limit_percent, hard_max_percent, 1),
        NodeMemAlloc::default(),
    )
}

/// Fraction of total charged cycles across a set of vsmps that belongs
/// to `target`, used by the fairness/max-limit scenario assertions.
pub fn usage_fraction(scheduler: &Scheduler, target: VsmpId, all: &[VsmpId]) -> f64 {
    let charged = |id: VsmpId| -> u64 {
        scheduler
            .vsmp(id)
            .map(|vsmp| {
                vsmp.vcpus()
                    .iter()
                    .filter_map(|v| scheduler.vcpu(*v))
                    .map(|v| v.charge_cycles_total)
                    .sum()
            })
            .unwrap_or(0)
    };
    let total: u64 = all.iter().map(|id| charged(*id)).sum();
    if total == 0 {
        return 0.0;
    }
    charged(target) as f64 / total as f64
}
