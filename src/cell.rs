//! Scheduler cells: disjoint partitions of pcpus forming a single
//! locking domain (spec §3, §4.G).

use crate::ids::{CellId, VsmpId};
use crate::percpu::Pcpu;
use crate::sync::{SpinLock, SpinLockGuard};
use crate::time::{Cycles, Vtime};

/// Mutable state owned by one cell, protected by the cell's lock.
pub struct CellState {
    pub pcpus: Vec<Pcpu>,
    /// Vsmps currently assigned to this cell.
    pub vsmps: Vec<VsmpId>,
    pub now: Cycles,
    pub vtime: Vtime,
    /// Cycles lost to cross-pcpu clock skew within the cell (spec §4.A).
    pub lost_cycles: u64,
}

impl CellState {
    /// Advance `now`/`vtime` from a raw reading taken on one of this
    /// cell's pcpus. If the raw counter went backward (cross-cpu clock
    /// skew), `now` is clamped and the delta is folded into
    /// `lost_cycles` instead of moving time backward.
    pub fn observe_time(&mut self, raw_cycles: Cycles, reference_stride: u64) {
        if raw_cycles < self.now {
            self.lost_cycles += self.now - raw_cycles;
            return;
        }
        let elapsed = raw_cycles - self.now;
        self.now = raw_cycles;
        self.vtime += crate::time::tc_to_vtime(reference_stride, elapsed);
    }
}

/// A scheduler cell. Its pcpu partition is fixed after boot; its vsmp
/// membership changes only under both the source and destination cells'
/// locks, held in ascending cell-id order (spec §4.G).
pub struct Cell {
    pub id: CellId,
    pub numa_node: Option<u32>,
    /// `stride_for_shares(total_base_shares)`: the rate at which `vtime`
    /// advances relative to real cycles, as if the whole cell were one
    /// fully-shared entity. This is what lets `vtime.main` be compared
    /// directly against `cell.vtime` in the bound-lag invariant.
    pub reference_stride: u64,
    state: SpinLock<CellState>,
}

impl Cell {
    pub fn new(id: CellId, pcpu_count: usize, ht_pairs: bool, reference_stride: u64) -> Self {
        let pcpus = (0..pcpu_count)
            .map(|i| {
                let partner = if ht_pairs {
                    Some(if i % 2 == 0 { i + 1 } else { i - 1 })
                } else {
                    None
                };
                Pcpu::new(i, id, partner)
            })
            .collect();
        Self {
            id,
            numa_node: None,
            reference_stride,
            state: SpinLock::new(CellState {
                pcpus,
                vsmps: Vec::new(),
                now: 0,
                vtime: 0,
                lost_cycles: 0,
            }),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, CellState> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, CellState>> {
        self.state.try_lock()
    }

    pub fn pcpu_count(&self) -> usize {
        self.lock().pcpus.len()
    }
}

/// Partition `total_pcpus` into cells of `desired_cell_size`, rounding to
/// respect the HT-package and NUMA-node constraints (spec §4.G). Falls
/// back to a single cell containing every pcpu if the request can't be
/// satisfied cleanly.
pub fn partition_cells(total_pcpus: usize, desired_cell_size: usize, ht_package_size: usize) -> Vec<usize> {
    if desired_cell_size == 0 || ht_package_size == 0 {
        return vec![total_pcpus];
    }
    let mut size = desired_cell_size;
    // Round up to a multiple of the HT package size.
    if size % ht_package_size != 0 {
        size += ht_package_size - (size % ht_package_size);
    }
    if size == 0 || total_pcpus % size != 0 {
        return vec![total_pcpus];
    }
    let cell_count = total_pcpus / size;
    vec![size; cell_count]
}

/// Whether a vsmp may migrate out of its current cell right now: none of
/// its vcpus may be `Run` or `ReadyCorun` (spec §4.G `CanMigrateVsmp`).
pub fn can_migrate_vsmp(vcpu_states: &[crate::vcpu::RunState]) -> bool {
    !vcpu_states
        .iter()
        .any(|s| matches!(s, crate::vcpu::RunState::Run | crate::vcpu::RunState::ReadyCorun))
}
