//! The dispatcher: picks the next vcpu to run on a pcpu (spec §4.E
//! `Choose`).
//!
//! `choose` walks, in order: the handoff slot left by a peer pcpu's
//! CoSchedule, the local main queue (lowest main-vtime wins), a
//! migration probe against sibling cells, and finally the local extra
//! queue. Each step is its own function so the ordering and each
//! decision can be tested in isolation, the same way the run-queue
//! helpers in `queue.rs` are split out from `select_queue`.

use rand::Rng;
use slotmap::SlotMap;

use crate::cell::CellState;
use crate::ids::{VcpuId, VsmpId};
use crate::percpu::{Pcpu, QueueKind};
use crate::queue::{rebalance_queues, select_queue};
use crate::time::{Cycles, Vtime};
use crate::vcpu::Vcpu;
use crate::vsmp::Vsmp;

/// Outcome of one call to [`choose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChooseOutcome {
    /// Run this vcpu.
    Run(VcpuId),
    /// Nothing runnable; the pcpu goes idle.
    Idle,
}

/// Step 1: a peer pcpu may have parked a mandatory co-schedule sibling
/// directly into this pcpu's handoff slot (spec §4.E step 1, §4.F
/// CoSchedule issuance). Always wins over the queues if present.
fn take_handoff(pcpu: &mut Pcpu) -> Option<VcpuId> {
    pcpu.handoff.take()
}

/// Step 2: scan the main queue and return whichever vsmp's leader vcpu
/// has the lowest `vtime.main` (stride-scheduling tie-break: earliest
/// entitlement wins). `None` if the main queue is empty.
fn pick_lowest_vtime(
    pcpu: &Pcpu,
    kind: QueueKind,
    vcpus: &SlotMap<VcpuId, Vcpu>,
    vsmps: &SlotMap<VsmpId, Vsmp>,
    vtime_of: impl Fn(&Vsmp) -> Vtime,
) -> Option<VcpuId> {
    pcpu.iter(kind)
        .copied()
        .filter_map(|vcpu_id| {
            let vcpu = vcpus.get(vcpu_id)?;
            let vsmp = vsmps.get(vcpu.vsmp())?;
            Some((vcpu_id, vtime_of(vsmp)))
        })
        .min_by_key(|(_, vtime)| *vtime)
        .map(|(vcpu_id, _)| vcpu_id)
}

/// Whether an opportunistic migration scan should run this tick: either
/// the periodic timer has elapsed, or a `1/chance` random probe fires
/// (spec §4.E step 3's jittered migration check, so many idle pcpus
/// don't all probe in lockstep).
pub fn migration_due(
    last_migrate: Cycles,
    now: Cycles,
    period: u64,
    chance: u32,
    rng: &mut impl Rng,
) -> bool {
    if now.saturating_sub(last_migrate) >= period {
        return true;
    }
    chance > 0 && rng.gen_range(0..chance) == 0
}

/// Step 4/9: try to pull a runnable vcpu from a sibling pcpu's extra
/// queue under a non-blocking try-lock of its cell (spec §4.E step 9
/// "remote/cross-cell scan"). Only ever takes the single head-of-queue
/// candidate so the probing pcpu never holds two cell locks for long.
pub fn try_steal_remote(
    remote_cell: &crate::sync::SpinLock<CellState>,
    vcpus: &SlotMap<VcpuId, Vcpu>,
    vsmps: &SlotMap<VsmpId, Vsmp>,
    bound_lag: i64,
) -> Option<VcpuId> {
    let mut guard = remote_cell.try_lock()?;
    let cell_vtime = guard.vtime;
    for pcpu in guard.pcpus.iter_mut() {
        if let Some(vcpu_id) = pick_lowest_vtime(pcpu, QueueKind::Extra, vcpus, vsmps, |vsmp| vsmp.vtime.extra)
        {
            let vcpu = vcpus.get(vcpu_id)?;
            let vsmp = vsmps.get(vcpu.vsmp())?;
            if select_queue(vsmp, cell_vtime, bound_lag) == QueueKind::Extra {
                pcpu.remove(vcpu_id);
                return Some(vcpu_id);
            }
        }
    }
    None
}

/// Run the full local choice on one pcpu: rebalance stale queue
/// membership, honor a pending handoff, then scan main and finally
/// extra. Returns the vcpu to dispatch, or `Idle`.
pub fn choose(
    pcpu: &mut Pcpu,
    cell_vtime: Vtime,
    bound_lag: i64,
    vcpus: &SlotMap<VcpuId, Vcpu>,
    vsmps: &SlotMap<VsmpId, Vsmp>,
) -> ChooseOutcome {
    pcpu.invalidate_group_vtime_cache();

    rebalance_queues(pcpu, cell_vtime, bound_lag, |id| vcpus.get(id).map(|v| v.vsmp()), vsmps);

    if let Some(vcpu_id) = take_handoff(pcpu) {
        return ChooseOutcome::Run(vcpu_id);
    }

    if let Some(vcpu_id) = pick_lowest_vtime(pcpu, QueueKind::Main, vcpus, vsmps, |vsmp| vsmp.vtime.main) {
        pcpu.remove(vcpu_id);
        return ChooseOutcome::Run(vcpu_id);
    }

    if let Some(vcpu_id) = pick_lowest_vtime(pcpu, QueueKind::Extra, vcpus, vsmps, |vsmp| vsmp.vtime.extra) {
        pcpu.remove(vcpu_id);
        return ChooseOutcome::Run(vcpu_id);
    }

    ChooseOutcome::Idle
}

/// Directed yield (spec §4.E step 2): a vcpu that calls a yield-to
/// hypercall naming a specific sibling gets that sibling placed in the
/// handoff slot immediately, bypassing the vtime comparison, provided
/// it is actually ready to run.
pub fn directed_yield(pcpu: &mut Pcpu, target: VcpuId, target_is_ready: bool) -> bool {
    if !target_is_ready {
        return false;
    }
    pcpu.remove(target);
    pcpu.handoff = Some(target);
    true
}
