//! Run-queue placement rules (spec §4.D).

use slotmap::SlotMap;

use crate::ids::{VcpuId, VsmpId};
use crate::percpu::{Pcpu, QueueKind};
use crate::time::Vtime;
use crate::vsmp::Vsmp;

/// Decide which of the three queues a vcpu belongs on right now, given
/// its vsmp's ahead/eligible state.
pub fn select_queue(vsmp: &Vsmp, cell_vtime: Vtime, bound_lag: i64) -> QueueKind {
    if vsmp.is_max_limited() {
        return QueueKind::Limbo;
    }
    if vsmp.is_ahead(cell_vtime, bound_lag) && vsmp.extra_eligible(cell_vtime, bound_lag) {
        QueueKind::Extra
    } else {
        QueueKind::Main
    }
}

/// Walk the extra and limbo queues once, moving any vcpu that no longer
/// belongs there to its correct queue (spec §4.D: "the extra and limbo
/// queues are walked once and members that no longer belong are moved to
/// their correct queue").
pub fn rebalance_queues(
    pcpu: &mut Pcpu,
    cell_vtime: Vtime,
    bound_lag: i64,
    vcpu_vsmp: impl Fn(VcpuId) -> Option<VsmpId>,
    vsmps: &SlotMap<VsmpId, Vsmp>,
) {
    for kind in [QueueKind::Extra, QueueKind::Limbo] {
        let members: Vec<VcpuId> = pcpu.iter(kind).copied().collect();
        for vcpu in members {
            let Some(vsmp_id) = vcpu_vsmp(vcpu) else {
                continue;
            };
            let Some(vsmp) = vsmps.get(vsmp_id) else {
                continue;
            };
            let correct = select_queue(vsmp, cell_vtime, bound_lag);
            if correct != kind {
                pcpu.remove(vcpu);
                pcpu.push(correct, vcpu);
            }
        }
    }
}
