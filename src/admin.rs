//! Administrative snapshot and mutation API.
//!
//! Read-only snapshots are plain serializable structs so a host can
//! expose them over whatever RPC/CLI surface it likes without this
//! crate needing to know about it; mutations go through the same
//! admission-checked paths the scheduler core itself uses, so the
//! admin surface can't bypass an invariant a direct API call would
//! enforce.

use serde::Serialize;

use crate::error::Result;
use crate::group::NodeAlloc;
use crate::ids::{GroupId, VsmpId};
use crate::scheduler::Scheduler;
use crate::vsmp::{CoRunState, ExternalAlloc};

/// A read-only view of one group-tree node, suitable for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub is_leaf: bool,
    pub alloc: AllocSnapshot,
    pub base_shares: u64,
    pub base_emin: u64,
    pub base_emax: u64,
    pub children: Vec<GroupId>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AllocSnapshot {
    pub min: u32,
    pub max: u32,
    pub shares: u32,
}

/// A read-only view of one vsmp, suitable for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct VsmpSnapshot {
    pub n_vcpus: usize,
    pub co_run_state: CoRunStateSnapshot,
    pub vtime_main: i64,
    pub vtime_extra: i64,
    pub total_charged_cycles: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoRunStateSnapshot {
    None,
    Ready,
    Run,
    Stop,
}

impl From<CoRunState> for CoRunStateSnapshot {
    fn from(s: CoRunState) -> Self {
        match s {
            CoRunState::CoNone => Self::None,
            CoRunState::CoReady => Self::Ready,
            CoRunState::CoRun => Self::Run,
            CoRunState::CoStop => Self::Stop,
        }
    }
}

/// Snapshot a group-tree node for read-only display.
pub fn snapshot_group(scheduler: &Scheduler, id: GroupId) -> Option<GroupSnapshot> {
    let node = scheduler.tree().node(id)?;
    Some(GroupSnapshot {
        name: node.name.clone(),
        is_leaf: node.is_leaf(),
        alloc: AllocSnapshot {
            min: node.alloc.min,
            max: node.alloc.max,
            shares: node.alloc.shares,
        },
        base_shares: node.base.shares,
        base_emin: node.base.emin,
        base_emax: node.base.emax,
        children: node.children.clone(),
    })
}

/// Snapshot a vsmp for read-only display.
pub fn snapshot_vsmp(scheduler: &Scheduler, id: VsmpId) -> Option<VsmpSnapshot> {
    let vsmp = scheduler.vsmp(id)?;
    let total_charged_cycles = vsmp
        .vcpus()
        .iter()
        .filter_map(|v| scheduler.vcpu(*v))
        .map(|v| v.charge_cycles_total)
        .sum();
    Some(VsmpSnapshot {
        n_vcpus: vsmp.vcpus().len(),
        co_run_state: vsmp.co_run_state.into(),
        vtime_main: vsmp.vtime.main,
        vtime_extra: vsmp.vtime.extra,
        total_charged_cycles,
    })
}

/// Change a vsmp's external CPU allocation (min/max/shares), re-running
/// the same admission check group creation uses (spec §4.K "do the
/// same with the client's min and max").
pub fn set_vsmp_alloc(scheduler: &mut Scheduler, id: VsmpId, new_alloc: ExternalAlloc) -> Result<()> {
    let leaf = scheduler
        .vsmp(id)
        .map(|v| v.tree_node())
        .ok_or(crate::error::ScheduleError::NotFound)?;
    let node_alloc = NodeAlloc::leaf(new_alloc.min, new_alloc.max, new_alloc.shares);
    scheduler.tree_mut().set_alloc(leaf, node_alloc)?;
    if let Some(vsmp) = scheduler.vsmp_mut(id) {
        vsmp.alloc = new_alloc;
    }
    scheduler.reallocate_now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{add_busy_vm, single_cell_scheduler};

    #[test]
    fn snapshot_round_trips_basic_fields() {
        let (mut scheduler, _clock) = single_cell_scheduler(2);
        let vsmp_id = add_busy_vm(&mut scheduler, "vm1", 1000).unwrap();
        let snap = snapshot_vsmp(&scheduler, vsmp_id).unwrap();
        assert_eq!(snap.n_vcpus, 1);
        assert_eq!(snap.co_run_state, CoRunStateSnapshot::None);
    }

    #[test]
    fn group_snapshot_serializes_to_json() {
        let (mut scheduler, _clock) = single_cell_scheduler(2);
        let _ = add_busy_vm(&mut scheduler, "vm1", 1000).unwrap();
        let root = scheduler.root();
        let snap = snapshot_group(&scheduler, root).unwrap();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"base_shares\""));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["is_leaf"], false);
    }

    #[test]
    fn set_alloc_updates_both_vsmp_and_tree() {
        let (mut scheduler, _clock) = single_cell_scheduler(2);
        let vsmp_id = add_busy_vm(&mut scheduler, "vm1", 1000).unwrap();
        set_vsmp_alloc(
            &mut scheduler,
            vsmp_id,
            ExternalAlloc {
                min: 10,
                max: 50,
                shares: 2000,
                units: crate::vsmp::AllocUnits::Percent,
            },
        )
        .unwrap();
        assert_eq!(scheduler.vsmp(vsmp_id).unwrap().alloc.shares, 2000);
    }
}
