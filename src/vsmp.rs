//! Vsmp: the set of vcpus belonging to one guest, scheduled as a
//! co-scheduling unit (spec §3, §4.C, §4.F).

use crate::ids::{CellId, GroupId, VcpuId};
use crate::time::Vtime;

/// Co-run state of an MP vsmp (spec §3, §4.C). Uniprocessor vsmps never
/// leave `CoNone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoRunState {
    /// Single-vcpu vsmp; co-scheduling machinery does not apply.
    CoNone,
    /// MP, no vcpu running.
    CoReady,
    /// MP, one or more vcpus running.
    CoRun,
    /// MP, vcpus are held descheduled pending co-start.
    CoStop,
}

/// Units an external allocation is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocUnits {
    Percent,
    Mhz,
    BShares,
}

/// Administrator-declared external allocation (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalAlloc {
    pub min: u32,
    pub max: u32,
    pub shares: u32,
    pub units: AllocUnits,
}

impl ExternalAlloc {
    pub fn unlimited(shares: u32) -> Self {
        Self {
            min: 0,
            max: 100,
            shares,
            units: AllocUnits::Percent,
        }
    }
}

/// Internal "base" allocation, in base-share units (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BaseAlloc {
    pub min: u64,
    pub max: u64,
    pub shares: u64,
}

/// A vsmp's position in the virtual-time scheme (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VtimeState {
    pub main: Vtime,
    pub extra: Vtime,
    pub stride: u64,
    pub n_stride: u64,
}

/// Hyperthread sharing policy (spec §4.E, §4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtSharing {
    /// May share a package with any other vsmp.
    Any,
    /// May only share a package with its own vcpus.
    Internal,
    /// Must have whole packages to itself (quarantine sets this).
    None,
}

/// One guest: an ordered set of vcpus, the leader being vcpus\[0\].
pub struct Vsmp {
    id_in_tree: GroupId,
    vcpus: Vec<VcpuId>,
    cell: CellId,

    pub co_run_state: CoRunState,
    pub n_run: u32,
    pub n_wait: u32,
    pub n_idle: u32,
    /// Count of vcpus currently in a wait state that forbids CoStop.
    pub disable_co_deschedule: u32,

    pub alloc: ExternalAlloc,
    pub base: BaseAlloc,
    pub vtime: VtimeState,
    pub vtime_limit: Vtime,
    pub stride_limit: u64,

    pub ht_sharing: HtSharing,
    pub max_ht_constraint: HtSharing,
    pub quantum_expire: u64,

    pub numa_home_node: Option<u32>,
    pub joint_affinity: bool,

    /// Sum over sibling vcpus of `intraSkew`, maintained by the skew
    /// sampler (spec §4.F).
    pub aggregate_skew: u32,
    pub quarantined: bool,
}

impl Vsmp {
    pub fn new(id_in_tree: GroupId, cell: CellId, alloc: ExternalAlloc) -> Self {
        Self {
            id_in_tree,
            vcpus: Vec::new(),
            cell,
            co_run_state: CoRunState::CoNone,
            n_run: 0,
            n_wait: 0,
            n_idle: 0,
            disable_co_deschedule: 0,
            alloc,
            base: BaseAlloc::default(),
            vtime: VtimeState::default(),
            vtime_limit: Vtime::MAX,
            stride_limit: 0,
            ht_sharing: HtSharing::Any,
            max_ht_constraint: HtSharing::Any,
            quantum_expire: 0,
            numa_home_node: None,
            joint_affinity: true,
            aggregate_skew: 0,
            quarantined: false,
        }
    }

    pub fn tree_node(&self) -> GroupId {
        self.id_in_tree
    }

    /// Bind this vsmp to its tree leaf once it's been inserted; the
    /// vsmp is constructed before its leaf exists so a placeholder id is
    /// used until now (spec §3: a vsmp's tree leaf mirrors its external
    /// allocation).
    pub fn set_tree_node(&mut self, leaf: GroupId) {
        self.id_in_tree = leaf;
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn set_cell(&mut self, cell: CellId) {
        self.cell = cell;
    }

    pub fn vcpus(&self) -> &[VcpuId] {
        &self.vcpus
    }

    pub fn leader(&self) -> Option<VcpuId> {
        self.vcpus.first().copied()
    }

    pub fn is_mp(&self) -> bool {
        self.vcpus.len() > 1
    }

    pub fn add_vcpu(&mut self, vcpu: VcpuId) {
        self.vcpus.push(vcpu);
        if self.is_mp() && self.co_run_state == CoRunState::CoNone {
            self.co_run_state = CoRunState::CoReady;
        }
    }

    pub fn remove_vcpu(&mut self, vcpu: VcpuId) {
        self.vcpus.retain(|&v| v != vcpu);
    }

    /// Test whether `vtime.main` is ahead of the cell's vtime by more
    /// than the bound-lag window — the "ahead" predicate run queues use
    /// to pick main vs. extra (spec §4.D).
    pub fn is_ahead(&self, cell_vtime: Vtime, bound_lag: i64) -> bool {
        (self.vtime.main - cell_vtime) > bound_lag
    }

    /// Whether this vsmp is currently eligible for extra time: ahead of
    /// its main entitlement but not yet past its max-enforcement limit.
    pub fn extra_eligible(&self, cell_vtime: Vtime, bound_lag: i64) -> bool {
        self.is_ahead(cell_vtime, bound_lag) && self.vtime.extra < self.vtime_limit
    }

    /// Whether running now would violate this vsmp's max (spec §4.D
    /// limbo queue membership).
    pub fn is_max_limited(&self) -> bool {
        self.vtime.extra >= self.vtime_limit
    }
}

impl std::fmt::Debug for Vsmp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vsmp")
            .field("vcpus", &self.vcpus.len())
            .field("co_run_state", &self.co_run_state)
            .field("vtime", &self.vtime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn dummy_group_id() -> GroupId {
        let mut sm: SlotMap<GroupId, ()> = SlotMap::with_key();
        sm.insert(())
    }
    fn dummy_cell_id() -> CellId {
        let mut sm: SlotMap<CellId, ()> = SlotMap::with_key();
        sm.insert(())
    }

    #[test]
    fn second_vcpu_makes_it_mp_and_co_ready() {
        let mut vsmp = Vsmp::new(dummy_group_id(), dummy_cell_id(), ExternalAlloc::unlimited(1000));
        assert_eq!(vsmp.co_run_state, CoRunState::CoNone);
        let mut sm: SlotMap<VcpuId, ()> = SlotMap::with_key();
        vsmp.add_vcpu(sm.insert(()));
        assert_eq!(vsmp.co_run_state, CoRunState::CoNone);
        vsmp.add_vcpu(sm.insert(()));
        assert_eq!(vsmp.co_run_state, CoRunState::CoReady);
        assert!(vsmp.is_mp());
    }

    #[test]
    fn ahead_predicate() {
        let mut vsmp = Vsmp::new(dummy_group_id(), dummy_cell_id(), ExternalAlloc::unlimited(1000));
        vsmp.vtime.main = 1000;
        assert!(vsmp.is_ahead(0, 500));
        assert!(!vsmp.is_ahead(600, 500));
    }
}
