//! Physical cpu state (spec §3, §4.D): run queues, the cached preemption
//! snapshot, and the small per-pcpu group-vtime cache.

use std::collections::VecDeque;

use crate::ids::{CellId, GroupId, PcpuIndex, VcpuId};
use crate::time::{Cycles, Vtime};

/// Which of a pcpu's three run queues a vcpu currently belongs on
/// (spec §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Not ahead of main-vtime entitlement.
    Main,
    /// Ahead of entitlement and currently extra-eligible.
    Extra,
    /// Max-limited; would violate max if run.
    Limbo,
}

/// A snapshot of the running vcpu's vtime context, cached on the pcpu so
/// remote dispatchers can test preemption without taking this pcpu's
/// cell lock (spec §4.D, §4.E).
#[derive(Debug, Clone, Copy, Default)]
pub struct PreemptionSnapshot {
    pub ahead: bool,
    pub vtime: Vtime,
    pub stride: u64,
    /// A bonus, expressed in cycles, applied in favor of the incumbent
    /// (inertia against needless migration).
    pub bonus_cycles: Cycles,
    pub group_path: Vec<GroupId>,
    pub valid: bool,
}

/// Small direct-mapped cache of `(group, vtime, stride, vtimeLimit)`
/// keyed by the owning `SeqLock`'s generation counter (spec §3 Pcpu
/// data model, §4.A).
#[derive(Debug, Clone, Copy)]
pub struct GroupVtimeCacheEntry {
    pub group: GroupId,
    pub vtime: Vtime,
    pub stride: u64,
    pub vtime_limit: Vtime,
    pub generation: u64,
}

/// A physical cpu: three run queues, the currently-running vcpu, an
/// optional peer-assigned handoff, and assorted bookkeeping.
pub struct Pcpu {
    pub index: PcpuIndex,
    pub cell: CellId,
    pub ht_partner: Option<PcpuIndex>,

    main: VecDeque<VcpuId>,
    extra: VecDeque<VcpuId>,
    limbo: VecDeque<VcpuId>,

    pub current: Option<VcpuId>,
    pub handoff: Option<VcpuId>,

    pub used_cycles: u64,
    pub idle_cycles: u64,
    pub sys_cycles_overlap: u64,
    pub halted_cycles: u64,
    pub halt_start: Option<Cycles>,

    pub preemption: PreemptionSnapshot,
    pub group_vtime_cache: Option<GroupVtimeCacheEntry>,

    pub last_pcpu_migrate: Cycles,
    pub last_cell_migrate: Cycles,
    pub last_runner_move: Cycles,

    /// Set by the timer interrupt / IPI handler; cleared when the
    /// dispatcher next runs on this pcpu.
    pub resched_pending: bool,
}

impl Pcpu {
    pub fn new(index: PcpuIndex, cell: CellId, ht_partner: Option<PcpuIndex>) -> Self {
        Self {
            index,
            cell,
            ht_partner,
            main: VecDeque::new(),
            extra: VecDeque::new(),
            limbo: VecDeque::new(),
            current: None,
            handoff: None,
            used_cycles: 0,
            idle_cycles: 0,
            sys_cycles_overlap: 0,
            halted_cycles: 0,
            halt_start: None,
            preemption: PreemptionSnapshot::default(),
            group_vtime_cache: None,
            last_pcpu_migrate: 0,
            last_cell_migrate: 0,
            last_runner_move: 0,
            resched_pending: false,
        }
    }

    pub fn main_queue(&self) -> &VecDeque<VcpuId> {
        &self.main
    }
    pub fn extra_queue(&self) -> &VecDeque<VcpuId> {
        &self.extra
    }
    pub fn limbo_queue(&self) -> &VecDeque<VcpuId> {
        &self.limbo
    }

    pub fn push(&mut self, kind: QueueKind, vcpu: VcpuId) {
        match kind {
            QueueKind::Main => self.main.push_back(vcpu),
            QueueKind::Extra => self.extra.push_back(vcpu),
            QueueKind::Limbo => self.limbo.push_back(vcpu),
        }
    }

    /// Remove `vcpu` from whichever queue currently holds it, if any.
    pub fn remove(&mut self, vcpu: VcpuId) -> Option<QueueKind> {
        if let Some(pos) = self.main.iter().position(|&v| v == vcpu) {
            self.main.remove(pos);
            return Some(QueueKind::Main);
        }
        if let Some(pos) = self.extra.iter().position(|&v| v == vcpu) {
            self.extra.remove(pos);
            return Some(QueueKind::Extra);
        }
        if let Some(pos) = self.limbo.iter().position(|&v| v == vcpu) {
            self.limbo.remove(pos);
            return Some(QueueKind::Limbo);
        }
        None
    }

    pub fn pop_front(&mut self, kind: QueueKind) -> Option<VcpuId> {
        match kind {
            QueueKind::Main => self.main.pop_front(),
            QueueKind::Extra => self.extra.pop_front(),
            QueueKind::Limbo => self.limbo.pop_front(),
        }
    }

    pub fn is_empty(&self, kind: QueueKind) -> bool {
        match kind {
            QueueKind::Main => self.main.is_empty(),
            QueueKind::Extra => self.extra.is_empty(),
            QueueKind::Limbo => self.limbo.is_empty(),
        }
    }

    pub fn iter(&self, kind: QueueKind) -> std::collections::vec_deque::Iter<'_, VcpuId> {
        match kind {
            QueueKind::Main => self.main.iter(),
            QueueKind::Extra => self.extra.iter(),
            QueueKind::Limbo => self.limbo.iter(),
        }
    }

    /// Clear the preemption snapshot's validity bit. Any write to the
    /// running vcpu's vsmp's vtime in this cell must do this (spec §5).
    pub fn invalidate_preemption_snapshot(&mut self) {
        self.preemption.valid = false;
    }

    /// Bump this pcpu's private group-vtime cache invalidation; done at
    /// the top of every dispatch (spec §4.E step 4).
    pub fn invalidate_group_vtime_cache(&mut self) {
        self.group_vtime_cache = None;
    }

    pub fn start_halt(&mut self, now: Cycles) {
        self.halt_start = Some(now);
    }

    pub fn end_halt(&mut self, now: Cycles) {
        if let Some(start) = self.halt_start.take() {
            self.halted_cycles += now.saturating_sub(start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<VcpuId> {
        let mut sm: SlotMap<VcpuId, ()> = SlotMap::with_key();
        (0..n).map(|_| sm.insert(())).collect()
    }
    fn cell_id() -> CellId {
        let mut sm: SlotMap<CellId, ()> = SlotMap::with_key();
        sm.insert(())
    }

    #[test]
    fn queue_fifo_order_preserved() {
        let mut pcpu = Pcpu::new(0, cell_id(), None);
        let vs = ids(3);
        for v in &vs {
            pcpu.push(QueueKind::Main, *v);
        }
        assert_eq!(pcpu.pop_front(QueueKind::Main), Some(vs[0]));
        assert_eq!(pcpu.pop_front(QueueKind::Main), Some(vs[1]));
    }

    #[test]
    fn remove_finds_vcpu_in_any_queue() {
        let mut pcpu = Pcpu::new(0, cell_id(), None);
        let vs = ids(2);
        pcpu.push(QueueKind::Extra, vs[0]);
        pcpu.push(QueueKind::Limbo, vs[1]);
        assert_eq!(pcpu.remove(vs[0]), Some(QueueKind::Extra));
        assert_eq!(pcpu.remove(vs[1]), Some(QueueKind::Limbo));
        assert_eq!(pcpu.remove(vs[1]), None);
    }
}
