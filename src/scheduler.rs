//! The top-level scheduler object: the single owned root that binds
//! cells, the group tree, the dispatcher, the reallocator, and the
//! memory scheduler together (spec design notes: "single owned root
//! object", no global statics).
//!
//! Production code drives this through a timer/IPI/context-switch
//! triggered `tick` per pcpu; tests drive it directly through
//! [`Scheduler::run_for`] against a [`SimClock`].

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use slotmap::SlotMap;

use crate::cell::{can_migrate_vsmp, Cell};
use crate::config::SchedConfig;
use crate::cosched::{self, CoschedPolicy};
use crate::dispatcher::{self, ChooseOutcome};
use crate::error::{Result, ScheduleError};
use crate::group::{GroupTree, NodeAlloc, NodeMemAlloc};
use crate::ht_quarantine;
use crate::ids::{CellId, ClientId, GroupId, VcpuId, VsmpId};
use crate::mem::client::MemClient;
use crate::mem::{self, BalanceResult};
use crate::percpu::QueueKind;
use crate::reallocator;
use crate::time::{Cycles, SimClock, TimeSource};
use crate::vcpu::{AffinityMask, RunState, Vcpu, WaitState};
use crate::vsmp::{CoRunState, ExternalAlloc, Vsmp};

/// Everything needed to stand up a scheduler instance for a test or a
/// host boot.
pub struct SchedulerBuilder {
    pub config: SchedConfig,
    pub total_pcpus: usize,
    pub cell_size: usize,
    pub ht_package_size: usize,
    pub managed_pages: u64,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            config: SchedConfig::default(),
            total_pcpus: 8,
            cell_size: 8,
            ht_package_size: 1,
            managed_pages: 1 << 20,
        }
    }
}

impl SchedulerBuilder {
    pub fn build(self, clock: Arc<dyn TimeSource>) -> Scheduler {
        let total_base_shares = crate::group::BASE_PER_PACKAGE * self.total_pcpus as u64;
        let sizes = crate::cell::partition_cells(self.total_pcpus, self.cell_size, self.ht_package_size);
        let reference_stride = crate::time::stride_for_shares(total_base_shares);
        let cells: SlotMap<CellId, Cell> = {
            let mut sm = SlotMap::with_key();
            for size in sizes {
                sm.insert_with_key(|id| Cell::new(id, size, self.ht_package_size > 1, reference_stride));
            }
            sm
        };
        Scheduler {
            config: self.config,
            clock,
            cells,
            tree: GroupTree::new(total_base_shares),
            vcpus: SlotMap::with_key(),
            vsmps: SlotMap::with_key(),
            clients: SlotMap::with_key(),
            rng: Pcg32::seed_from_u64(0xC0FFEE),
            managed_pages: self.managed_pages,
            reserved_pages: 0,
            free_state: mem::FreeState::High,
            total_base_shares,
            costopped: Vec::new(),
        }
    }
}

/// The scheduler's single owned root object.
pub struct Scheduler {
    pub config: SchedConfig,
    clock: Arc<dyn TimeSource>,
    cells: SlotMap<CellId, Cell>,
    tree: GroupTree,
    vcpus: SlotMap<VcpuId, Vcpu>,
    vsmps: SlotMap<VsmpId, Vsmp>,
    clients: SlotMap<ClientId, MemClient>,
    rng: Pcg32,
    managed_pages: u64,
    reserved_pages: u64,
    free_state: mem::FreeState,
    total_base_shares: u64,
    /// Vcpus held in `ReadyCostop`, outside every pcpu's run queues,
    /// waiting for their vsmp to collect enough free pcpus to co-start.
    costopped: Vec<VcpuId>,
}

impl Scheduler {
    pub fn now(&self) -> Cycles {
        self.clock.get_cycles()
    }

    pub fn tree(&self) -> &GroupTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut GroupTree {
        &mut self.tree
    }

    pub fn vsmp(&self, id: VsmpId) -> Option<&Vsmp> {
        self.vsmps.get(id)
    }

    pub fn vsmp_mut(&mut self, id: VsmpId) -> Option<&mut Vsmp> {
        self.vsmps.get_mut(id)
    }

    pub fn vcpu(&self, id: VcpuId) -> Option<&Vcpu> {
        self.vcpus.get(id)
    }

    fn first_cell(&self) -> CellId {
        self.cells.keys().next().expect("scheduler has at least one cell")
    }

    /// Create a guest group/vsmp leaf and its vcpus in one call (spec
    /// §4.B `AddWorld` + §4.C vcpu creation). Admission-checked against
    /// the parent group's min/max exactly like a bare group create.
    pub fn create_vsmp(
        &mut self,
        parent: GroupId,
        name: impl Into<String>,
        alloc: ExternalAlloc,
        mem_alloc: NodeMemAlloc,
        n_vcpus: usize,
    ) -> Result<VsmpId> {
        if n_vcpus == 0 {
            return Err(ScheduleError::BadParam("vsmp needs at least one vcpu".into()));
        }
        let cell = self.first_cell();
        let root = self.tree.root();
        let vsmp_id = self.vsmps.insert_with_key(|_| Vsmp::new(root, cell, alloc));

        let node_alloc = NodeAlloc::leaf(alloc.min, alloc.max, alloc.shares);
        let leaf = match self
            .tree
            .create_vsmp_leaf(parent, vsmp_id, name, node_alloc, mem_alloc)
        {
            Ok(leaf) => leaf,
            Err(e) => {
                self.vsmps.remove(vsmp_id);
                log::warn!("create_vsmp: admission check failed under {parent:?}: {e}");
                return Err(e);
            }
        };
        self.vsmps[vsmp_id].set_tree_node(leaf);

        let now = self.now();
        for i in 0..n_vcpus {
            let vcpu_id = self.vcpus.insert(Vcpu::new(i, vsmp_id, AffinityMask::ALL));
            self.vcpus[vcpu_id].add(now);
            self.vsmps[vsmp_id].add_vcpu(vcpu_id);
            self.enqueue_ready(vcpu_id);
        }
        self.cells[cell].lock().vsmps.push(vsmp_id);
        reallocator::reallocate(&mut self.tree, self.total_base_shares).ok();
        self.sync_base_from_tree();
        Ok(vsmp_id)
    }

    pub fn create_group(
        &mut self,
        parent: GroupId,
        name: impl Into<String>,
        alloc: NodeAlloc,
        mem_alloc: NodeMemAlloc,
    ) -> Result<GroupId> {
        let id = self.tree.create_group(parent, name, alloc, mem_alloc)?;
        reallocator::reallocate(&mut self.tree, self.total_base_shares).ok();
        self.sync_base_from_tree();
        Ok(id)
    }

    /// Pull each vsmp's freshly-reallocated base shares down from its
    /// tree leaf and derive the stride its vtime accrues at (spec §4.A:
    /// "stride = STRIDE1 / shares", where shares here is the internal
    /// base-share count, not the administrator-declared one).
    fn sync_base_from_tree(&mut self) {
        let ids: Vec<VsmpId> = self.vsmps.keys().collect();
        for id in ids {
            let Some(leaf) = self.tree.leaf_for_vsmp(id) else {
                continue;
            };
            let Some(node) = self.tree.node(leaf) else {
                continue;
            };
            let base = node.base;
            let vsmp = &mut self.vsmps[id];
            vsmp.base.min = base.emin;
            vsmp.base.max = base.emax;
            vsmp.base.shares = base.shares;
            vsmp.vtime.stride = crate::time::stride_for_shares(base.shares.max(1));
        }
    }

    pub fn root(&self) -> GroupId {
        self.tree.root()
    }

    fn enqueue_ready(&mut self, vcpu_id: VcpuId) {
        let vsmp_id = self.vcpus[vcpu_id].vsmp();
        let cell_id = self.vsmps[vsmp_id].cell();
        let bound_lag = self.bound_lag_cycles_as_vtime();
        let mut guard = self.cells[cell_id].lock();
        let cell_vtime = guard.vtime;
        let vsmp = &self.vsmps[vsmp_id];
        let kind = crate::queue::select_queue(vsmp, cell_vtime, bound_lag);
        let idx = guard
            .pcpus
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.main_queue().len() + p.extra_queue().len())
            .map(|(i, _)| i)
            .unwrap_or(0);
        guard.pcpus[idx].push(kind, vcpu_id);
    }

    fn bound_lag_cycles_as_vtime(&self) -> i64 {
        // Treated directly in vtime units for simplicity: the bound-lag
        // window is a vtime quantity, derived from the configured quanta
        // count through the reference stride.
        let cycles_per_ms = 1_000_000;
        self.config.bound_lag_cycles(cycles_per_ms) as i64
    }

    /// Advance the simulated clock by `delta` cycles and run the
    /// dispatcher/charging loop for that interval. This is the test/sim
    /// harness's substitute for the real per-pcpu timer tick.
    pub fn run_for(&mut self, delta: Cycles) {
        if let Some(sim) = self.clock.as_any().downcast_ref::<SimClock>() {
            sim.advance(delta);
        }
        self.tick();
    }

    /// One scheduling pass over every cell/pcpu: dispatch idle pcpus,
    /// charge running vcpus, preempt on quantum expiry, and requeue.
    pub fn tick(&mut self) {
        let now = self.now();
        let quantum_cycles = self.config.cpu_quantum_ms * 1_000;
        let bound_lag = self.bound_lag_cycles_as_vtime();
        let reference_stride = self.total_base_shares;
        let _ = reference_stride;

        let cell_ids: Vec<CellId> = self.cells.keys().collect();
        for cell_id in cell_ids {
            let cell_reference_stride = self.cells[cell_id].reference_stride;
            let mut guard = self.cells[cell_id].lock();
            guard.observe_time(now, cell_reference_stride);
            let cell_vtime = guard.vtime;

            let pcpu_count = guard.pcpus.len();
            for pcpu_idx in 0..pcpu_count {
                // Charge whatever is currently running for the elapsed
                // slice, check quantum expiry, and preempt if needed.
                if let Some(running) = guard.pcpus[pcpu_idx].current {
                    let vsmp_id = self.vcpus[running].vsmp();
                    let elapsed = self.vcpus[running].charge_running(now);
                    let stride = self.vsmps[vsmp_id].vtime.stride.max(1);
                    let delta_vt = crate::time::tc_to_vtime(stride, elapsed);
                    if self.vsmps[vsmp_id].is_ahead(cell_vtime, bound_lag) {
                        self.vsmps[vsmp_id].vtime.extra += delta_vt;
                    } else {
                        self.vsmps[vsmp_id].vtime.main += delta_vt;
                    }

                    if elapsed >= quantum_cycles {
                        self.vcpus[running].preempt(now);
                        guard.pcpus[pcpu_idx].current = None;
                        drop(guard);
                        self.enqueue_ready(running);
                        guard = self.cells[cell_id].lock();
                    }
                }
            }

            // Skew sampling (spec §4.F): a co-running MP vsmp whose
            // siblings have drifted too far out of lockstep gets forced
            // back into `CoStop` even mid-run. Counts are resynced from
            // live vcpu state first since nothing else maintains them
            // incrementally.
            let policy = if self.config.cpu_relaxed_cosched {
                CoschedPolicy::Relaxed
            } else {
                CoschedPolicy::Strict
            };
            let cell_vsmps: std::collections::HashSet<VsmpId> = guard.vsmps.iter().copied().collect();
            for vsmp_id in &cell_vsmps {
                if !self.vsmps[*vsmp_id].is_mp() {
                    continue;
                }
                sync_cosched_counts(&self.vcpus, &mut self.vsmps, *vsmp_id);
                if self.vsmps[*vsmp_id].co_run_state != CoRunState::CoRun {
                    continue;
                }
                let n_run = self.vsmps[*vsmp_id].n_run as i64;
                let siblings = self.vsmps[*vsmp_id].vcpus().len() as i64;
                // Perfectly in lockstep (every sibling running) drains
                // skew back toward zero; any sibling off running costs
                // the group a sample's worth of drift.
                let delta = self.config.cpu_skew_sample_usec as i64 * (siblings - n_run);
                cosched::adjust_skew(&mut self.vsmps[*vsmp_id], delta);
                if !cosched::should_skew_out(&self.vsmps[*vsmp_id], policy) {
                    continue;
                }
                if !cosched::try_costop(&mut self.vsmps[*vsmp_id]) {
                    continue;
                }
                log::debug!("tick: skew-out costop for vsmp {vsmp_id:?} in cell {cell_id:?}");
                let members: Vec<VcpuId> = self.vsmps[*vsmp_id].vcpus().to_vec();
                for vcpu_id in members {
                    if self.vcpus[vcpu_id].run_state() == RunState::Run {
                        if let Some(pcpu) = guard.pcpus.iter_mut().find(|p| p.current == Some(vcpu_id)) {
                            pcpu.current = None;
                        }
                    } else if self.vcpus[vcpu_id].run_state() == RunState::Ready {
                        for pcpu in guard.pcpus.iter_mut() {
                            pcpu.remove(vcpu_id);
                        }
                    }
                    if matches!(self.vcpus[vcpu_id].run_state(), RunState::Run | RunState::Ready) {
                        self.vcpus[vcpu_id].costop(now);
                        self.costopped.push(vcpu_id);
                    }
                }
            }

            // Cross-cell migration probe (spec §4.G): an idle pcpu
            // occasionally checks whether a sibling cell has a
            // migratable vsmp it could pull in, instead of sitting idle
            // with runnable work stuck on the other side of a cell
            // boundary. Jittered per pcpu via `migration_due` so every
            // idle pcpu in a cell doesn't probe in lockstep.
            for pcpu_idx in 0..pcpu_count {
                if guard.pcpus[pcpu_idx].current.is_some() {
                    continue;
                }
                let last_migrate = guard.pcpus[pcpu_idx].last_cell_migrate;
                let due = dispatcher::migration_due(
                    last_migrate,
                    now,
                    self.config.cpu_cell_migrate_period,
                    self.config.cpu_migrate_chance,
                    &mut self.rng,
                );
                if !due {
                    continue;
                }
                guard.pcpus[pcpu_idx].last_cell_migrate = now;
                drop(guard);
                self.try_migrate_into_cell(cell_id);
                guard = self.cells[cell_id].lock();
            }

            // Co-start any vsmp parked in CoStop if the cell has since
            // freed up enough pcpus to run every one of its vcpus at
            // once (spec §4.F CoStart).
            let free_now = guard.pcpus.iter().filter(|p| p.current.is_none()).count();
            let mut pending: std::collections::HashSet<VsmpId> = std::collections::HashSet::new();
            for vcpu_id in &self.costopped {
                let vsmp_id = self.vcpus[*vcpu_id].vsmp();
                if self.vsmps[vsmp_id].cell() == cell_id && self.vsmps[vsmp_id].co_run_state == CoRunState::CoStop {
                    pending.insert(vsmp_id);
                }
            }
            for vsmp_id in pending {
                let needed = self.vsmps[vsmp_id].vcpus().len();
                if free_now < needed {
                    continue;
                }
                sync_cosched_counts(&self.vcpus, &mut self.vsmps, vsmp_id);
                if !cosched::can_costart(&self.vsmps[vsmp_id]) {
                    // A sibling outside the costopped set is still
                    // genuinely blocked; don't bring the group back
                    // together yet (spec §4.F CoStart condition).
                    continue;
                }
                let members: Vec<VcpuId> = self.vsmps[vsmp_id].vcpus().to_vec();
                for vcpu_id in members {
                    if let Some(pos) = self.costopped.iter().position(|v| *v == vcpu_id) {
                        self.costopped.remove(pos);
                        self.vcpus[vcpu_id].costart(now);
                        let idx = guard
                            .pcpus
                            .iter()
                            .enumerate()
                            .min_by_key(|(_, p)| p.main_queue().len() + p.extra_queue().len())
                            .map(|(i, _)| i)
                            .unwrap_or(0);
                        guard.pcpus[idx].push(QueueKind::Main, vcpu_id);
                    }
                }
                cosched::costart(&mut self.vsmps[vsmp_id]);
            }

            // Gather a Run/Idle outcome from every idle pcpu before
            // committing any of them. An MP vsmp only ever gets to run
            // if every one of its vcpus was chosen in this same pass
            // (spec §4.F: it runs on all its pcpus at once or none of
            // them); collecting first instead of dispatching pcpu by
            // pcpu is what makes that check atomic per tick.
            let mut outcomes: Vec<(usize, ChooseOutcome)> = Vec::with_capacity(pcpu_count);
            for pcpu_idx in 0..pcpu_count {
                if guard.pcpus[pcpu_idx].current.is_some() {
                    continue;
                }
                let outcome = dispatcher::choose(
                    &mut guard.pcpus[pcpu_idx],
                    cell_vtime,
                    bound_lag,
                    &self.vcpus,
                    &self.vsmps,
                );
                outcomes.push((pcpu_idx, outcome));
            }

            let mut by_vsmp: std::collections::HashMap<VsmpId, Vec<(usize, VcpuId)>> = std::collections::HashMap::new();
            let mut singles: Vec<(usize, VcpuId)> = Vec::new();
            for (pcpu_idx, outcome) in outcomes {
                match outcome {
                    ChooseOutcome::Run(vcpu_id) => {
                        let vsmp_id = self.vcpus[vcpu_id].vsmp();
                        if self.vsmps[vsmp_id].is_mp() {
                            by_vsmp.entry(vsmp_id).or_default().push((pcpu_idx, vcpu_id));
                        } else {
                            singles.push((pcpu_idx, vcpu_id));
                        }
                    }
                    ChooseOutcome::Idle => {
                        guard.pcpus[pcpu_idx].idle_cycles += quantum_cycles;
                    }
                }
            }

            for (pcpu_idx, vcpu_id) in singles {
                let vsmp_id = self.vcpus[vcpu_id].vsmp();
                if self.vsmp_exceeds_max(vsmp_id, now) {
                    // Already over its hard cap: leave it queued and let
                    // this slice go idle instead.
                    guard.pcpus[pcpu_idx].push(QueueKind::Main, vcpu_id);
                    guard.pcpus[pcpu_idx].idle_cycles += quantum_cycles;
                    continue;
                }
                let vtime = self.vsmps[vsmp_id].vtime.main;
                self.vcpus[vcpu_id].dispatch_onto(pcpu_idx, now, vtime);
                guard.pcpus[pcpu_idx].current = Some(vcpu_id);
            }

            for (vsmp_id, members) in by_vsmp {
                let needed = self.vsmps[vsmp_id].vcpus().len();
                let over_max = self.vsmp_exceeds_max(vsmp_id, now);
                if !over_max && members.len() == needed {
                    let vtime = self.vsmps[vsmp_id].vtime.main;
                    for (pcpu_idx, vcpu_id) in &members {
                        self.vcpus[*vcpu_id].dispatch_onto(*pcpu_idx, now, vtime);
                        guard.pcpus[*pcpu_idx].current = Some(*vcpu_id);
                    }
                    self.vsmps[vsmp_id].co_run_state = CoRunState::CoRun;
                } else if cosched::try_costop(&mut self.vsmps[vsmp_id]) {
                    // Either over its hard cap, or not every sibling was
                    // ready on an idle pcpu at once: hold all of them in
                    // ReadyCostop rather than fragmenting the vsmp across
                    // a partial set of pcpus.
                    log::debug!(
                        "tick: costop vsmp {vsmp_id:?}, {}/{needed} siblings ready in cell {cell_id:?}",
                        members.len()
                    );
                    for (pcpu_idx, vcpu_id) in members {
                        self.vcpus[vcpu_id].costop(now);
                        self.costopped.push(vcpu_id);
                        guard.pcpus[pcpu_idx].idle_cycles += quantum_cycles;
                    }
                } else {
                    // A sibling currently forbids costop (spec §4.F
                    // disableCoDeschedule): leave these vcpus queued
                    // rather than stopping a group something else is
                    // about to wake.
                    for (pcpu_idx, vcpu_id) in members {
                        guard.pcpus[pcpu_idx].push(QueueKind::Main, vcpu_id);
                        guard.pcpus[pcpu_idx].idle_cycles += quantum_cycles;
                    }
                }
            }
        }
    }

    /// Run a periodic reallocation pass now, independent of the
    /// configured period (used by tests and by `reallocNeeded`).
    pub fn reallocate_now(&mut self) -> Result<()> {
        let result = reallocator::reallocate(&mut self.tree, self.total_base_shares);
        self.sync_base_from_tree();
        result
    }

    /// Whether `vsmp_id` has run more than its declared hard max of
    /// total pcpu time since boot. A coarse, directly-measured stand-in
    /// for deriving an exact `vtimeLimit` from competing siblings'
    /// strides (spec §4.D's extra/limbo-queue mechanism, exercised on
    /// its own in `queue.rs`, assumes that richer per-tick accounting).
    fn vsmp_exceeds_max(&self, vsmp_id: VsmpId, now: Cycles) -> bool {
        let vsmp = &self.vsmps[vsmp_id];
        if vsmp.alloc.max >= 100 || now == 0 {
            return false;
        }
        let charged: u64 = vsmp
            .vcpus()
            .iter()
            .filter_map(|v| self.vcpus.get(*v))
            .map(|v| v.charge_cycles_total)
            .sum();
        charged.saturating_mul(100) > now.saturating_mul(vsmp.alloc.max as u64)
    }

    /// Run the HT-quarantine sampler over every vcpu once.
    pub fn sample_ht_quarantine(&mut self, clears_by_vcpu: impl Fn(VcpuId) -> u32) {
        let ids: Vec<VcpuId> = self.vcpus.keys().collect();
        for id in ids {
            let clears = clears_by_vcpu(id);
            let quarantined = self.vsmps[self.vcpus[id].vsmp()].quarantined;
            let vcpu = &mut self.vcpus[id];
            if let Some(new_state) =
                ht_quarantine::sample(&mut vcpu.ht, quarantined, clears, ht_quarantine::SAMPLE_INTERVAL_CYCLES)
            {
                self.vsmps[self.vcpus[id].vsmp()].quarantined = new_state;
            }
        }
    }

    /// Register a memory client and reserve its minimum up front (spec
    /// §4.K admission control for memory).
    pub fn create_mem_client(&mut self, min_pages: u64, max_pages: u64, shares: u32) -> Result<ClientId> {
        let available = self.managed_pages.saturating_sub(self.reserved_pages);
        let after = mem::reserve(min_pages, available, self.managed_pages)?;
        self.reserved_pages = self.managed_pages - after;
        Ok(self.clients.insert_with_key(|id| MemClient::new(id, min_pages, max_pages, shares)))
    }

    pub fn mem_client_mut(&mut self, id: ClientId) -> Option<&mut MemClient> {
        self.clients.get_mut(id)
    }

    pub fn mem_client(&self, id: ClientId) -> Option<&MemClient> {
        self.clients.get(id)
    }

    /// Run one memory-scheduler balance pass over every registered
    /// client (spec §4.J).
    pub fn balance_memory(&mut self) -> BalanceResult {
        let idle_cost = self.config.mem_idle_cost();
        let now = self.now();
        let mut owned: Vec<MemClient> = self.clients.values().cloned().collect();
        let result = mem::balance(&mut owned, self.managed_pages, idle_cost, &self.config, now);
        for updated in owned {
            if let Some(slot) = self.clients.get_mut(updated.id) {
                *slot = updated;
            }
        }
        let free_percent = self.free_percent();
        self.free_state = mem::FreeState::update(self.free_state, free_percent, &self.config);
        result
    }

    fn free_percent(&self) -> u8 {
        if self.managed_pages == 0 {
            return 100;
        }
        let used: u64 = self.clients.values().map(|c| c.allocated_pages).sum();
        let free = self.managed_pages.saturating_sub(used);
        ((free * 100) / self.managed_pages).min(100) as u8
    }

    pub fn free_state(&self) -> mem::FreeState {
        self.free_state
    }

    /// Whether `vsmp_id` may migrate to a different cell right now (spec
    /// §4.G `CanMigrateVsmp`).
    pub fn can_migrate(&self, vsmp_id: VsmpId) -> bool {
        let states: Vec<_> = self.vsmps[vsmp_id]
            .vcpus()
            .iter()
            .map(|v| self.vcpus[*v].run_state())
            .collect();
        can_migrate_vsmp(&states)
    }

    /// Try to pull one migratable vsmp into `dest_cell_id` from a
    /// randomly chosen sibling cell (spec §4.G). Returns whether a
    /// migration happened.
    fn try_migrate_into_cell(&mut self, dest_cell_id: CellId) -> bool {
        let other_cells: Vec<CellId> = self.cells.keys().filter(|id| *id != dest_cell_id).collect();
        if other_cells.is_empty() {
            return false;
        }
        let source_cell_id = other_cells[self.rng.gen_range(0..other_cells.len())];

        let candidate = {
            let Some(source) = self.cells[source_cell_id].try_lock() else {
                return false;
            };
            source
                .vsmps
                .iter()
                .copied()
                .filter(|vsmp_id| {
                    let states: Vec<_> = self.vsmps[*vsmp_id]
                        .vcpus()
                        .iter()
                        .map(|v| self.vcpus[*v].run_state())
                        .collect();
                    can_migrate_vsmp(&states)
                })
                .min_by_key(|vsmp_id| self.vsmps[*vsmp_id].vtime.main)
        };

        let Some(vsmp_id) = candidate else {
            return false;
        };
        self.migrate_vsmp(vsmp_id, source_cell_id, dest_cell_id);
        true
    }

    /// Move `vsmp_id` wholesale from `source_cell_id` to `dest_cell_id`:
    /// drop it from the source cell's membership and run queues, rebind
    /// `vsmp.cell`, add it to the destination cell's membership, and
    /// requeue its ready vcpus there (spec §4.G). A vsmp's vcpus are
    /// moved together so an MP vsmp never ends up with siblings
    /// registered in two cells at once.
    ///
    /// Source and destination cell locks are taken and released one at a
    /// time, never held simultaneously — this crate's `tick` is driven
    /// from a single thread, so the ascending-cell-id lock ordering the
    /// spec describes for true multi-threaded hosts has nothing to
    /// order here.
    fn migrate_vsmp(&mut self, vsmp_id: VsmpId, source_cell_id: CellId, dest_cell_id: CellId) {
        let members: Vec<VcpuId> = self.vsmps[vsmp_id].vcpus().to_vec();

        {
            let mut source = self.cells[source_cell_id].lock();
            source.vsmps.retain(|id| *id != vsmp_id);
            for pcpu in source.pcpus.iter_mut() {
                for vcpu_id in &members {
                    pcpu.remove(*vcpu_id);
                }
            }
        }

        self.vsmps[vsmp_id].set_cell(dest_cell_id);

        let bound_lag = self.bound_lag_cycles_as_vtime();
        let mut dest = self.cells[dest_cell_id].lock();
        dest.vsmps.push(vsmp_id);
        let cell_vtime = dest.vtime;
        for vcpu_id in &members {
            if self.vcpus[*vcpu_id].run_state() != crate::vcpu::RunState::Ready {
                continue;
            }
            let vsmp = &self.vsmps[vsmp_id];
            let kind = crate::queue::select_queue(vsmp, cell_vtime, bound_lag);
            let idx = dest
                .pcpus
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.main_queue().len() + p.extra_queue().len())
                .map(|(i, _)| i)
                .unwrap_or(0);
            dest.pcpus[idx].push(kind, *vcpu_id);
        }
        log::debug!(
            "migrate_vsmp: moved {vsmp_id:?} from cell {source_cell_id:?} to {dest_cell_id:?} ({} vcpus)",
            members.len()
        );
    }
}

/// Resync a vsmp's co-scheduling aggregate counters from its vcpus' live
/// run/wait state (spec §4.F `nRun`/`nWait`/`nIdle`/`disableCoDeschedule`).
/// Nothing updates these incrementally as individual vcpus transition, so
/// `cosched` call sites refresh them just before consulting
/// `can_costart`/`try_costop`. Takes the two slotmaps directly, rather than
/// `&mut Scheduler`, so it can be called while a cell's pcpu lock is held.
fn sync_cosched_counts(vcpus: &SlotMap<VcpuId, Vcpu>, vsmps: &mut SlotMap<VsmpId, Vsmp>, vsmp_id: VsmpId) {
    let members = vsmps[vsmp_id].vcpus().to_vec();
    let mut n_run = 0;
    let mut n_wait = 0;
    let mut n_idle = 0;
    let mut disable_co_deschedule = 0;
    for vcpu_id in members {
        let vcpu = &vcpus[vcpu_id];
        match vcpu.run_state() {
            RunState::Run => n_run += 1,
            RunState::Wait | RunState::BusyWait => {
                n_wait += 1;
                if vcpu.wait_state() == WaitState::Idle {
                    n_idle += 1;
                }
                if vcpu.wait_state().forbids_costop() {
                    disable_co_deschedule += 1;
                }
            }
            _ => {}
        }
    }
    let vsmp = &mut vsmps[vsmp_id];
    vsmp.n_run = n_run;
    vsmp.n_wait = n_wait;
    vsmp.n_idle = n_idle;
    vsmp.disable_co_deschedule = disable_co_deschedule;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::NodeAlloc as GroupNodeAlloc;

    fn test_scheduler() -> (Scheduler, Arc<SimClock>) {
        let clock = Arc::new(SimClock::new(0));
        let scheduler = SchedulerBuilder {
            total_pcpus: 2,
            cell_size: 2,
            ..Default::default()
        }
        .build(clock.clone());
        (scheduler, clock)
    }

    #[test]
    fn two_busy_vsmps_share_a_single_pcpu_over_time() {
        let (mut scheduler, clock) = test_scheduler();
        let root = scheduler.root();
        let _a = scheduler
            .create_vsmp(root, "a", ExternalAlloc::unlimited(1000), NodeMemAlloc::default(), 1)
            .unwrap();
        let _b = scheduler
            .create_vsmp(root, "b", ExternalAlloc::unlimited(3000), NodeMemAlloc::default(), 1)
            .unwrap();
        for _ in 0..500 {
            clock.advance(100_000);
            scheduler.tick();
        }
        // Both vsmps should have accrued some runtime; exact ratios are
        // exercised by the scenario tests under tests/.
        let any_ran = scheduler.vcpus.values().any(|v| v.charge_cycles_total > 0);
        assert!(any_ran);
        let _ = GroupNodeAlloc::leaf(0, 100, 1);
    }

    #[test]
    fn mem_client_admission_respects_managed_pool() {
        let (mut scheduler, _clock) = test_scheduler();
        scheduler.managed_pages = 1000;
        assert!(scheduler.create_mem_client(600, 1000, 1000).is_ok());
        assert_eq!(
            scheduler.create_mem_client(600, 1000, 1000),
            Err(ScheduleError::NoMemory)
        );
    }
}
