//! Virtual CPU (vCPU) state machine (spec §3, §4.C).
//!
//! A [`Vcpu`] is one schedulable world. Its `runState` and `waitState`
//! drive every other component: run queues place it by `runState`,
//! co-scheduling holds it in `ReadyCostop`, and wait-state accounting
//! credits its owning vsmp for time spent blocked.
//!
//! # State machine
//!
//! ```text
//! New ──Add──▶ Ready
//! Ready ──Dispatcher picks──▶ Run
//! Run ──Preempt──▶ Ready
//! Run ──Wait(event, waitState)──▶ Wait
//! Wait ──Wakeup──▶ Ready
//! Wait ──(can-busy-wait)──▶ BusyWait
//! BusyWait ──Wakeup or cond──▶ Run or Wait
//! Run/Ready ──CoStop──▶ ReadyCostop
//! Ready ──CoSchedule peer──▶ ReadyCorun
//! ReadyCorun ──Dispatcher on target pcpu──▶ Run
//! Any ──Remove──▶ Zombie
//! ```

use crate::ids::{PcpuIndex, VsmpId};
use crate::metrics::Meter;
use crate::time::{Cycles, Vtime};

/// Run-state of a vcpu (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    New,
    Ready,
    ReadyCorun,
    ReadyCostop,
    Run,
    Wait,
    BusyWait,
    Zombie,
}

impl RunState {
    /// Index into the fixed-size per-runState meter array.
    pub const COUNT: usize = 8;
    fn index(self) -> usize {
        match self {
            RunState::New => 0,
            RunState::Ready => 1,
            RunState::ReadyCorun => 2,
            RunState::ReadyCostop => 3,
            RunState::Run => 4,
            RunState::Wait => 5,
            RunState::BusyWait => 6,
            RunState::Zombie => 7,
        }
    }
}

/// Wait-state of a vcpu that is blocked (spec §3). `Idle` is the special
/// "nothing to run" wait used by the co-scheduling aggregate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitState {
    None,
    Idle,
    Rpc,
    Semaphore,
    Lock,
    Mem,
    Net,
    Scsi,
    Driver,
    Sleep,
}

impl WaitState {
    pub const COUNT: usize = 10;
    fn index(self) -> usize {
        match self {
            WaitState::None => 0,
            WaitState::Idle => 1,
            WaitState::Rpc => 2,
            WaitState::Semaphore => 3,
            WaitState::Lock => 4,
            WaitState::Mem => 5,
            WaitState::Net => 6,
            WaitState::Scsi => 7,
            WaitState::Driver => 8,
            WaitState::Sleep => 9,
        }
    }

    /// Certain wait states forbid CoStop to avoid deadlock (spec §4.F):
    /// a vcpu parked on an RPC reply, a semaphore, or a lock must not be
    /// yanked out from under the code that's waiting to wake it.
    pub fn forbids_costop(self) -> bool {
        matches!(self, WaitState::Rpc | WaitState::Semaphore | WaitState::Lock)
    }
}

/// An affinity mask over physical cpus, represented as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityMask(pub u64);

impl AffinityMask {
    pub const ALL: AffinityMask = AffinityMask(u64::MAX);

    pub fn single(pcpu: PcpuIndex) -> Self {
        AffinityMask(1u64 << (pcpu as u32).min(63))
    }

    pub fn allows(&self, pcpu: PcpuIndex) -> bool {
        pcpu < 64 && (self.0 & (1u64 << pcpu)) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_joint(&self, other: &AffinityMask) -> bool {
        (self.0 & other.0) != 0
    }
}

/// Exponentially-weighted moving average of HT machine-clear events, used
/// by HT quarantine (spec §4.I).
#[derive(Debug, Clone, Copy, Default)]
pub struct HtInterference {
    pub slow_avg: f64,
    pub fast_avg: f64,
}

impl HtInterference {
    const SLOW_WEIGHT: f64 = 0.05;
    const FAST_WEIGHT: f64 = 0.33;

    /// Fold in a new sample: `clears` machine-clear events seen over
    /// `cycles` cycles of run time, expressed per million cycles.
    pub fn sample(&mut self, clears: u32, cycles: Cycles) {
        if cycles == 0 {
            return;
        }
        let rate = (clears as f64) * 1_000_000.0 / (cycles as f64);
        self.slow_avg = self.slow_avg * (1.0 - Self::SLOW_WEIGHT) + rate * Self::SLOW_WEIGHT;
        self.fast_avg = self.fast_avg * (1.0 - Self::FAST_WEIGHT) + rate * Self::FAST_WEIGHT;
    }

    pub fn max_rate(&self) -> f64 {
        self.slow_avg.max(self.fast_avg)
    }
}

/// A single virtual processor.
pub struct Vcpu {
    id: usize,
    vsmp: VsmpId,
    pcpu: Option<PcpuIndex>,
    last_pcpu: Option<PcpuIndex>,

    run_state: RunState,
    wait_state: WaitState,
    wait_event: u64,

    affinity: AffinityMask,
    action_wakeup_mask: u64,

    run_meters: [Meter; RunState::COUNT],
    wait_meters: [Meter; WaitState::COUNT],
    limbo_meter: Meter,
    wakeup_latency_meter: Meter,

    pub charge_cycles_total: u64,
    pub sys_cycles_total: u64,
    pub sys_overlap_total: u64,
    pub charge_start: Cycles,

    pub ht: HtInterference,
    pub intra_skew: u32,
}

impl Vcpu {
    pub fn new(id: usize, vsmp: VsmpId, affinity: AffinityMask) -> Self {
        Self {
            id,
            vsmp,
            pcpu: None,
            last_pcpu: None,
            run_state: RunState::New,
            wait_state: WaitState::None,
            wait_event: 0,
            affinity,
            action_wakeup_mask: 0,
            run_meters: Default::default(),
            wait_meters: Default::default(),
            limbo_meter: Meter::default(),
            wakeup_latency_meter: Meter::default(),
            charge_cycles_total: 0,
            sys_cycles_total: 0,
            sys_overlap_total: 0,
            charge_start: 0,
            ht: HtInterference::default(),
            intra_skew: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn vsmp(&self) -> VsmpId {
        self.vsmp
    }

    pub fn pcpu(&self) -> Option<PcpuIndex> {
        self.pcpu
    }

    pub fn last_pcpu(&self) -> Option<PcpuIndex> {
        self.last_pcpu
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn wait_state(&self) -> WaitState {
        self.wait_state
    }

    pub fn wait_event(&self) -> u64 {
        self.wait_event
    }

    pub fn affinity(&self) -> AffinityMask {
        self.affinity
    }

    pub fn set_affinity(&mut self, mask: AffinityMask) {
        self.affinity = mask;
    }

    pub fn meter(&self, state: RunState) -> &Meter {
        &self.run_meters[state.index()]
    }

    pub fn wait_meter(&self, state: WaitState) -> &Meter {
        &self.wait_meters[state.index()]
    }

    pub fn limbo_meter(&self) -> &Meter {
        &self.limbo_meter
    }

    pub fn wakeup_latency_meter(&self) -> &Meter {
        &self.wakeup_latency_meter
    }

    /// Raw state assignment used only by startup/teardown and by the
    /// invariant-checked transition helpers below; never call directly
    /// from dispatcher code.
    fn set_run_state(&mut self, new: RunState, now: Cycles, vtime: Option<Vtime>) {
        if self.run_state != new {
            self.run_meters[self.run_state.index()].exit(now);
        }
        self.run_state = new;
        self.run_meters[new.index()].enter(now, vtime);
    }

    /// `NEW -> READY`, invoked by `AddWorld`.
    pub fn add(&mut self, now: Cycles) {
        debug_assert_eq!(self.run_state, RunState::New);
        self.set_run_state(RunState::Ready, now, None);
    }

    /// `READY | READY_CORUN -> RUN`, invoked by the dispatcher.
    pub fn dispatch_onto(&mut self, pcpu: PcpuIndex, now: Cycles, vtime: Vtime) {
        debug_assert!(matches!(
            self.run_state,
            RunState::Ready | RunState::ReadyCorun
        ));
        self.last_pcpu = self.pcpu;
        self.pcpu = Some(pcpu);
        self.charge_start = now;
        self.set_run_state(RunState::Run, now, Some(vtime));
    }

    /// `RUN -> READY`, a preemption.
    pub fn preempt(&mut self, now: Cycles) {
        debug_assert_eq!(self.run_state, RunState::Run);
        self.charge_cycles_total += now.saturating_sub(self.charge_start);
        self.set_run_state(RunState::Ready, now, None);
    }

    /// `RUN -> WAIT(event, waitState)`.
    pub fn wait(&mut self, event: u64, wait_state: WaitState, now: Cycles, vsmp_vtime: Vtime) {
        debug_assert_eq!(self.run_state, RunState::Run);
        self.charge_cycles_total += now.saturating_sub(self.charge_start);
        self.wait_event = event;
        self.wait_state = wait_state;
        self.wait_meters[wait_state.index()].enter(now, Some(vsmp_vtime));
        self.set_run_state(RunState::Wait, now, None);
    }

    /// `WAIT -> READY`, a wakeup. Returns the elapsed real-time cycles
    /// spent waiting (for the wakeup-latency meter) and the vtime the
    /// wait started at (for bound-lag credit), so the caller can settle
    /// both without this module knowing about vsmp internals.
    pub fn wakeup(&mut self, now: Cycles) -> (Cycles, Option<Vtime>) {
        debug_assert!(matches!(
            self.run_state,
            RunState::Wait | RunState::BusyWait
        ));
        let vtime_start = self.wait_meters[self.wait_state.index()].vtime_start;
        let elapsed = self.wait_meters[self.wait_state.index()].exit(now);
        self.wait_state = WaitState::None;
        self.set_run_state(RunState::Ready, now, None);
        (elapsed, vtime_start)
    }

    /// `WAIT -> BUSY_WAIT`, when the caller decides it can spin rather
    /// than fully deschedule (e.g. a very short expected wait).
    pub fn enter_busy_wait(&mut self, now: Cycles) {
        debug_assert_eq!(self.run_state, RunState::Wait);
        self.set_run_state(RunState::BusyWait, now, None);
    }

    /// `BUSY_WAIT -> RUN`, the condition became true before deschedule.
    pub fn busy_wait_resolves_to_run(&mut self, pcpu: PcpuIndex, now: Cycles, vtime: Vtime) {
        debug_assert_eq!(self.run_state, RunState::BusyWait);
        self.dispatch_onto(pcpu, now, vtime);
    }

    /// `BUSY_WAIT -> WAIT`, spinning gave up and the vcpu truly blocks.
    pub fn busy_wait_resolves_to_wait(&mut self, now: Cycles, vsmp_vtime: Vtime) {
        debug_assert_eq!(self.run_state, RunState::BusyWait);
        self.wait_state = WaitState::Sleep;
        self.wait_meters[WaitState::Sleep.index()].enter(now, Some(vsmp_vtime));
        self.set_run_state(RunState::Wait, now, None);
    }

    /// `RUN | READY -> READY_COSTOP`.
    pub fn costop(&mut self, now: Cycles) {
        debug_assert!(matches!(self.run_state, RunState::Run | RunState::Ready));
        if self.run_state == RunState::Run {
            self.charge_cycles_total += now.saturating_sub(self.charge_start);
        }
        self.set_run_state(RunState::ReadyCostop, now, None);
    }

    /// `READY_COSTOP -> READY`, the vsmp is allowed to co-start again.
    pub fn costart(&mut self, now: Cycles) {
        debug_assert_eq!(self.run_state, RunState::ReadyCostop);
        self.set_run_state(RunState::Ready, now, None);
    }

    /// `READY -> READY_CORUN`, this vcpu was selected as a mandatory
    /// co-schedule sibling and is waiting for its target pcpu to pick it
    /// up via the handoff slot.
    pub fn mark_corun(&mut self, now: Cycles) {
        debug_assert_eq!(self.run_state, RunState::Ready);
        self.set_run_state(RunState::ReadyCorun, now, None);
    }

    /// Any state `-> ZOMBIE`, invoked by `RemoveWorld`.
    pub fn remove(&mut self, now: Cycles) {
        if self.run_state == RunState::Run {
            self.charge_cycles_total += now.saturating_sub(self.charge_start);
        }
        self.pcpu = None;
        self.set_run_state(RunState::Zombie, now, None);
    }

    /// Charge the currently-running vcpu for cycles consumed so far
    /// without a state transition (used by the quantum-expiry check and
    /// by periodic credit aging).
    pub fn charge_running(&mut self, now: Cycles) -> Cycles {
        debug_assert_eq!(self.run_state, RunState::Run);
        let elapsed = now.saturating_sub(self.charge_start);
        self.charge_cycles_total += elapsed;
        self.charge_start = now;
        elapsed
    }

    pub fn post_action(&mut self, mask: u64) {
        self.action_wakeup_mask |= mask;
    }

    pub fn pending_action_mask(&self) -> u64 {
        self.action_wakeup_mask
    }

    pub fn clear_action_mask(&mut self, mask: u64) {
        self.action_wakeup_mask &= !mask;
    }

    /// Whether this vcpu's current wait state forbids CoStop of its vsmp.
    pub fn forbids_costop(&self) -> bool {
        self.run_state == RunState::Wait && self.wait_state.forbids_costop()
    }
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("vsmp", &self.vsmp)
            .field("run_state", &self.run_state)
            .field("wait_state", &self.wait_state)
            .field("pcpu", &self.pcpu)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn dummy_vsmp_id() -> VsmpId {
        let mut sm: SlotMap<VsmpId, ()> = SlotMap::with_key();
        sm.insert(())
    }

    #[test]
    fn basic_lifecycle() {
        let mut vcpu = Vcpu::new(0, dummy_vsmp_id(), AffinityMask::ALL);
        assert_eq!(vcpu.run_state(), RunState::New);
        vcpu.add(0);
        assert_eq!(vcpu.run_state(), RunState::Ready);
        vcpu.dispatch_onto(0, 100, 0);
        assert_eq!(vcpu.run_state(), RunState::Run);
        vcpu.preempt(200);
        assert_eq!(vcpu.run_state(), RunState::Ready);
        assert_eq!(vcpu.charge_cycles_total, 100);
    }

    #[test]
    fn wait_wakeup_roundtrip() {
        let mut vcpu = Vcpu::new(0, dummy_vsmp_id(), AffinityMask::ALL);
        vcpu.add(0);
        vcpu.dispatch_onto(0, 0, 0);
        vcpu.wait(42, WaitState::Net, 500, 10);
        assert_eq!(vcpu.run_state(), RunState::Wait);
        assert_eq!(vcpu.wait_event(), 42);
        let (elapsed, vtime_start) = vcpu.wakeup(700);
        assert_eq!(elapsed, 200);
        assert_eq!(vtime_start, Some(10));
        assert_eq!(vcpu.run_state(), RunState::Ready);
    }

    #[test]
    fn rpc_wait_forbids_costop() {
        let mut vcpu = Vcpu::new(0, dummy_vsmp_id(), AffinityMask::ALL);
        vcpu.add(0);
        vcpu.dispatch_onto(0, 0, 0);
        vcpu.wait(1, WaitState::Rpc, 0, 0);
        assert!(vcpu.forbids_costop());
    }

    #[test]
    fn affinity_mask_basic() {
        let mask = AffinityMask::single(3);
        assert!(mask.allows(3));
        assert!(!mask.allows(4));
        assert_eq!(mask.count(), 1);
    }
}
