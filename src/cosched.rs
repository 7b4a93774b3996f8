//! Co-scheduling of SMP vsmps (spec §4.F).
//!
//! Sibling vcpus of a multiprocessor vsmp track how far apart their
//! individual progress has drifted ("skew"). When skew grows too large
//! the vsmp is forced into lockstep: running siblings are stopped
//! (`CoStop`) and only restarted together (`CoStart`) once every vcpu
//! that isn't genuinely blocked is ready to run.

use crate::vsmp::{CoRunState, HtSharing, Vsmp};

/// Skew budget before a strict-policy vsmp is forced to stop (cycles,
/// expressed in the vsmp's own vtime units).
pub const STRICT_SKEW_LIMIT: i64 = 1_000_000;

/// Skew budget for the relaxed policy: wider, since relaxed co-sched
/// tolerates more drift before paying the cost of a stop (spec §4.F).
pub const RELAXED_SKEW_LIMIT: i64 = 4_000_000;

/// How a vsmp's co-scheduling aggressiveness is configured (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoschedPolicy {
    Strict,
    Relaxed,
}

/// Update the aggregate intra-vsmp skew counter by `delta_vtime`,
/// clamped at zero (a vsmp that's perfectly in lockstep has skew 0 and
/// can't go negative).
pub fn adjust_skew(vsmp: &mut Vsmp, delta_vtime: i64) {
    let current = vsmp.aggregate_skew as i64;
    vsmp.aggregate_skew = (current + delta_vtime).max(0) as u32;
}

/// Whether the vsmp's accumulated skew now exceeds its policy's
/// skew-out threshold and it should be forced into `CoStop` (spec §4.F
/// "skew-out").
pub fn should_skew_out(vsmp: &Vsmp, policy: CoschedPolicy) -> bool {
    if !vsmp.is_mp() {
        return false;
    }
    let limit = match policy {
        CoschedPolicy::Strict => STRICT_SKEW_LIMIT,
        CoschedPolicy::Relaxed => RELAXED_SKEW_LIMIT,
    };
    vsmp.aggregate_skew as i64 > limit
}

/// Whether two vsmps placed on the same HT package would violate a
/// mixed-package co-scheduling constraint: a strict-policy MP vsmp may
/// not share a package with any other vsmp's vcpu at all (spec §4.F,
/// §4.I).
pub fn violates_mixed_package(a: &Vsmp, b_sharing: HtSharing) -> bool {
    a.is_mp() && a.max_ht_constraint == HtSharing::None && b_sharing != HtSharing::None
}

/// Attempt to transition a vsmp into `CoStop`. Refuses (returns `false`)
/// if any sibling is currently in a wait state that forbids it (spec
/// §4.F `disableCoDeschedule`), to avoid stopping a vcpu that something
/// else is about to wake.
pub fn try_costop(vsmp: &mut Vsmp) -> bool {
    if vsmp.disable_co_deschedule > 0 {
        return false;
    }
    if !matches!(vsmp.co_run_state, CoRunState::CoReady | CoRunState::CoRun) {
        return false;
    }
    vsmp.co_run_state = CoRunState::CoStop;
    vsmp.aggregate_skew = 0;
    true
}

/// Whether a stopped vsmp is now eligible to CoStart: every vcpu that
/// isn't genuinely blocked (`n_wait == n_idle`, i.e. any non-idle
/// waiters have all resolved) is ready to run together (spec §4.F
/// "CoStart condition").
pub fn can_costart(vsmp: &Vsmp) -> bool {
    vsmp.co_run_state == CoRunState::CoStop && vsmp.n_wait == vsmp.n_idle
}

pub fn costart(vsmp: &mut Vsmp) {
    debug_assert!(can_costart(vsmp));
    vsmp.co_run_state = CoRunState::CoReady;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsmp::ExternalAlloc;
    use slotmap::SlotMap;

    fn mp_vsmp() -> Vsmp {
        let mut groups: SlotMap<crate::ids::GroupId, ()> = SlotMap::with_key();
        let mut cells: SlotMap<crate::ids::CellId, ()> = SlotMap::with_key();
        let mut vcpus: SlotMap<crate::ids::VcpuId, ()> = SlotMap::with_key();
        let mut vsmp = Vsmp::new(groups.insert(()), cells.insert(()), ExternalAlloc::unlimited(1000));
        vsmp.add_vcpu(vcpus.insert(()));
        vsmp.add_vcpu(vcpus.insert(()));
        vsmp
    }

    #[test]
    fn uniprocessor_vsmp_never_skews_out() {
        let mut groups: SlotMap<crate::ids::GroupId, ()> = SlotMap::with_key();
        let mut cells: SlotMap<crate::ids::CellId, ()> = SlotMap::with_key();
        let mut vsmp = Vsmp::new(groups.insert(()), cells.insert(()), ExternalAlloc::unlimited(1000));
        vsmp.aggregate_skew = u32::MAX;
        assert!(!should_skew_out(&vsmp, CoschedPolicy::Strict));
        let _ = cells;
    }

    #[test]
    fn strict_policy_skews_out_sooner_than_relaxed() {
        let mut vsmp = mp_vsmp();
        vsmp.aggregate_skew = (STRICT_SKEW_LIMIT + 1) as u32;
        assert!(should_skew_out(&vsmp, CoschedPolicy::Strict));
        assert!(!should_skew_out(&vsmp, CoschedPolicy::Relaxed));
    }

    #[test]
    fn costop_refused_while_a_sibling_holds_disable_co_deschedule() {
        let mut vsmp = mp_vsmp();
        vsmp.disable_co_deschedule = 1;
        assert!(!try_costop(&mut vsmp));
        assert_eq!(vsmp.co_run_state, CoRunState::CoReady);
    }

    #[test]
    fn costart_requires_no_genuine_waiters() {
        let mut vsmp = mp_vsmp();
        try_costop(&mut vsmp);
        vsmp.n_wait = 2;
        vsmp.n_idle = 1;
        assert!(!can_costart(&vsmp));
        vsmp.n_idle = 2;
        assert!(can_costart(&vsmp));
        costart(&mut vsmp);
        assert_eq!(vsmp.co_run_state, CoRunState::CoReady);
    }
}
