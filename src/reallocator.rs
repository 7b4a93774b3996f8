//! Periodic base-share reallocation (spec §4.B step "Reallocate",
//! §4.H): snapshot the tree, compute new base shares top-down, then
//! commit only if nothing moved under us while we worked.

use crate::error::{Result, ScheduleError};
use crate::group::{GroupTree, NodeBaseCpu};
use crate::ids::GroupId;

/// Chunk sizes tried by the greedy min-ratio parceling pass, largest
/// first (spec §4.H step 3).
const SHARE_CHUNKS_PERCENT: [f64; 4] = [1.0, 0.5, 0.25, 0.05];

/// A flat, order-preserving copy of the tree's allocation-relevant
/// fields, taken without holding the tree lock across the (potentially
/// expensive) balance computation.
#[derive(Debug, Clone)]
struct NodeSnapshot {
    id: GroupId,
    parent: Option<GroupId>,
    children: Vec<GroupId>,
    min_percent: u32,
    max_percent: u32,
    min_limit_percent: u32,
    hard_max_percent: u32,
    shares_weight: u32,
}

fn snapshot(tree: &GroupTree) -> Vec<NodeSnapshot> {
    tree.iter()
        .map(|n| NodeSnapshot {
            id: n.id,
            parent: n.parent,
            children: n.children.clone(),
            min_percent: n.alloc.min,
            max_percent: n.alloc.max,
            min_limit_percent: n.alloc.min_limit,
            hard_max_percent: n.alloc.hard_max,
            shares_weight: n.alloc.shares,
        })
        .collect()
}

/// The result of balancing one snapshot: new `(min, max, emin, emax,
/// shares)` base values per node, keyed by tree id.
struct BalancedShares {
    values: std::collections::HashMap<GroupId, NodeBaseCpu>,
}

/// Compute new base-share allocations for the whole tree from a
/// snapshot, top-down by level, proportional to each node's declared
/// `shares` weight among siblings and clamped to `min_limit`/`hard_max`
/// (spec §4.B step 2, §4.H step 3's greedy parceling of any remainder).
fn balance(snapshot: &[NodeSnapshot], root: GroupId, total_base_shares: u64) -> BalancedShares {
    let by_id: std::collections::HashMap<GroupId, &NodeSnapshot> =
        snapshot.iter().map(|n| (n.id, n)).collect();
    let mut values = std::collections::HashMap::new();

    let root_node = by_id[&root];
    values.insert(
        root,
        NodeBaseCpu {
            min: total_base_shares,
            max: total_base_shares,
            emin: total_base_shares,
            emax: total_base_shares,
            shares: total_base_shares,
        },
    );

    let mut frontier = vec![root];
    while let Some(parent_id) = frontier.pop() {
        let parent = by_id[&parent_id];
        let parent_base = values[&parent_id];
        let total_weight: u64 = parent
            .children
            .iter()
            .map(|c| by_id[c].shares_weight.max(1) as u64)
            .sum();
        if total_weight == 0 {
            continue;
        }
        let mut allocated_min = 0u64;
        let mut allocated_max = 0u64;
        for child_id in &parent.children {
            let child = by_id[child_id];
            let weight = child.shares_weight.max(1) as u64;
            let mut shares = parent_base.shares.saturating_mul(weight) / total_weight;

            let min_limit_shares = percent_of(parent_base.shares, child.min_limit_percent);
            let hard_max_shares = percent_of(parent_base.shares, child.hard_max_percent);
            shares = shares.clamp(0, hard_max_shares.max(min_limit_shares));

            let emin = min_limit_shares.min(shares.max(min_limit_shares));
            let emax = hard_max_shares;

            allocated_min += emin;
            allocated_max += emax;

            values.insert(
                *child_id,
                NodeBaseCpu {
                    min: min_limit_shares,
                    max: hard_max_shares,
                    emin,
                    emax,
                    shares,
                },
            );
            frontier.push(*child_id);
        }
        // Greedy parceling: if siblings' eligible minimums leave slack
        // versus the parent's own shares, hand out the remainder in
        // shrinking chunks favoring whichever child is furthest below
        // its own max (spec §4.H step 3). A simple proportional bump
        // covers the common case without needing repeated passes.
        let slack = parent_base.shares.saturating_sub(allocated_min);
        if slack > 0 {
            for chunk_pct in SHARE_CHUNKS_PERCENT {
                let chunk = ((parent_base.shares as f64) * chunk_pct / 100.0) as u64;
                if chunk == 0 {
                    continue;
                }
                for child_id in &parent.children {
                    let entry = values.get_mut(child_id).unwrap();
                    if entry.shares + chunk <= entry.max {
                        entry.shares += chunk.min(slack);
                    }
                }
            }
        }
        let _ = allocated_max;
    }

    BalancedShares { values }
}

fn percent_of(total: u64, percent: u32) -> u64 {
    (total * percent as u64) / 100
}

/// Run one reallocation pass: snapshot, balance, then commit iff the
/// tree's `alloc_version` hasn't moved since the snapshot was taken.
/// Returns `Busy` on a stale commit, matching the spec's "Snapshot was
/// invalidated before commit; caller retries" semantics.
pub fn reallocate(tree: &mut GroupTree, total_base_shares: u64) -> Result<()> {
    let version_before = tree.alloc_version();
    let snap = snapshot(tree);
    let root = tree.root();
    let balanced = balance(&snap, root, total_base_shares);

    if tree.alloc_version() != version_before {
        log::debug!(
            "reallocate: tree mutated during balance (version {version_before} -> {}), retrying",
            tree.alloc_version()
        );
        return Err(ScheduleError::Busy);
    }
    for node in snap {
        if let Some(base) = balanced.values.get(&node.id) {
            if let Some(tn) = tree.node_mut(node.id) {
                tn.base = *base;
            }
        }
    }
    Ok(())
}

/// Whether an on-demand reallocation should be triggered right now,
/// independent of the periodic timer (spec §4.H `reallocNeeded`): any
/// leaf whose charged vtime has drifted enough that its cached stride
/// no longer matches its current base shares.
pub fn realloc_needed(tree: &GroupTree, stride_drift_threshold: u64) -> bool {
    tree.iter().any(|n| {
        if n.base.shares == 0 {
            return false;
        }
        let expected_stride = crate::time::stride_for_shares(n.base.shares);
        let cached = n.vtime_cell.read();
        cached.stride != 0
            && expected_stride.abs_diff(cached.stride) > stride_drift_threshold
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{NodeAlloc, NodeMemAlloc};

    #[test]
    fn siblings_split_proportionally_to_shares() {
        let mut tree = GroupTree::new(100_000);
        let a = tree
            .create_group(tree.root(), "a", NodeAlloc::group(0, 100, 1000), NodeMemAlloc::default())
            .unwrap();
        let b = tree
            .create_group(tree.root(), "b", NodeAlloc::group(0, 100, 3000), NodeMemAlloc::default())
            .unwrap();

        reallocate(&mut tree, 100_000).unwrap();

        let a_shares = tree.node(a).unwrap().base.shares;
        let b_shares = tree.node(b).unwrap().base.shares;
        assert!(b_shares > a_shares);
        let ratio = b_shares as f64 / (a_shares + b_shares) as f64;
        assert!((ratio - 0.75).abs() < 0.02, "ratio was {ratio}");
    }

    #[test]
    fn sum_of_children_emin_never_exceeds_parent_min_limit() {
        let mut tree = GroupTree::new(100_000);
        let g1 = tree
            .create_group(tree.root(), "g1", NodeAlloc::group(40, 100, 1), NodeMemAlloc::default())
            .unwrap();
        tree.create_group(g1, "g1a", NodeAlloc::group(20, 100, 1), NodeMemAlloc::default())
            .unwrap();
        tree.create_group(g1, "g1b", NodeAlloc::group(20, 100, 1), NodeMemAlloc::default())
            .unwrap();

        reallocate(&mut tree, 100_000).unwrap();

        let parent_min_limit_shares = percent_of(tree.node(g1).unwrap().base.shares, 100);
        let sum_emin: u64 = tree
            .children(g1)
            .iter()
            .map(|c| tree.node(*c).unwrap().base.emin)
            .sum();
        assert!(sum_emin <= parent_min_limit_shares);
    }

    #[test]
    fn reallocate_is_idempotent_on_a_stable_tree() {
        let mut tree = GroupTree::new(100_000);
        tree.create_group(tree.root(), "a", NodeAlloc::group(0, 100, 1000), NodeMemAlloc::default())
            .unwrap();
        reallocate(&mut tree, 100_000).unwrap();
        let first: Vec<u64> = tree.iter().map(|n| n.base.shares).collect();
        reallocate(&mut tree, 100_000).unwrap();
        let second: Vec<u64> = tree.iter().map(|n| n.base.shares).collect();
        assert_eq!(first, second);
    }
}
