//! The hierarchical group tree (spec §3, §4.B).
//!
//! Each node is either an internal group or a vsmp leaf; the distinction
//! is a tag rather than separate Rust types; per the design notes, cycles
//! are forbidden by construction (there is no API to attach a node to
//! more than one parent, and destruction requires emptiness).

use std::collections::HashMap;

use slotmap::SlotMap;

use crate::error::{Result, ScheduleError};
use crate::ids::{GroupId, VsmpId};
use crate::sync::SeqLock;
use crate::time::Vtime;
use crate::vsmp::AllocUnits;

/// Total base shares available to the whole tree: `base_per_package *
/// package_count` (spec GLOSSARY).
pub const BASE_PER_PACKAGE: u64 = 10_000;

/// A node is either an internal group or the tree-side record for a
/// vsmp's allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Vsmp(VsmpId),
}

/// External, administrator-declared CPU allocation for a tree node. For
/// a vsmp leaf, `min_limit == min` and `hard_max == max` by construction
/// (spec §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAlloc {
    pub min: u32,
    pub max: u32,
    pub min_limit: u32,
    pub hard_max: u32,
    pub shares: u32,
    pub units: AllocUnits,
}

impl NodeAlloc {
    pub fn leaf(min: u32, max: u32, shares: u32) -> Self {
        Self {
            min,
            max,
            min_limit: min,
            hard_max: max,
            shares,
            units: AllocUnits::Percent,
        }
    }

    pub fn group(min_limit: u32, hard_max: u32, shares: u32) -> Self {
        Self {
            min: min_limit,
            max: hard_max,
            min_limit,
            hard_max,
            shares,
            units: AllocUnits::Percent,
        }
    }
}

/// External memory allocation for a tree node, percent-of-managed-memory
/// or an explicit size depending on `auto_min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMemAlloc {
    pub min_pages: u64,
    pub max_pages: u64,
    pub shares: u32,
    /// If true, `min_pages` is computed by the memory scheduler's
    /// `autoMins` pass (spec §4.J step 2) instead of being administrator
    /// supplied.
    pub auto_min: bool,
}

/// Internal, recomputed-by-the-reallocator CPU base allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeBaseCpu {
    pub min: u64,
    pub max: u64,
    pub emin: u64,
    pub emax: u64,
    pub shares: u64,
}

/// Internal memory base allocation (spec §3 Group data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeBaseMem {
    pub base_min: u64,
    pub base_max: u64,
    pub e_min: u64,
    pub e_max: u64,
    pub base_shares: u64,
}

/// The (vtime, stride, vtimeLimit) triple published for lock-free
/// readers — the per-pcpu group-vtime cache in spec §4.A.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupVtimeSnapshot {
    pub vtime: Vtime,
    pub stride: u64,
    pub vtime_limit: Vtime,
}

pub struct TreeNode {
    pub id: GroupId,
    pub name: String,
    pub parent: Option<GroupId>,
    pub kind: NodeKind,
    pub children: Vec<GroupId>,
    pub alloc: NodeAlloc,
    pub mem_alloc: NodeMemAlloc,
    pub base: NodeBaseCpu,
    pub mem_base: NodeBaseMem,
    pub vsmp_count: u32,
    /// Lock-free-readable (vtime, stride, vtimeLimit); written under the
    /// tree lock or a cell lock, read without any lock from the dispatch
    /// fast path (spec §4.A extra-compare).
    pub vtime_cell: SeqLock<GroupVtimeSnapshot>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Vsmp(_))
    }
}

/// The group tree. Owned by the top-level scheduler under a single tree
/// lock (spec §5 lock order: EventQueue -> cells -> tree).
pub struct GroupTree {
    nodes: SlotMap<GroupId, TreeNode>,
    root: GroupId,
    vsmp_leaves: HashMap<VsmpId, GroupId>,
    /// Bumped on every alloc-affecting mutation; the reallocator uses it
    /// to detect a stale snapshot (spec §4.H step 4).
    alloc_version: u64,
}

impl GroupTree {
    pub fn new(total_base_shares: u64) -> Self {
        let mut nodes = SlotMap::with_key();
        let root_alloc = NodeAlloc::group(100, 100, 1);
        let root_id = nodes.insert_with_key(|id| TreeNode {
            id,
            name: "root".to_string(),
            parent: None,
            kind: NodeKind::Group,
            children: Vec::new(),
            alloc: root_alloc,
            mem_alloc: NodeMemAlloc::default(),
            base: NodeBaseCpu {
                min: total_base_shares,
                max: total_base_shares,
                emin: total_base_shares,
                emax: total_base_shares,
                shares: total_base_shares,
            },
            mem_base: NodeBaseMem::default(),
            vsmp_count: 0,
            vtime_cell: SeqLock::new(GroupVtimeSnapshot::default()),
        });
        Self {
            nodes,
            root: root_id,
            vsmp_leaves: HashMap::new(),
            alloc_version: 0,
        }
    }

    pub fn root(&self) -> GroupId {
        self.root
    }

    pub fn node(&self, id: GroupId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: GroupId) -> Option<&mut TreeNode> {
        self.nodes.get_mut(id)
    }

    pub fn alloc_version(&self) -> u64 {
        self.alloc_version
    }

    pub fn leaf_for_vsmp(&self, vsmp: VsmpId) -> Option<GroupId> {
        self.vsmp_leaves.get(&vsmp).copied()
    }

    /// Sum of `base.emin`/`base.emax` already reserved by `parent`'s
    /// existing children (spec §4.B/§4.K admission walk).
    fn reserved(&self, parent: GroupId) -> (u64, u64) {
        let node = &self.nodes[parent];
        node.children.iter().fold((0u64, 0u64), |(emin, emax), c| {
            let child = &self.nodes[*c];
            (emin + child.base.emin, emax + child.base.emax)
        })
    }

    /// Walk from `parent` up to the root, checking that adding a node
    /// requiring `req_min`/`req_max` base-share units does not exceed any
    /// ancestor's `minLimit`/`max` once existing reservations are counted
    /// (spec §4.B, §4.K).
    pub fn admission_check(&self, parent: GroupId, req_min: u64, req_max: u64) -> Result<()> {
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            let node = self
                .nodes
                .get(id)
                .ok_or(ScheduleError::NotFound)?;
            let (reserved_emin, reserved_emax) = self.reserved(id);
            let min_limit_shares = percent_to_shares(node.alloc.min_limit, total_shares(self));
            let hard_max_shares = percent_to_shares(node.alloc.hard_max, total_shares(self));
            if reserved_emin + req_min > min_limit_shares {
                return Err(ScheduleError::AdmitFailed);
            }
            if reserved_emax + req_max > hard_max_shares {
                return Err(ScheduleError::AdmitFailed);
            }
            cursor = node.parent;
        }
        Ok(())
    }

    fn insert_node(
        &mut self,
        parent: GroupId,
        name: String,
        kind: NodeKind,
        alloc: NodeAlloc,
        mem_alloc: NodeMemAlloc,
    ) -> Result<GroupId> {
        let total = total_shares(self);
        let req_min = percent_to_shares(alloc.min, total);
        let req_max = percent_to_shares(alloc.max, total);
        self.admission_check(parent, req_min, req_max)?;

        let id = self.nodes.insert_with_key(|id| TreeNode {
            id,
            name,
            parent: Some(parent),
            kind,
            children: Vec::new(),
            alloc,
            mem_alloc,
            base: NodeBaseCpu::default(),
            mem_base: NodeBaseMem::default(),
            vsmp_count: 0,
            vtime_cell: SeqLock::new(GroupVtimeSnapshot::default()),
        });
        self.nodes[parent].children.push(id);
        if let NodeKind::Vsmp(vsmp_id) = kind {
            self.vsmp_leaves.insert(vsmp_id, id);
        }
        self.alloc_version += 1;
        Ok(id)
    }

    pub fn create_group(
        &mut self,
        parent: GroupId,
        name: impl Into<String>,
        alloc: NodeAlloc,
        mem_alloc: NodeMemAlloc,
    ) -> Result<GroupId> {
        self.insert_node(parent, name.into(), NodeKind::Group, alloc, mem_alloc)
    }

    pub fn create_vsmp_leaf(
        &mut self,
        parent: GroupId,
        vsmp: VsmpId,
        name: impl Into<String>,
        alloc: NodeAlloc,
        mem_alloc: NodeMemAlloc,
    ) -> Result<GroupId> {
        self.insert_node(parent, name.into(), NodeKind::Vsmp(vsmp), alloc, mem_alloc)
    }

    /// Destroy a leaf or an empty group. Fails with `NotFound` if the
    /// node is unknown, or `Busy` if a group still has members.
    pub fn destroy(&mut self, id: GroupId) -> Result<()> {
        if id == self.root {
            return Err(ScheduleError::BadParam("cannot destroy root".into()));
        }
        let node = self.nodes.get(id).ok_or(ScheduleError::NotFound)?;
        if !node.children.is_empty() {
            return Err(ScheduleError::Busy);
        }
        let parent = node.parent;
        let kind = node.kind;
        self.nodes.remove(id);
        if let Some(parent) = parent {
            self.nodes[parent].children.retain(|c| *c != id);
        }
        if let NodeKind::Vsmp(vsmp_id) = kind {
            self.vsmp_leaves.remove(&vsmp_id);
        }
        self.alloc_version += 1;
        Ok(())
    }

    /// Update a node's external allocation in place, admission-checked
    /// against its siblings exactly like creation (spec §4.K: "do the
    /// same with the client's min and max").
    pub fn set_alloc(&mut self, id: GroupId, new_alloc: NodeAlloc) -> Result<()> {
        let node = self.nodes.get(id).ok_or(ScheduleError::NotFound)?;
        let parent = node.parent;
        let old_reserved = (node.base.emin, node.base.emax);
        if let Some(parent) = parent {
            let total = total_shares(self);
            let req_min = percent_to_shares(new_alloc.min, total);
            let req_max = percent_to_shares(new_alloc.max, total);
            // Temporarily subtract this node's own current reservation
            // from its parent's reserved total before checking the new
            // requirement, since it's being replaced, not added fresh.
            let (sib_emin, sib_emax) = self.reserved(parent);
            let sib_emin = sib_emin.saturating_sub(old_reserved.0);
            let sib_emax = sib_emax.saturating_sub(old_reserved.1);
            let min_limit_shares =
                percent_to_shares(self.nodes[parent].alloc.min_limit, total);
            let hard_max_shares = percent_to_shares(self.nodes[parent].alloc.hard_max, total);
            if sib_emin + req_min > min_limit_shares || sib_emax + req_max > hard_max_shares {
                return Err(ScheduleError::AdmitFailed);
            }
        }
        self.nodes[id].alloc = new_alloc;
        self.alloc_version += 1;
        Ok(())
    }

    pub fn children(&self, id: GroupId) -> &[GroupId] {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent_chain(&self, id: GroupId) -> Vec<GroupId> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            chain.push(cur);
            cursor = self.nodes.get(cur).and_then(|n| n.parent);
        }
        chain.reverse();
        chain
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.values()
    }
}

fn total_shares(tree: &GroupTree) -> u64 {
    tree.nodes[tree.root].base.shares.max(1)
}

fn percent_to_shares(percent: u32, total: u64) -> u64 {
    (total * percent as u64) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_admits_children_within_its_min_limit() {
        let mut tree = GroupTree::new(100_000);
        let g1 = tree
            .create_group(tree.root(), "g1", NodeAlloc::group(40, 100, 1), NodeMemAlloc::default())
            .unwrap();
        tree.node_mut(g1).unwrap().base.emin = percent_to_shares(40, 100_000);
        let g2 = tree.create_group(tree.root(), "g2", NodeAlloc::group(40, 100, 1), NodeMemAlloc::default());
        assert!(g2.is_ok());
    }

    #[test]
    fn over_committing_min_fails_admission() {
        let mut tree = GroupTree::new(100_000);
        let result = tree.create_group(
            tree.root(),
            "too-big",
            NodeAlloc::group(101, 100, 1),
            NodeMemAlloc::default(),
        );
        assert_eq!(result, Err(ScheduleError::AdmitFailed));
    }

    #[test]
    fn destroy_requires_empty_group() {
        let mut tree = GroupTree::new(100_000);
        let g1 = tree
            .create_group(tree.root(), "g1", NodeAlloc::group(10, 100, 1), NodeMemAlloc::default())
            .unwrap();
        let mut vcpu_ids: SlotMap<VsmpId, ()> = SlotMap::with_key();
        let vsmp_id = vcpu_ids.insert(());
        tree.create_vsmp_leaf(g1, vsmp_id, "vm1", NodeAlloc::leaf(0, 100, 1000), NodeMemAlloc::default())
            .unwrap();
        assert_eq!(tree.destroy(g1), Err(ScheduleError::Busy));
    }
}
