//! Pointer-free identities for the scheduler's arenas.
//!
//! The legacy scheduler embeds linked lists directly in the host `World`
//! struct; here queues and ownership edges hold small integer ids instead
//! of pointers, which is what makes cell migration, snapshotting, and the
//! property tests possible without unsafe aliasing.

use slotmap::new_key_type;

new_key_type! {
    /// A single virtual processor.
    pub struct VcpuId;
}

new_key_type! {
    /// A guest (collection of vcpus scheduled as a unit).
    pub struct VsmpId;
}

new_key_type! {
    /// A node in the group tree: either an internal group or a vsmp leaf.
    pub struct GroupId;
}

new_key_type! {
    /// A scheduler cell (locking domain / partition of pcpus).
    pub struct CellId;
}

new_key_type! {
    /// A memory-scheduler client (guest or userworld).
    pub struct ClientId;
}

/// Physical cpus are a small, fixed set per cell; plain indices suffice.
pub type PcpuIndex = usize;
