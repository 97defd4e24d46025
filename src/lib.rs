//! Shadow/TDP MMU core for a hardware-virtualization hypervisor.
//!
//! This crate is a facade over [`smmu_core`] (shared value types and the
//! collaborator traits) and [`smmu_tdp`] (the fault-resolution engine).
//! See [`ShadowMmu`] for the entry point.

pub use smmu_core::{
    ENTRIES_PER_TABLE, EntryTable, Gfn, Gpa, HeapAllocator, Hfn, Hpa, HostFrame, MemoryAccess,
    MemorySlot, MemorySlots, MmuError, NodeAllocator, PAGE_SHIFT, PAGE_SIZE, PageLevel,
    TableEntry, TlbFlush, gfn_from_gpa, gfn_round_for_level, gpa_from_gfn,
};
pub use smmu_tdp::{
    AddressSpaceId, EpochGuard, ErrorCode, Fault, FaultDisposition, MmuConfig, NodeHandle,
    NodeRole, NodeStore, NxHugePages, ReclaimQueue, RefCount, ReverseMap, RmapSlot, ShadowMmu,
    ShadowNode, TryUnsync, UnsyncBitmap,
};
