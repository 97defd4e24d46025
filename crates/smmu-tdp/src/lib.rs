//! Shadow / two-dimensional paging MMU.
//!
//! Maintains a tree of shadow page table nodes translating guest frame
//! numbers to host frames, resolves guest faults against it and keeps the
//! auxiliary structures (reverse map, unsync tracker, NX huge page list)
//! consistent with the tree under one structural lock.
//!
//! The entry point is [`ShadowMmu`]: construct it over a
//! [`MemorySlots`](smmu_core::MemorySlots) registry, allocate a root per
//! role with [`ShadowMmu::alloc_root`] and feed guest faults to
//! [`ShadowMmu::resolve_fault`]. Retired nodes linger on a
//! [`ReclaimQueue`] until every walk that could still observe them has
//! finished.

mod fault;
mod mmu;
mod node;
mod nx;
mod reclaim;
mod rmap;
mod role;
mod store;
mod unsync;

pub use fault::{ErrorCode, Fault, FaultDisposition};
pub use mmu::{MmuConfig, ShadowMmu};
pub use node::{NodeHandle, RefCount, ShadowNode, UnsyncBitmap};
pub use nx::NxHugePages;
pub use reclaim::{EpochGuard, RECLAIM_BATCH, ReclaimQueue};
pub use rmap::{ReverseMap, RmapSlot};
pub use role::{AddressSpaceId, NodeRole};
pub use store::NodeStore;
pub use unsync::TryUnsync;

#[cfg(test)]
mod mmu_tests;
