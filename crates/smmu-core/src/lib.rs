//! Core types for the shadow/TDP MMU.
//!
//! This crate holds the value types shared by every layer of the MMU
//! (guest/host frame numbers and addresses, page-table levels, the 64-bit
//! shadow table entry) together with the traits through which the MMU
//! consumes its collaborators: the memory-slot registry, the host TLB
//! primitive, and the table-page allocator.

mod access;
mod addr;
mod entry;
mod error;
mod level;
mod slots;

pub use self::{
    access::MemoryAccess,
    addr::{Gfn, Gpa, Hfn, Hpa, PAGE_SHIFT, PAGE_SIZE, gfn_from_gpa, gfn_round_for_level, gpa_from_gfn},
    entry::{ENTRIES_PER_TABLE, EntryTable, TableEntry},
    error::MmuError,
    slots::{HeapAllocator, HostFrame, MemorySlot, MemorySlots, NodeAllocator, TlbFlush},
};
pub use self::level::PageLevel;
