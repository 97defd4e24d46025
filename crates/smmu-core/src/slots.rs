use crate::{EntryTable, Gfn, Hfn, MemoryAccess, PageLevel};

/// A registered range of guest frames and the permissions it grants.
///
/// Slots are owned by an external registry; the MMU only ever holds copies
/// handed out by [`MemorySlots::slot_for`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySlot {
    /// First guest frame covered by the slot.
    pub base_gfn: Gfn,

    /// Number of frames covered by the slot.
    pub pages: u64,

    /// Access permitted to the guest for this range.
    pub access: MemoryAccess,

    /// Whether the slot backs confidential/private guest memory.
    pub private: bool,
}

impl MemorySlot {
    /// Checks whether `gfn` falls inside the slot.
    pub fn contains(&self, gfn: Gfn) -> bool {
        gfn >= self.base_gfn && gfn.0 < self.base_gfn.0 + self.pages
    }
}

/// The host backing of one guest frame, produced by faulting it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFrame {
    /// Host frame number backing the guest frame.
    pub hfn: Hfn,

    /// Whether the host mapping permits writes.
    pub writable: bool,

    /// Whether the frame carries an extra reference that the caller must
    /// drop once the translation is installed or abandoned.
    pub refcounted: bool,

    /// Granularity of the host mapping containing the frame. A shadow leaf
    /// can never be larger than this.
    pub level: PageLevel,
}

/// The external memory-slot registry.
pub trait MemorySlots {
    /// Returns the slot containing `gfn`, or `None` for unbacked/MMIO space.
    fn slot_for(&self, gfn: Gfn) -> Option<MemorySlot>;

    /// Returns the largest mapping level the host backing permits at `gfn`.
    fn max_mapping_level(&self, slot: &MemorySlot, gfn: Gfn) -> PageLevel;

    /// Faults in the host page backing `gfn`. `None` means the backing is
    /// momentarily unavailable (host paging activity); the fault retries.
    fn host_frame(&self, slot: &MemorySlot, gfn: Gfn) -> Option<HostFrame>;
}

/// The host TLB shootdown primitive.
pub trait TlbFlush {
    /// Flushes any cached translation for the page (huge or not) containing
    /// `gfn` at `level`.
    fn flush_range(&self, gfn: Gfn, level: PageLevel);
}

/// The raw allocator supplying zeroed table-sized pages.
pub trait NodeAllocator {
    /// Allocates a zeroed 512-entry table, or `None` when out of resources.
    fn alloc_table(&self) -> Option<Box<EntryTable>>;
}

/// A [`NodeAllocator`] backed by the process heap. Never fails.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl NodeAllocator for HeapAllocator {
    fn alloc_table(&self) -> Option<Box<EntryTable>> {
        Some(Box::new(EntryTable::zeroed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_bounds() {
        let slot = MemorySlot {
            base_gfn: Gfn(0x100),
            pages: 0x10,
            access: MemoryAccess::RWX,
            private: false,
        };

        assert!(slot.contains(Gfn(0x100)));
        assert!(slot.contains(Gfn(0x10f)));
        assert!(!slot.contains(Gfn(0x110)));
        assert!(!slot.contains(Gfn(0xff)));
    }
}
