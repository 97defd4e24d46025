use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use smmu_core::{ENTRIES_PER_TABLE, EntryTable, Gfn, MemoryAccess, PAGE_SHIFT, TableEntry};

use crate::NodeRole;

/// A stable handle addressing a node in the store's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHandle(pub u32);

impl std::fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reference count of a shadow node.
///
/// The variant is chosen at creation from the node's role: direct-root
/// (TDP) nodes take references from lock-free walkers, guest-walked nodes
/// only under the structural lock. Both counts are kept distinguishable
/// instead of sharing storage.
#[derive(Debug)]
pub enum RefCount {
    /// References taken under the structural lock (guest-walked trees).
    Shared(AtomicU32),

    /// References that may be taken by lock-free direct-root walkers.
    Tdp(AtomicU32),
}

impl RefCount {
    /// Creates a zeroed count appropriate for `role`.
    pub fn for_role(role: &NodeRole) -> Self {
        if role.direct {
            Self::Tdp(AtomicU32::new(0))
        } else {
            Self::Shared(AtomicU32::new(0))
        }
    }

    fn cell(&self) -> &AtomicU32 {
        match self {
            Self::Shared(count) => count,
            Self::Tdp(count) => count,
        }
    }

    /// Returns the current count.
    pub fn get(&self) -> u32 {
        self.cell().load(Ordering::Acquire)
    }

    /// Increments the count, returning the new value.
    pub fn inc(&self) -> u32 {
        self.cell().fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the count, returning the new value.
    pub fn dec(&self) -> u32 {
        let previous = self.cell().fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "refcount underflow");
        previous - 1
    }
}

/// A 512-bit per-child bitmap tracking which entries of an unsynced node
/// have diverged from the guest table they shadow.
#[derive(Default)]
pub struct UnsyncBitmap {
    words: [AtomicU64; ENTRIES_PER_TABLE / 64],
}

impl UnsyncBitmap {
    /// Marks the child at `index`, returning `true` if it was newly set.
    pub fn set(&self, index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        self.words[index / 64].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Clears the child at `index`, returning `true` if it was set.
    pub fn clear(&self, index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        self.words[index / 64].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Checks whether the child at `index` is marked.
    pub fn contains(&self, index: usize) -> bool {
        self.words[index / 64].load(Ordering::Acquire) & (1 << (index % 64)) != 0
    }

    /// Returns the indices of all marked children.
    pub fn indices(&self) -> Vec<usize> {
        let mut result = Vec::new();
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                result.push(word_index * 64 + bit);
                bits &= bits - 1;
            }
        }
        result
    }

    /// Checks whether any child is marked.
    pub fn any(&self) -> bool {
        self.words
            .iter()
            .any(|word| word.load(Ordering::Acquire) != 0)
    }
}

impl std::fmt::Debug for UnsyncBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("UnsyncBitmap")
            .field("marked", &self.indices().len())
            .finish()
    }
}

/// Marker bit distinguishing a recorded shadowed translation from an empty
/// side-array slot. Sits between the access bits and the frame bits.
const SHADOWED_VALID: u64 = 1 << 3;

/// One level of the shadow translation tree.
///
/// Identity (role + GFN) is immutable after creation; only content mutates.
/// All mutable state is atomic so a node may be observed through a shared
/// reference while the mutator holds the structural lock.
pub struct ShadowNode {
    role: NodeRole,
    gfn: Gfn,

    entries: Box<EntryTable>,

    /// For guest-walked nodes, the guest translation each leaf slot shadows:
    /// GFN in the upper bits, access bits below the page shift.
    shadowed: Option<Box<EntryTable>>,

    refs: RefCount,

    unsynced: AtomicBool,

    /// Set when this node exists only because a larger executable mapping
    /// was vetoed by the NX huge page mitigation.
    nx_huge_page_disallowed: AtomicBool,

    /// Write faults on this node since the last retranslation visited it.
    write_flood: AtomicU32,

    unsync_children: UnsyncBitmap,
}

impl ShadowNode {
    /// Creates a node from an allocator-supplied zeroed table.
    ///
    /// Guest-walked nodes additionally carry the shadowed-translation side
    /// array.
    pub fn new(role: NodeRole, gfn: Gfn, entries: Box<EntryTable>, shadowed: Option<Box<EntryTable>>) -> Self {
        debug_assert!(role.direct || shadowed.is_some());

        Self {
            refs: RefCount::for_role(&role),
            role,
            gfn,
            entries,
            shadowed,
            unsynced: AtomicBool::new(false),
            nx_huge_page_disallowed: AtomicBool::new(false),
            write_flood: AtomicU32::new(0),
            unsync_children: UnsyncBitmap::default(),
        }
    }

    /// Returns the node's role.
    pub fn role(&self) -> &NodeRole {
        &self.role
    }

    /// Returns the guest frame number half of the node's key.
    pub fn gfn(&self) -> Gfn {
        self.gfn
    }

    /// Returns the node's translation entries.
    pub fn entries(&self) -> &EntryTable {
        &self.entries
    }

    /// Returns the node's reference count.
    pub fn refs(&self) -> &RefCount {
        &self.refs
    }

    /// Returns the per-child divergence bitmap.
    pub fn unsync_children(&self) -> &UnsyncBitmap {
        &self.unsync_children
    }

    /// Checks whether the node is allowed to diverge from its guest table.
    pub fn unsynced(&self) -> bool {
        self.unsynced.load(Ordering::Acquire)
    }

    /// Sets or clears the unsynced flag.
    pub fn set_unsynced(&self, unsynced: bool) {
        self.unsynced.store(unsynced, Ordering::Release);
    }

    /// Checks whether the node is a huge-page-veto placeholder.
    pub fn nx_huge_page_disallowed(&self) -> bool {
        self.nx_huge_page_disallowed.load(Ordering::Acquire)
    }

    /// Marks or unmarks the node as a huge-page-veto placeholder.
    pub fn set_nx_huge_page_disallowed(&self, disallowed: bool) {
        self.nx_huge_page_disallowed.store(disallowed, Ordering::Release);
    }

    /// Records one write fault, returning the updated flood count.
    pub fn flood_inc(&self) -> u32 {
        self.write_flood.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the current flood count.
    pub fn flood(&self) -> u32 {
        self.write_flood.load(Ordering::Acquire)
    }

    /// Resets the flood count; called when a retranslation visits the node.
    pub fn flood_reset(&self) {
        self.write_flood.store(0, Ordering::Release);
    }

    /// Records the guest translation shadowed by the leaf slot at `index`.
    pub fn shadowed_set(&self, index: usize, gfn: Gfn, access: MemoryAccess) {
        if let Some(shadowed) = &self.shadowed {
            let value = (gfn.0 << PAGE_SHIFT) | SHADOWED_VALID | u64::from(access.bits());
            shadowed.set(index, TableEntry(value));
        }
    }

    /// Returns the guest translation shadowed by the leaf slot at `index`.
    pub fn shadowed_get(&self, index: usize) -> Option<(Gfn, MemoryAccess)> {
        let value = self.shadowed.as_ref()?.get(index).0;
        if value & SHADOWED_VALID == 0 {
            return None;
        }

        let gfn = Gfn(value >> PAGE_SHIFT);
        let access = MemoryAccess::from_bits_truncate((value & 0b111) as u8);
        Some((gfn, access))
    }

    /// Clears the shadowed translation at `index`.
    pub fn shadowed_clear(&self, index: usize) {
        if let Some(shadowed) = &self.shadowed {
            shadowed.set(index, TableEntry::INVALID);
        }
    }
}

impl std::fmt::Debug for ShadowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ShadowNode")
            .field("role", &self.role)
            .field("gfn", &self.gfn)
            .field("refs", &self.refs.get())
            .field("unsynced", &self.unsynced())
            .field("nx_huge_page_disallowed", &self.nx_huge_page_disallowed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use smmu_core::PageLevel;

    use super::*;
    use crate::AddressSpaceId;

    fn direct_node() -> ShadowNode {
        ShadowNode::new(
            NodeRole::direct(PageLevel::Pt, AddressSpaceId(0)),
            Gfn(0),
            Box::new(EntryTable::zeroed()),
            None,
        )
    }

    #[test]
    fn refcount_round_trip() {
        let node = direct_node();
        assert_eq!(node.refs().get(), 0);
        assert_eq!(node.refs().inc(), 1);
        assert_eq!(node.refs().inc(), 2);
        assert_eq!(node.refs().dec(), 1);
        assert_eq!(node.refs().dec(), 0);
    }

    #[test]
    fn refcount_variant_follows_role() {
        let node = direct_node();
        assert!(matches!(node.refs(), RefCount::Tdp(_)));

        let node = ShadowNode::new(
            NodeRole::shadowed(PageLevel::Pt, AddressSpaceId(0)),
            Gfn(0),
            Box::new(EntryTable::zeroed()),
            Some(Box::new(EntryTable::zeroed())),
        );
        assert!(matches!(node.refs(), RefCount::Shared(_)));
    }

    #[test]
    fn bitmap_set_clear() {
        let bitmap = UnsyncBitmap::default();
        assert!(!bitmap.any());
        assert!(bitmap.set(5));
        assert!(!bitmap.set(5));
        assert!(bitmap.set(511));
        assert_eq!(bitmap.indices(), vec![5, 511]);
        assert!(bitmap.clear(5));
        assert!(!bitmap.clear(5));
        assert_eq!(bitmap.indices(), vec![511]);
    }

    #[test]
    fn shadowed_translation_round_trip() {
        let node = ShadowNode::new(
            NodeRole::shadowed(PageLevel::Pt, AddressSpaceId(0)),
            Gfn(0x30),
            Box::new(EntryTable::zeroed()),
            Some(Box::new(EntryTable::zeroed())),
        );

        assert_eq!(node.shadowed_get(0), None);

        node.shadowed_set(0, Gfn(0x77), MemoryAccess::RW);
        assert_eq!(node.shadowed_get(0), Some((Gfn(0x77), MemoryAccess::RW)));

        // GFN zero with empty access is still a recorded translation.
        node.shadowed_set(1, Gfn(0), MemoryAccess::empty());
        assert_eq!(node.shadowed_get(1), Some((Gfn(0), MemoryAccess::empty())));

        node.shadowed_clear(0);
        assert_eq!(node.shadowed_get(0), None);
    }

    #[test]
    fn flood_counts_and_resets() {
        let node = direct_node();
        assert_eq!(node.flood_inc(), 1);
        assert_eq!(node.flood_inc(), 2);
        node.flood_reset();
        assert_eq!(node.flood(), 0);
    }
}
