use std::sync::atomic::{AtomicU64, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Hfn, MemoryAccess, PageLevel};

/// Number of translation entries in one table node.
pub const ENTRIES_PER_TABLE: usize = 512;

const PRESENT: u64 = 1;
const WRITABLE: u64 = 1 << 1;
const USER: u64 = 1 << 2;
const LARGE: u64 = 1 << 7;
const NX: u64 = 1 << 63;

/// Frame bits 51:12.
const FRAME_MASK: u64 = ((1 << 40) - 1) << 12;

/// A single 64-bit shadow translation entry.
///
/// An entry is either invalid (not present), a non-leaf reference to a
/// lower-level node, or a terminal leaf translation. Non-leaf entries carry
/// the child node's arena index in the frame field; leaf entries carry the
/// host frame number.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TableEntry(pub u64);

impl TableEntry {
    /// The invalid (not present) entry.
    pub const INVALID: TableEntry = TableEntry(0);

    /// Creates a terminal leaf translation to `hfn` with the given access.
    ///
    /// Leaves above [`PageLevel::Pt`] carry the large bit.
    pub fn leaf(hfn: Hfn, access: MemoryAccess, level: PageLevel) -> Self {
        let mut value = PRESENT | USER | (hfn.0 << 12) & FRAME_MASK;
        if access.contains(MemoryAccess::W) {
            value |= WRITABLE;
        }
        if !access.contains(MemoryAccess::X) {
            value |= NX;
        }
        if level > PageLevel::Pt {
            value |= LARGE;
        }
        Self(value)
    }

    /// Creates a non-leaf reference to the child node at arena index `child`.
    pub fn table(child: u64) -> Self {
        Self(PRESENT | WRITABLE | USER | (child << 12) & FRAME_MASK)
    }

    /// Checks if the entry is present.
    pub fn present(self) -> bool {
        self.0 & PRESENT != 0
    }

    /// Checks if the translation is writable.
    pub fn writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    /// Checks if the translation is executable.
    pub fn executable(self) -> bool {
        self.0 & NX == 0
    }

    /// Checks if the translation is accessible in user mode.
    pub fn user(self) -> bool {
        self.0 & USER != 0
    }

    /// Checks if this entry is a large leaf mapping.
    pub fn large(self) -> bool {
        self.0 & LARGE != 0
    }

    /// Checks if the entry terminates the walk at `level`.
    pub fn is_leaf(self, level: PageLevel) -> bool {
        self.present() && (level == PageLevel::Pt || self.large())
    }

    /// Extracts the host frame number of a leaf translation.
    pub fn frame(self) -> Hfn {
        Hfn((self.0 & FRAME_MASK) >> 12)
    }

    /// Extracts the child arena index of a non-leaf entry.
    pub fn child_index(self) -> u64 {
        (self.0 & FRAME_MASK) >> 12
    }

    /// Returns the access permitted by this entry.
    pub fn access(self) -> MemoryAccess {
        let mut access = MemoryAccess::empty();
        if self.present() {
            access |= MemoryAccess::R;
        }
        if self.writable() {
            access |= MemoryAccess::W;
        }
        if self.executable() {
            access |= MemoryAccess::X;
        }
        access
    }

    /// Returns this entry with write access removed.
    pub fn write_protected(self) -> Self {
        Self(self.0 & !WRITABLE)
    }
}

impl std::fmt::Debug for TableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TableEntry")
            .field("present", &self.present())
            .field("writable", &self.writable())
            .field("executable", &self.executable())
            .field("user", &self.user())
            .field("large", &self.large())
            .field("frame", &self.frame())
            .finish()
    }
}

/// A 512-entry table of atomically readable and writable entries.
///
/// Every store is a single atomic operation, so a concurrent lock-free
/// reader observes either the previous or the new entry, never a torn one.
pub struct EntryTable {
    entries: Box<[AtomicU64; ENTRIES_PER_TABLE]>,
}

impl EntryTable {
    /// Allocates a zeroed table.
    pub fn zeroed() -> Self {
        Self {
            entries: Box::new([const { AtomicU64::new(0) }; ENTRIES_PER_TABLE]),
        }
    }

    /// Reads the entry at `index`.
    pub fn get(&self, index: usize) -> TableEntry {
        TableEntry(self.entries[index].load(Ordering::Acquire))
    }

    /// Installs `entry` at `index` in one atomically-visible store.
    pub fn set(&self, index: usize, entry: TableEntry) {
        self.entries[index].store(entry.0, Ordering::Release);
    }

    /// Returns the indices of all present entries.
    pub fn present_indices(&self) -> Vec<usize> {
        (0..ENTRIES_PER_TABLE)
            .filter(|&index| self.get(index).present())
            .collect()
    }
}

impl Default for EntryTable {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for EntryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EntryTable")
            .field("present", &self.present_indices().len())
            .finish()
    }
}
