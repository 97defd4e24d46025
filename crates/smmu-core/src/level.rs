use crate::Gfn;

/// The levels in the shadow page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum PageLevel {
    /// Page Table (PT) - the lowest level, pointing directly to 4KB frames.
    Pt = 1,

    /// Page Directory (PD) - can point to PTs or 2MB leaf mappings.
    Pd = 2,

    /// Page Directory Pointer Table (PDPT) - can point to PDs or 1GB leaf
    /// mappings.
    Pdpt = 3,

    /// Page Map Level 4 (PML4) - the highest level in the modeled format.
    Pml4 = 4,
}

/// Number of address bits indexed by one table level.
const BITS_PER_LEVEL: u64 = 9;

impl PageLevel {
    /// The root level of the modeled 4-level format.
    pub const ROOT: PageLevel = PageLevel::Pml4;

    /// Returns the next lower level in the hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pt => None,
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
        }
    }

    /// Returns the next higher level in the hierarchy.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Pt => Some(Self::Pd),
            Self::Pd => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pml4),
            Self::Pml4 => None,
        }
    }

    /// Returns the GFN bit position at which this level's index starts.
    pub const fn shift(self) -> u64 {
        (self as u64 - 1) * BITS_PER_LEVEL
    }

    /// Returns the number of 4KB frames covered by one leaf at this level.
    pub const fn pages(self) -> u64 {
        1 << self.shift()
    }

    /// Returns the 9-bit slice of `gfn` that indexes a table at this level.
    pub const fn table_index(self, gfn: Gfn) -> usize {
        ((gfn.0 >> self.shift()) & ((1 << BITS_PER_LEVEL) - 1)) as usize
    }
}
