use smmu_core::PageLevel;

/// An address space identifier (e.g. normal vs. system-management mode).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(pub u8);

impl std::fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The immutable identity of a shadow page table node.
///
/// Together with the node's guest frame number, the role forms the key under
/// which the node is registered in the store. Two nodes with identical role
/// and GFN are the same logical table and are deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRole {
    /// The level of the table within the shadow tree.
    pub level: PageLevel,

    /// The guest address space the table translates for.
    pub address_space: AddressSpaceId,

    /// Whether the table shadows a guest-controlled page table (as opposed
    /// to an identity-mapped range).
    pub guest_mode: bool,

    /// Whether the table belongs to a direct (identity-mapped) root.
    pub direct: bool,

    /// Whether the table maps confidential/private guest memory through a
    /// mirrored root.
    pub mirror: bool,

    /// Whether the table grants execute-only access.
    pub execute_only: bool,
}

impl NodeRole {
    /// Creates the role of a direct (identity-mapped) table at `level`.
    pub fn direct(level: PageLevel, address_space: AddressSpaceId) -> Self {
        Self {
            level,
            address_space,
            guest_mode: false,
            direct: true,
            mirror: false,
            execute_only: false,
        }
    }

    /// Creates the role of a guest-walked (shadowing) table at `level`.
    pub fn shadowed(level: PageLevel, address_space: AddressSpaceId) -> Self {
        Self {
            level,
            address_space,
            guest_mode: true,
            direct: false,
            mirror: false,
            execute_only: false,
        }
    }

    /// Derives the role of a child table one level below this one.
    ///
    /// All identity fields other than the level are inherited.
    pub fn child(self) -> Option<Self> {
        Some(Self {
            level: self.level.next()?,
            ..self
        })
    }
}
