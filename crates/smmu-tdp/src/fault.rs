use smmu_core::{Gfn, Gpa, HostFrame, MemorySlot, PageLevel, gfn_from_gpa};

bitflags::bitflags! {
    /// Raw access-violation cause bits reported with a fault.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ErrorCode: u32 {
        /// The translation was present; the fault is a permission violation.
        const PRESENT = 1 << 0;

        /// The access was a write.
        const WRITE = 1 << 1;

        /// The access originated in user mode.
        const USER = 1 << 2;

        /// The translation had reserved bits set.
        const RSVD = 1 << 3;

        /// The access was an instruction fetch.
        const FETCH = 1 << 4;

        /// The access targeted confidential/private memory.
        const PRIVATE = 1 << 5;
    }
}

/// The terminal outcome of a fault resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Internal only: so far so good, keep resolving. Never returned to the
    /// caller.
    Continue,

    /// A transient race or staleness was detected; re-enter the guest and
    /// let hardware fault again.
    Retry,

    /// The translation cannot or should not be completed directly; hand the
    /// faulting instruction to software emulation.
    Emulate,

    /// The GFN is under dirty-tracking write protection; unprotect and
    /// retry, or emulate.
    WriteProtected,

    /// The observed in-place entry is structurally invalid; fall back to
    /// the full fault path to rebuild it.
    Invalid,

    /// A new or repaired entry was installed.
    Fixed,

    /// Another concurrent fault already fixed this exact entry.
    Spurious,
}

/// One in-flight fault. Ephemeral; never persisted.
#[derive(Debug)]
pub struct Fault {
    /// Faulting guest physical address.
    pub addr: Gpa,

    /// Raw access-violation cause bits.
    pub error_code: ErrorCode,

    /// Whether this is a speculative/prefetch fault.
    pub prefetch: bool,

    /// The access was an instruction fetch.
    pub exec: bool,

    /// The access was a write.
    pub write: bool,

    /// The faulting translation was present.
    pub present: bool,

    /// The faulting translation had reserved bits set.
    pub rsvd: bool,

    /// The access originated in user mode.
    pub user: bool,

    /// Whether the active root is direct (identity-mapped) rather than
    /// guest-page-table-walked. Filled in against the root.
    pub is_direct: bool,

    /// Whether the target memory is confidential/private.
    pub is_private: bool,

    /// Whether the NX huge page workaround applies to this fault.
    pub nx_huge_page_workaround_enabled: bool,

    /// Whether a larger-than-4KB mapping was forbidden by the workaround.
    pub huge_page_disallowed: bool,

    /// Largest page size hardware/guest capability permits.
    pub max_level: PageLevel,

    /// Page size achievable after intersecting with the host mapping.
    pub req_level: PageLevel,

    /// Page size that will actually be created.
    pub goal_level: PageLevel,

    /// Resolved guest frame number. For a direct root the alias-selecting
    /// address bits are already stripped.
    pub gfn: Gfn,

    /// The memory slot containing `gfn`. Absent for unbacked/MMIO space.
    pub slot: Option<MemorySlot>,

    /// Snapshot of the translation-state sequence number at fault entry.
    pub snapshot: u64,

    /// The host frame backing `gfn`, once faulted in.
    pub host: Option<HostFrame>,

    /// The faulting write targets memory holding translation entries used
    /// to translate the write itself; direct completion would install a
    /// self-referential write, so emulation is preferred.
    pub write_fault_to_shadow_pgtable: bool,
}

impl Fault {
    /// Classifies a raw fault into its derived predicates.
    pub fn new(addr: Gpa, error_code: ErrorCode, prefetch: bool) -> Self {
        Self {
            addr,
            error_code,
            prefetch,
            exec: error_code.contains(ErrorCode::FETCH),
            write: error_code.contains(ErrorCode::WRITE),
            present: error_code.contains(ErrorCode::PRESENT),
            rsvd: error_code.contains(ErrorCode::RSVD),
            user: error_code.contains(ErrorCode::USER),
            is_direct: false,
            is_private: error_code.contains(ErrorCode::PRIVATE),
            nx_huge_page_workaround_enabled: false,
            huge_page_disallowed: false,
            max_level: PageLevel::Pt,
            req_level: PageLevel::Pt,
            goal_level: PageLevel::Pt,
            gfn: gfn_from_gpa(addr),
            slot: None,
            snapshot: 0,
            host: None,
            write_fault_to_shadow_pgtable: false,
        }
    }
}
