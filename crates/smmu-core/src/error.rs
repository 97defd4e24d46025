use crate::Gfn;

/// An error that can occur while resolving a fault.
///
/// Transient races are never errors; they surface as retryable fault
/// dispositions. Only resource exhaustion and contract violations reach
/// this type.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MmuError {
    /// The table-page allocator is out of resources. The current fault is
    /// aborted with no tree mutation; the caller may retry after reclaim.
    #[error("Out of table nodes")]
    OutOfNodes,

    /// Instruction emulation was requested against confidential/private
    /// memory. No safe recovery exists; surfaced to the outer control loop.
    #[error("Emulation requested on private memory at {0}")]
    PrivateMemoryEmulation(Gfn),

    /// No active root exists for the faulting context.
    #[error("Root not present")]
    RootNotPresent,
}
